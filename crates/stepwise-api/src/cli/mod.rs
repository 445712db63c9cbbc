//! CLI command definitions for the `stepw` binary.
//!
//! Every engine operation is one subcommand. Tokens are passed back verbatim
//! from the previous response; `--json` prints the engine's response shapes
//! unchanged so scripts can pipe them into the next call.

pub mod keys;
pub mod session;
pub mod workflow;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde_json::{Map, Value};
use stepwise_types::event::Autonomy;

/// Drive durable, resumable multi-step workflows.
#[derive(Parser)]
#[command(name = "stepw", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (sessions, snapshots, keys, workflows).
    #[arg(long, global = true, env = "STEPWISE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new session of a workflow.
    Start {
        /// Workflow id.
        workflow_id: String,

        /// Initial context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// How output-contract violations are handled for this session.
        #[arg(long, value_enum)]
        autonomy: Option<AutonomyArg>,
    },

    /// Advance past the pending step, or rehydrate when no ack token is given.
    #[command(name = "continue", alias = "next")]
    Continue {
        /// State token from the previous response.
        #[arg(long, value_parser = token_arg)]
        state_token: String,

        /// Ack token from the previous response; omit to rehydrate.
        #[arg(long, value_parser = token_arg)]
        ack_token: Option<String>,

        /// Step output as a JSON value.
        #[arg(long, conflicts_with = "output_file")]
        output: Option<String>,

        /// Read the step output from a JSON file.
        #[arg(long)]
        output_file: Option<PathBuf>,

        /// Context updates as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Step instance the caller completed, as a JSON object.
        #[arg(long)]
        completed_step: Option<String>,

        /// Free-text note recorded in the logs.
        #[arg(long)]
        intent: Option<String>,
    },

    /// Record a checkpoint on the node a checkpoint token points at.
    Checkpoint {
        #[arg(long, value_parser = token_arg)]
        checkpoint_token: String,
    },

    /// Change execution preferences for a session.
    Preferences {
        /// Any state token of the session.
        #[arg(long, value_parser = token_arg)]
        state_token: String,

        #[arg(long, value_enum)]
        autonomy: AutonomyArg,
    },

    /// Show the projected truth of a session.
    Inspect {
        session_id: String,
    },

    /// List sessions with a durable log.
    Sessions,

    /// List available workflows.
    #[command(alias = "ls")]
    Workflows,

    /// Explain how a step's run condition evaluates against a context.
    Explain {
        workflow_id: String,
        step_id: String,

        /// Context as a JSON object.
        #[arg(long)]
        context: Option<String>,
    },

    /// Manage the token signing keyring.
    Keys {
        #[command(subcommand)]
        action: keys::KeysCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AutonomyArg {
    /// Block the advance and report what is missing.
    Guided,
    /// Record a gap and advance anyway.
    NeverStop,
}

impl From<AutonomyArg> for Autonomy {
    fn from(arg: AutonomyArg) -> Self {
        match arg {
            AutonomyArg::Guided => Autonomy::Guided,
            AutonomyArg::NeverStop => Autonomy::NeverStop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Default log filter for the verbosity flags; `RUST_LOG` overrides it.
pub fn log_directive(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,stepwise_core=debug,stepwise_infra=debug",
        _ => "trace",
    }
}

/// Token flags drop whitespace picked up from copy-paste; the engine
/// itself only accepts exact token strings.
fn token_arg(raw: &str) -> std::result::Result<String, String> {
    Ok(raw.trim().to_string())
}

/// Parse an optional `--flag '{...}'` argument into a JSON object.
pub fn parse_object(flag: &str, raw: Option<&str>) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str(raw).with_context(|| format!("--{flag} is not valid JSON"))? {
        Value::Object(map) => Ok(Some(map)),
        other => bail!("--{flag} must be a JSON object, got {}", json_kind(&other)),
    }
}

/// Parse an optional JSON value argument.
pub fn parse_value(flag: &str, raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|raw| serde_json::from_str(raw).with_context(|| format!("--{flag} is not valid JSON")))
        .transpose()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn continue_parses_tokens_and_output() {
        let cli = Cli::try_parse_from([
            "stepw",
            "continue",
            "--state-token",
            "st1abc",
            "--ack-token",
            "ack1def",
            "--output",
            r#"{"summary":"ok"}"#,
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::Continue {
            state_token,
            ack_token,
            output,
            ..
        } = cli.command
        else {
            panic!("expected continue");
        };
        assert_eq!(state_token, "st1abc");
        assert_eq!(ack_token.as_deref(), Some("ack1def"));
        assert_eq!(output.as_deref(), Some(r#"{"summary":"ok"}"#));
    }

    #[test]
    fn pasted_tokens_are_trimmed() {
        let cli = Cli::try_parse_from(["stepw", "checkpoint", "--checkpoint-token", " chk1abc\n"]).unwrap();
        let Commands::Checkpoint { checkpoint_token } = cli.command else {
            panic!("expected checkpoint");
        };
        assert_eq!(checkpoint_token, "chk1abc");
    }

    #[test]
    fn output_and_output_file_conflict() {
        let result = Cli::try_parse_from([
            "stepw",
            "continue",
            "--state-token",
            "st1",
            "--output",
            "{}",
            "--output-file",
            "out.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn autonomy_values_use_kebab_case() {
        let cli = Cli::try_parse_from(["stepw", "start", "review", "--autonomy", "never-stop"]).unwrap();
        let Commands::Start { autonomy, .. } = cli.command else {
            panic!("expected start");
        };
        assert_eq!(autonomy.map(Autonomy::from), Some(Autonomy::NeverStop));
    }

    #[test]
    fn object_flags_reject_non_objects() {
        assert!(parse_object("context", None).unwrap().is_none());
        assert_eq!(
            parse_object("context", Some(r#"{"a":1}"#)).unwrap().unwrap()["a"],
            serde_json::json!(1)
        );
        let err = parse_object("context", Some("[1]")).unwrap_err();
        assert_eq!(err.to_string(), "--context must be a JSON object, got an array");
        assert!(parse_object("context", Some("{")).is_err());
    }

    #[test]
    fn verbosity_maps_to_directives() {
        assert_eq!(log_directive(0, true), "error");
        assert_eq!(log_directive(0, false), "warn");
        assert_eq!(log_directive(3, false), "trace");
    }
}
