//! `stepw`: command-line front end for the stepwise workflow engine.
//!
//! Parses CLI arguments, initializes tracing and the engine, then dispatches
//! to the command handler. Engine failures surface as `{code, message}`.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use console::style;
use stepwise_core::engine::EngineError;
use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing, LogFormat, TracingOptions};

use cli::{Cli, Commands, LogFormatArg};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let options = TracingOptions {
        format: match cli.log_format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        },
        enable_otel: cli.otel,
        default_directive: cli::log_directive(cli.verbose, cli.quiet).to_string(),
    };
    if let Err(e) = init_tracing(options) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    let json = cli.json;
    let result = run(cli).await;
    shutdown_tracing();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err, json);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepw", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.data_dir).await?;
    let json = cli.json;

    match cli.command {
        Commands::Start {
            workflow_id,
            context,
            autonomy,
        } => cli::session::start(&state, workflow_id, context.as_deref(), autonomy, json).await,

        Commands::Continue {
            state_token,
            ack_token,
            output,
            output_file,
            context,
            completed_step,
            intent,
        } => {
            let args = cli::session::ContinueArgs {
                state_token,
                ack_token,
                output: output.as_deref(),
                output_file: output_file.as_deref(),
                context: context.as_deref(),
                completed_step: completed_step.as_deref(),
                intent,
            };
            cli::session::continue_workflow(&state, args, json).await
        }

        Commands::Checkpoint { checkpoint_token } => cli::session::checkpoint(&state, checkpoint_token, json).await,

        Commands::Preferences { state_token, autonomy } => {
            cli::session::preferences(&state, state_token, autonomy, json).await
        }

        Commands::Inspect { session_id } => cli::session::inspect(&state, &session_id, json).await,

        Commands::Sessions => cli::session::list_sessions(&state, json).await,

        Commands::Workflows => cli::workflow::list(&state, json).await,

        Commands::Explain {
            workflow_id,
            step_id,
            context,
        } => cli::workflow::explain(&state, &workflow_id, &step_id, context.as_deref(), json).await,

        Commands::Keys { action } => cli::keys::handle_keys_command(action, &state, json).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Print a failure; engine errors keep their stable code.
fn report(err: &anyhow::Error, json: bool) {
    match err.downcast_ref::<EngineError>() {
        Some(engine_err) if json => {
            let body = serde_json::json!({ "error": engine_err.to_body() });
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()));
        }
        Some(engine_err) => {
            let body = engine_err.to_body();
            eprintln!("{} {} {}", style("error").red().bold(), style(body.code).yellow(), body.message);
            if body.retryable {
                eprintln!("  {}", style("Rehydrate with the same state token and retry.").dim());
            }
        }
        None if json => {
            let body = serde_json::json!({ "error": { "code": "CLI_ERROR", "message": format!("{err:#}") } });
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()));
        }
        None => eprintln!("{} {err:#}", style("error").red().bold()),
    }
}
