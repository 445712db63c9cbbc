//! Session commands: start, continue, checkpoint, preferences, inspect.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use stepwise_core::durable::projection::SessionTruth;
use stepwise_core::engine::{
    BlockedResponse, CheckpointRequest, ContinueOutcome, ContinueRequest, PreferencesRequest, StartRequest,
    StepResponse,
};
use stepwise_core::workflow::interpreter::PendingStep;
use stepwise_types::event::{Autonomy, ExecutionPreferences, NodeKind};
use stepwise_types::execution::StepInstanceId;
use stepwise_types::ids::SessionId;

use super::{parse_object, parse_value, print_json, AutonomyArg};
use crate::state::AppState;

pub async fn start(
    state: &AppState,
    workflow_id: String,
    context: Option<&str>,
    autonomy: Option<AutonomyArg>,
    json: bool,
) -> Result<()> {
    let request = StartRequest {
        workflow_id,
        context: parse_object("context", context)?,
        preferences: autonomy.map(|a| ExecutionPreferences { autonomy: a.into() }),
    };
    let response = state.engine.start(request).await?;

    if json {
        return print_json(&response);
    }
    println!();
    println!(
        "  {} Started session {}",
        style("▶").green().bold(),
        style(&response.session_id).cyan()
    );
    print_step(&response);
    Ok(())
}

/// Arguments of `stepw continue`, as given on the command line.
pub struct ContinueArgs<'a> {
    pub state_token: String,
    pub ack_token: Option<String>,
    pub output: Option<&'a str>,
    pub output_file: Option<&'a Path>,
    pub context: Option<&'a str>,
    pub completed_step: Option<&'a str>,
    pub intent: Option<String>,
}

pub async fn continue_workflow(state: &AppState, args: ContinueArgs<'_>, json: bool) -> Result<()> {
    let output = match args.output_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            Some(serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?)
        }
        None => parse_value("output", args.output)?,
    };
    let completed_step = args
        .completed_step
        .map(|raw| serde_json::from_str::<StepInstanceId>(raw).context("--completed-step is not a step instance"))
        .transpose()?;

    let request = ContinueRequest {
        state_token: args.state_token,
        ack_token: args.ack_token,
        completed_step,
        output,
        context: parse_object("context", args.context)?,
        intent: args.intent,
    };
    let outcome = state.engine.continue_workflow(request).await?;

    if json {
        return print_json(&outcome);
    }
    match &outcome {
        ContinueOutcome::Ok(step) => print_step(step),
        ContinueOutcome::Blocked(blocked) => print_blocked(blocked),
    }
    Ok(())
}

pub async fn checkpoint(state: &AppState, checkpoint_token: String, json: bool) -> Result<()> {
    let response = state.engine.checkpoint(CheckpointRequest { checkpoint_token }).await?;

    if json {
        return print_json(&response);
    }
    println!();
    println!(
        "  {} Checkpoint {} recorded on node {}",
        style("✓").green().bold(),
        style(&response.checkpoint_node_id).cyan(),
        style(&response.node_id).dim()
    );
    println!();
    println!("  {}", style("Resume from it with:").dim());
    println!("  state token: {}", response.state_token);
    println!();
    Ok(())
}

pub async fn preferences(state: &AppState, state_token: String, autonomy: AutonomyArg, json: bool) -> Result<()> {
    let response = state
        .engine
        .set_preferences(PreferencesRequest {
            state_token,
            preferences: ExecutionPreferences {
                autonomy: autonomy.into(),
            },
        })
        .await?;

    if json {
        return print_json(&response);
    }
    println!();
    println!(
        "  {} Session {} now runs {}",
        style("✓").green().bold(),
        style(&response.session_id).cyan(),
        autonomy_label(response.preferences.autonomy)
    );
    println!();
    Ok(())
}

pub async fn inspect(state: &AppState, session_id: &str, json: bool) -> Result<()> {
    let session_id = SessionId::parse(session_id).with_context(|| format!("'{session_id}' is not a session id"))?;
    let truth = state.engine.inspect(&session_id).await?;

    if json {
        return print_json(&truth);
    }
    print_truth(&truth);
    Ok(())
}

pub async fn list_sessions(state: &AppState, json: bool) -> Result<()> {
    let sessions = state.engine.list_sessions().await?;

    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!();
        println!("  No sessions yet.");
        println!("  Start one with: {}", style("stepw start <workflow-id>").dim());
        println!();
        return Ok(());
    }
    println!();
    for session in &sessions {
        println!("  {session}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn autonomy_label(autonomy: Autonomy) -> &'static str {
    match autonomy {
        Autonomy::Guided => "guided",
        Autonomy::NeverStop => "never-stop",
    }
}

fn print_pending(pending: &PendingStep) {
    println!(
        "  {} {}  {}",
        style("Next:").bold(),
        style(&pending.title).cyan().bold(),
        style(pending.step_instance_key.as_str()).dim()
    );
    println!();
    for line in pending.prompt.lines() {
        println!("    {line}");
    }
    if !pending.guidance.is_empty() {
        println!();
        for hint in &pending.guidance {
            println!("    {} {hint}", style("•").dim());
        }
    }
    if let Some(contract) = &pending.output_contract {
        println!();
        println!(
            "  {} {} requires {}",
            style("Output:").bold(),
            contract.contract_ref,
            contract.required_fields.join(", ")
        );
    }
}

fn print_step(step: &StepResponse) {
    println!();
    match &step.pending {
        Some(pending) => print_pending(pending),
        None => println!("  {} Workflow complete", style("✓").green().bold()),
    }
    println!();
    println!("  {}", style("── Tokens ──").dim());
    println!("  state:      {}", step.state_token);
    if let Some(ack) = &step.ack_token {
        println!("  ack:        {ack}");
    }
    println!("  checkpoint: {}", step.checkpoint_token);
    println!();
}

fn print_blocked(blocked: &BlockedResponse) {
    println!();
    println!("  {} Advance blocked by the output contract", style("✗").red().bold());
    println!();
    for blocker in &blocked.blockers {
        let field = blocker
            .pointer
            .field
            .as_deref()
            .map(|f| format!(" ({f})"))
            .unwrap_or_default();
        println!("  {} {}{}", style("•").red(), blocker.message, style(field).dim());
        for suggestion in &blocker.suggestions {
            println!("      {}", style(suggestion).dim());
        }
    }
    println!();
    if let Some(pending) = &blocked.pending {
        print_pending(pending);
        println!();
    }
    println!("  {}", style("── Retry with ──").dim());
    println!("  state:      {}", blocked.state_token);
    println!("  ack:        {}", blocked.retry_ack_token);
    println!("  checkpoint: {}", blocked.checkpoint_token);
    println!();
}

fn print_truth(truth: &SessionTruth) {
    println!();
    println!(
        "  {} Session {}",
        style("◆").bold(),
        style(&truth.session_id).cyan()
    );
    if let Some(workflow_id) = &truth.workflow_id {
        println!("  Workflow:   {workflow_id}");
    }
    println!("  Autonomy:   {}", autonomy_label(truth.preferences.autonomy));
    println!("  Events:     {}", truth.next_event_index);
    println!();

    let mut runs = Table::new();
    runs.load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Hash"),
            Cell::new("Nodes"),
            Cell::new("Tips"),
        ]);
    for run in truth.runs.values() {
        let tips = truth.tips(&run.run_id);
        let tips = if tips.len() > 1 {
            Cell::new(tips.len()).fg(Color::Yellow)
        } else {
            Cell::new(tips.len())
        };
        runs.add_row(vec![
            Cell::new(&run.run_id),
            Cell::new(&run.workflow_hash_ref),
            Cell::new(run.node_count),
            tips,
        ]);
    }
    println!("{runs}");

    let count = |kind: NodeKind| truth.nodes.values().filter(|n| n.kind == kind).count();
    println!();
    println!(
        "  Nodes: {} step, {} blocked, {} checkpoint",
        count(NodeKind::Step),
        count(NodeKind::BlockedAttempt),
        count(NodeKind::Checkpoint)
    );

    if !truth.gaps.is_empty() {
        println!();
        println!("  {}", style("── Gaps ──").dim());
        let mut gaps = Table::new();
        gaps.load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Yellow),
                Cell::new("Node"),
                Cell::new("Blockers"),
            ]);
        for entry in &truth.gaps {
            let messages: Vec<&str> = entry.gap.blockers.iter().map(|b| b.message.as_str()).collect();
            gaps.add_row(vec![
                Cell::new(&entry.gap.step_instance_key),
                Cell::new(&entry.node_id),
                Cell::new(messages.join("\n")),
            ]);
        }
        println!("{gaps}");
    }
    println!();
}
