//! Workflow commands: list definitions, explain run conditions.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;

use stepwise_core::workflow::condition::{ConditionExplanation, ConditionTrace};

use super::{parse_object, print_json};
use crate::state::AppState;

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.engine.list_workflows().await?;

    if json {
        return print_json(&workflows);
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows found in {}.", style(state.workflows_dir.display()).dim());
        println!("  Add a definition as {}", style("<id>.yaml or <id>.json").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Description"),
        ]);
    for workflow in &workflows {
        table.add_row(vec![
            Cell::new(&workflow.id),
            Cell::new(&workflow.name),
            Cell::new(&workflow.version),
            Cell::new(workflow.description.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn explain(
    state: &AppState,
    workflow_id: &str,
    step_id: &str,
    context: Option<&str>,
    json: bool,
) -> Result<()> {
    let context = parse_object("context", context)?;
    let explanation = state.engine.explain_step(workflow_id, step_id, context).await?;

    if json {
        return print_json(&explanation);
    }
    println!();
    print!("{}", render_explanation(step_id, &explanation));
    println!();
    Ok(())
}

/// Indented trace tree, one evaluated node per line.
fn render_explanation(step_id: &str, explanation: &ConditionExplanation) -> String {
    let verdict = if explanation.result {
        style("runs").green().bold()
    } else {
        style("skipped").yellow().bold()
    };
    let mut out = format!("  Step {} {verdict}\n", style(step_id).cyan());
    if let Some(error) = &explanation.error {
        out.push_str(&format!("  {} {error}\n", style("evaluation failed:").red()));
    }
    if let Some(trace) = &explanation.trace {
        render_trace(trace, 2, &mut out);
    }
    out
}

fn render_trace(trace: &ConditionTrace, depth: usize, out: &mut String) {
    let mark = if trace.result { style("✓").green() } else { style("✗").red() };
    let indent = "  ".repeat(depth);
    let detail = match &trace.var {
        Some(var) => format!(
            "{var} {} {}  (actual {})",
            trace.node,
            show(trace.expected.as_ref()),
            show(trace.actual.as_ref())
        ),
        None => trace.node.clone(),
    };
    out.push_str(&format!("{indent}{mark} {detail}\n"));
    for child in &trace.children {
        render_trace(child, depth + 1, out);
    }
}

fn show(value: Option<&Value>) -> String {
    value.map_or_else(|| "undefined".to_string(), Value::to_string)
}
