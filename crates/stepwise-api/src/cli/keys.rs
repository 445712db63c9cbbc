//! Keyring commands. Secrets are never printed.

use anyhow::Result;
use clap::Subcommand;
use console::style;

use super::print_json;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Show the current and retired key ids.
    Show,

    /// Generate a new signing key; tokens signed with older keys stay valid.
    Rotate,
}

pub async fn handle_keys_command(cmd: KeysCommand, state: &AppState, json: bool) -> Result<()> {
    let keyring = match cmd {
        KeysCommand::Show => state.keyring.load_or_create().await?,
        KeysCommand::Rotate => state.keyring.rotate().await?,
    };
    let current = keyring.current().key_id().to_string();
    let previous: Vec<String> = keyring.previous().iter().map(|k| k.key_id().to_string()).collect();

    if json {
        return print_json(&serde_json::json!({
            "path": state.keyring.path().display().to_string(),
            "current": current,
            "previous": previous,
        }));
    }

    println!();
    println!("  Current:  {}", style(&current).cyan());
    for key_id in &previous {
        println!("  Retired:  {}", style(key_id).dim());
    }
    println!("  File:     {}", style(state.keyring.path().display()).dim());
    println!();
    Ok(())
}
