//! CLI flow management subcommands: import, validate, list, delete.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use cadence_core::flow::definition::load_flow_file;
use cadence_core::repository::flow::FlowRepository;
use cadence_types::flow::FlowDefinition;

use crate::state::AppState;

/// Flow management subcommands.
#[derive(Subcommand)]
pub enum FlowCommand {
    /// Import (create or replace) a flow from a YAML or JSON file.
    Import {
        /// Path to the flow file.
        file: PathBuf,
    },

    /// Check a flow file without storing it.
    Validate {
        /// Path to the flow file.
        file: PathBuf,
    },

    /// List stored flows.
    #[command(alias = "ls")]
    List,

    /// Delete a stored flow.
    #[command(alias = "rm")]
    Delete {
        /// Flow name or UUID.
        flow: String,
    },
}

/// Handle a flow subcommand.
pub async fn handle_flow_command(cmd: FlowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        FlowCommand::Import { file } => handle_import(&file, state, json).await,
        FlowCommand::Validate { file } => handle_validate(&file, state, json),
        FlowCommand::List => handle_list(state, json).await,
        FlowCommand::Delete { flow } => handle_delete(&flow, state, json).await,
    }
}

/// Parse, validate and check every step type has a handler.
fn load_checked(file: &Path, state: &AppState) -> Result<FlowDefinition> {
    let def = load_flow_file(file)
        .with_context(|| format!("failed to load flow from {}", file.display()))?;
    state
        .library
        .check_flow(&def)
        .with_context(|| format!("flow '{}' cannot run on this worker", def.name))?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

async fn handle_import(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = import_flow(file, state).await?;

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "steps": def.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Imported flow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!("  Steps: {}", def.steps.len());
        println!();
    }
    Ok(())
}

/// Store the flow in `file`. Re-importing a flow with an existing name
/// replaces that flow, keeps its id and bumps its version.
pub async fn import_flow(file: &Path, state: &AppState) -> Result<FlowDefinition> {
    let mut def = load_checked(file, state)?;

    if let Some(existing) = state
        .flows
        .get_flow_by_name(&def.name)
        .await
        .context("failed to look up flow")?
    {
        def.id = existing.id;
        def.version = def.version.max(existing.version.saturating_add(1));
    }

    state
        .flows
        .save_flow(&def)
        .await
        .with_context(|| format!("failed to save flow '{}'", def.name))?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_checked(file, state)?;

    if json {
        let steps: Vec<_> = def
            .steps
            .iter()
            .map(|s| serde_json::json!({ "id": s.id, "type": s.step_type().as_str() }))
            .collect();
        let out = serde_json::json!({ "valid": true, "name": def.name, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Flow '{}' is valid",
        style("✓").green(),
        style(&def.name).cyan()
    );
    for (index, step) in def.steps.iter().enumerate() {
        println!(
            "  {:>3}  {}  {}",
            index,
            style(&step.id).bold(),
            style(step.step_type()).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let flows = state
        .flows
        .list_flows()
        .await
        .context("failed to list flows")?;

    if json {
        let out: Vec<_> = flows
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.definition.id.to_string(),
                    "name": r.definition.name,
                    "steps": r.definition.steps.len(),
                    "updated_at": r.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if flows.is_empty() {
        println!();
        println!("  No flows stored.");
        println!(
            "  Import one with: {}",
            style("cadence flow import <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Steps"),
            Cell::new("Updated"),
        ]);

    for r in &flows {
        table.add_row(vec![
            Cell::new(&r.definition.name),
            Cell::new(r.definition.id),
            Cell::new(r.definition.steps.len()),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn handle_delete(flow_ref: &str, state: &AppState, json: bool) -> Result<()> {
    let by_id = match flow_ref.parse::<uuid::Uuid>() {
        Ok(id) => state.flows.get_flow(&id).await?,
        Err(_) => None,
    };
    let def = match by_id {
        Some(def) => def,
        None => state
            .flows
            .get_flow_by_name(flow_ref)
            .await?
            .with_context(|| format!("flow '{flow_ref}' not found"))?,
    };

    state
        .flows
        .delete_flow(&def.id)
        .await
        .context("failed to delete flow")?;

    if json {
        let out = serde_json::json!({ "deleted": def.id.to_string(), "name": def.name });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Deleted flow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;

    const SURVEY: &str = r#"
name: survey
steps:
  - id: ask
    config:
      type: wait_for_reply
      prompt: "How was it?"
  - id: thanks
    config:
      type: send_message
      text: "Got: {{ last_response }}"
"#;

    fn write_flow(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn reimport_keeps_id() {
        let state = test_state().await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(&dir, SURVEY);

        let first = import_flow(&path, &state).await.unwrap();
        let second = import_flow(&path, &state).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.version, first.version + 1);
        assert_eq!(state.flows.list_flows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_flow_is_not_stored() {
        let state = test_state().await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(
            &dir,
            "name: broken\nsteps:\n  - id: a\n    config: { type: switch, cases: [ { value: x, target: nowhere } ] }\n",
        );

        assert!(import_flow(&path, &state).await.is_err());
        assert!(state.flows.list_flows().await.unwrap().is_empty());
    }
}
