//! CLI execution subcommands: start, status, logs.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use cadence_core::flow::launcher::{FlowLauncher, StartResult};
use cadence_core::queue::memory::MemoryQueue;
use cadence_core::queue::transport::BoxQueuePublisher;
use cadence_core::repository::execution::ExecutionRepository;
use cadence_types::execution::{ContextMap, ExecutionStatus, FlowExecution, StepLogOutcome};

use crate::state::AppState;

/// Parse `--vars` into a context map. Only JSON objects are accepted.
pub fn parse_vars(raw: Option<&str>) -> Result<ContextMap> {
    let Some(raw) = raw else {
        return Ok(ContextMap::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("invalid JSON in --vars")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--vars must be a JSON object, got {other}"),
    }
}

fn parse_execution_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("invalid execution ID: '{raw}'"))
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Running => Color::Yellow,
        ExecutionStatus::WaitingForEvent => Color::Blue,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// Record a new execution. The first step is queued for the worker; a worker
/// that is not running picks the execution up when it starts.
pub async fn handle_start(
    flow_ref: &str,
    subject_id: &str,
    trigger_type: &str,
    vars: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let variables = parse_vars(vars)?;
    let launcher = FlowLauncher::new(
        state.executions.clone(),
        state.flows.clone(),
        state.library.clone(),
        BoxQueuePublisher::new(Arc::new(MemoryQueue::new(state.config.queue.capacity))),
        state.config.interpreter.stuck_after_sec,
    );

    let result = launcher
        .start(flow_ref, subject_id, trigger_type, variables)
        .await
        .with_context(|| format!("failed to start flow '{flow_ref}'"))?;

    match result {
        StartResult::Started(id) => {
            if json {
                let out = serde_json::json!({ "started": true, "execution_id": id.to_string() });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Started flow '{}' for {}",
                    style("*").green().bold(),
                    style(flow_ref).cyan(),
                    style(subject_id).cyan()
                );
                println!("  Execution ID: {id}");
                println!();
                println!(
                    "  Check progress: {}",
                    style(format!("cadence status {id}")).dim()
                );
                println!();
            }
        }
        StartResult::Skipped { existing } => {
            if json {
                let out = serde_json::json!({
                    "started": false,
                    "existing_execution_id": existing.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Skipped: execution {} is already active for {}",
                    style("!").yellow().bold(),
                    style(short_id(&existing)).cyan(),
                    subject_id
                );
                println!(
                    "  Use {} to replace it.",
                    style("--trigger manual").dim()
                );
                println!();
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(
    execution_id: Option<&str>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let Some(raw) = execution_id else {
        let recent = state
            .executions
            .list_recent_executions(limit)
            .await
            .context("failed to list executions")?;
        return display_recent(&recent, json);
    };

    let id = parse_execution_id(raw)?;
    let execution = state
        .executions
        .get_execution(&id)
        .await
        .context("failed to load execution")?
        .with_context(|| format!("execution {id} not found"))?;
    display_single(&execution, json)
}

fn execution_json(e: &FlowExecution) -> serde_json::Value {
    serde_json::json!({
        "execution_id": e.id.to_string(),
        "flow_id": e.flow_id.to_string(),
        "subject_id": e.subject_id,
        "status": e.status.as_str(),
        "current_step": e.current_step.index(),
        "trigger": e.trigger_type,
        "resume_at": e.resume_at.map(|t| t.to_rfc3339()),
        "last_error": e.last_error,
        "version": e.version,
        "created_at": e.created_at.to_rfc3339(),
        "updated_at": e.updated_at.to_rfc3339(),
    })
}

fn display_recent(executions: &[FlowExecution], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = executions.iter().map(execution_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Subject"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Trigger"),
            Cell::new("Updated"),
        ]);

    for e in executions {
        table.add_row(vec![
            Cell::new(short_id(&e.id)),
            Cell::new(&e.subject_id),
            status_cell(e.status),
            Cell::new(e.current_step),
            Cell::new(&e.trigger_type),
            Cell::new(e.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn display_single(e: &FlowExecution, json: bool) -> Result<()> {
    if json {
        let mut out = execution_json(e);
        out["context"] = serde_json::Value::Object(e.context.clone());
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Execution").bold(),
        style(e.id).cyan()
    );
    println!("  Flow: {}", e.flow_id);
    println!("  Subject: {}", e.subject_id);
    println!("  Status: {}", e.status);
    println!("  Step: {}", e.current_step);
    println!("  Trigger: {}", e.trigger_type);
    if let Some(resume_at) = e.resume_at {
        println!("  Resumes: {}", resume_at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Updated: {}", e.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ref err) = e.last_error {
        println!("  Error: {}", style(err).red());
    }
    if !e.context.is_empty() {
        println!("  Context:");
        for (key, value) in &e.context {
            println!("    {} = {}", style(key).dim(), value);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub async fn handle_logs(execution_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_execution_id(execution_id)?;
    let entries = state
        .executions
        .list_logs(&id)
        .await
        .context("failed to list execution log")?;

    if json {
        let out: Vec<_> = entries
            .iter()
            .map(|l| {
                serde_json::json!({
                    "step_index": l.step_index,
                    "step_id": l.step_id,
                    "step_type": l.step_type.as_str(),
                    "outcome": l.outcome.as_str(),
                    "message": l.message,
                    "at": l.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!("  No log entries for execution {}.", short_id(&id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Type"),
            Cell::new("Outcome"),
            Cell::new("Message"),
            Cell::new("At"),
        ]);

    for l in &entries {
        let outcome = match l.outcome {
            StepLogOutcome::Failed => Cell::new(l.outcome.as_str()).fg(Color::Red),
            _ => Cell::new(l.outcome.as_str()),
        };
        table.add_row(vec![
            Cell::new(l.step_index),
            Cell::new(&l.step_id),
            Cell::new(l.step_type),
            outcome,
            Cell::new(l.message.as_deref().unwrap_or("-")),
            Cell::new(l.created_at.format("%H:%M:%S%.3f").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
