//! Flow definition parsing and validation.
//!
//! Converts YAML or JSON documents into a `FlowDefinition` and checks the
//! structural constraints the interpreter relies on: at least one step,
//! unique step ids, and every branch target resolving to a step or `end`.
//! Unknown step `type` tags fail here, at load time, never mid-execution.

use std::collections::HashSet;
use std::path::Path;

use cadence_types::error::FlowError;
use cadence_types::flow::{END_TARGET, FlowDefinition, MAX_SUSPEND_SECS, StepConfig};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `FlowDefinition`.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, FlowError> {
    let def: FlowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| FlowError::Parse(e.to_string()))?;
    validate_flow(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `FlowDefinition`.
pub fn parse_flow_json(json: &str) -> Result<FlowDefinition, FlowError> {
    let def: FlowDefinition =
        serde_json::from_str(json).map_err(|e| FlowError::Parse(e.to_string()))?;
    validate_flow(&def)?;
    Ok(def)
}

/// Load a flow file, choosing the format by extension (`.json` or YAML).
pub fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FlowError::Parse(format!("{}: {e}", path.display())))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_flow_json(&content),
        _ => parse_flow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `FlowDefinition`.
pub fn validate_flow(def: &FlowDefinition) -> Result<(), FlowError> {
    if def.name.trim().is_empty() {
        return Err(FlowError::Validation(
            "flow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(FlowError::Validation(
            "flow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() || step.id == END_TARGET {
            return Err(FlowError::Validation(format!(
                "invalid step id '{}'",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(FlowError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &def.steps {
        for target in step.targets() {
            if target != END_TARGET && !seen_ids.contains(target) {
                return Err(FlowError::UnknownTarget {
                    step: step.id.clone(),
                    target: target.to_string(),
                });
            }
        }

        match &step.config {
            StepConfig::Delay { seconds: 0 } => {
                return Err(FlowError::Validation(format!(
                    "delay step '{}' must wait at least one second",
                    step.id
                )));
            }
            StepConfig::WaitForReply {
                timeout_secs: Some(0),
                ..
            } => {
                return Err(FlowError::Validation(format!(
                    "wait_for_reply step '{}' timeout must be > 0",
                    step.id
                )));
            }
            StepConfig::Delay { seconds } if *seconds > MAX_SUSPEND_SECS => {
                return Err(FlowError::Validation(format!(
                    "delay step '{}' exceeds the {MAX_SUSPEND_SECS}s limit",
                    step.id
                )));
            }
            StepConfig::WaitForReply {
                timeout_secs: Some(secs),
                ..
            } if *secs > MAX_SUSPEND_SECS => {
                return Err(FlowError::Validation(format!(
                    "wait_for_reply step '{}' timeout exceeds the {MAX_SUSPEND_SECS}s limit",
                    step.id
                )));
            }
            StepConfig::CallTool { tool, .. } if tool.trim().is_empty() => {
                return Err(FlowError::Validation(format!(
                    "call_tool step '{}' must name a tool",
                    step.id
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
