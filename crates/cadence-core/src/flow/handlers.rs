//! Built-in step handlers.

use std::sync::Arc;

use cadence_types::execution::ContextMap;
use chrono::{DateTime, Utc};
use cadence_types::flow::{
    LAST_RESPONSE_VAR, RESPONDED_VAR, StepConfig, StepCursor, StepDefinition, StepType,
    TIMED_OUT_VAR, WAITING_FOR_RESPONSE_VAR,
};
use serde_json::{Value, json};

use super::context::{Resume, StepContext, normalize};
use super::library::{HandlerError, StepHandler, StepOutcome};
use super::outbound::{ChannelClient, OutboundMessage, ToolCall, ToolInvoker};

fn mismatch(expected: StepType, step: &StepDefinition) -> HandlerError {
    HandlerError::Mismatch {
        expected,
        actual: step.step_type(),
    }
}

fn patch_of(entries: impl IntoIterator<Item = (&'static str, Value)>) -> ContextMap {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// `now + secs`, or an error when the deadline is not representable.
fn deadline_after(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, HandlerError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or(HandlerError::DurationOutOfRange(secs))
}

/// Append the buttons to `text` as a numbered list.
fn render_buttons(text: String, buttons: &[String]) -> String {
    if buttons.is_empty() {
        return text;
    }
    let options: Vec<String> = buttons
        .iter()
        .enumerate()
        .map(|(i, label)| format!("{}. {label}", i + 1))
        .collect();
    format!("{text}\n\n{}", options.join("\n"))
}

/// `Branch` when a target was configured, `Advance` to the next step otherwise.
fn jump_or_next(
    ctx: &StepContext,
    target: Option<&String>,
    patch: ContextMap,
) -> Result<StepOutcome, HandlerError> {
    Ok(match target {
        Some(target) => StepOutcome::Branch {
            target: ctx.target(target)?,
            patch,
        },
        None => StepOutcome::Advance {
            next: ctx.next(),
            patch,
        },
    })
}

// ---------------------------------------------------------------------------
// send_message
// ---------------------------------------------------------------------------

pub struct SendMessageHandler<C> {
    channel: Arc<C>,
}

impl<C> SendMessageHandler<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C: ChannelClient> StepHandler for SendMessageHandler<C> {
    fn step_type(&self) -> StepType {
        StepType::SendMessage
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::SendMessage {
            text,
            media_url,
            buttons,
        } = &step.config
        else {
            return Err(mismatch(StepType::SendMessage, step));
        };

        let buttons: Vec<String> = buttons.iter().map(|b| ctx.resolve_template(b)).collect();
        let message = OutboundMessage {
            subject_id: ctx.subject_id.clone(),
            text: render_buttons(ctx.resolve_template(text), &buttons),
            media_url: media_url.as_deref().map(|u| ctx.resolve_template(u)),
            buttons,
            idempotency_key: ctx.idempotency_key(),
        };
        self.channel
            .send(&message)
            .await
            .map_err(HandlerError::Channel)?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_index = ctx.step_index,
            "message sent"
        );
        Ok(StepOutcome::advance(ctx.next()))
    }
}

// ---------------------------------------------------------------------------
// wait_for_reply
// ---------------------------------------------------------------------------

pub struct WaitForReplyHandler<C> {
    channel: Arc<C>,
}

impl<C> WaitForReplyHandler<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }
}

impl<C: ChannelClient> StepHandler for WaitForReplyHandler<C> {
    fn step_type(&self) -> StepType {
        StepType::WaitForReply
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::WaitForReply {
            prompt,
            timeout_secs,
            on_reply,
            on_timeout,
            save_as,
        } = &step.config
        else {
            return Err(mismatch(StepType::WaitForReply, step));
        };

        match ctx.resume {
            None => {
                let resume_at = timeout_secs
                    .map(|secs| deadline_after(ctx.now, secs))
                    .transpose()?;
                if let Some(prompt) = prompt {
                    let message = OutboundMessage {
                        subject_id: ctx.subject_id.clone(),
                        text: ctx.resolve_template(prompt),
                        media_url: None,
                        buttons: Vec::new(),
                        idempotency_key: ctx.idempotency_key(),
                    };
                    self.channel
                        .send(&message)
                        .await
                        .map_err(HandlerError::Channel)?;
                }
                Ok(StepOutcome::Suspend {
                    patch: patch_of([
                        (WAITING_FOR_RESPONSE_VAR, json!(true)),
                        (RESPONDED_VAR, json!(false)),
                        (TIMED_OUT_VAR, json!(false)),
                    ]),
                    resume_at,
                })
            }
            Some(Resume::Reply) => {
                let mut patch = patch_of([
                    (WAITING_FOR_RESPONSE_VAR, json!(false)),
                    (RESPONDED_VAR, json!(true)),
                ]);
                if let Some(var) = save_as {
                    let reply = ctx
                        .variable(LAST_RESPONSE_VAR)
                        .cloned()
                        .unwrap_or(Value::Null);
                    patch.insert(var.clone(), reply);
                }
                jump_or_next(ctx, on_reply.as_ref(), patch)
            }
            Some(Resume::IdleTimeout) | Some(Resume::DelayElapsed) => {
                let patch = patch_of([
                    (WAITING_FOR_RESPONSE_VAR, json!(false)),
                    (TIMED_OUT_VAR, json!(true)),
                ]);
                jump_or_next(ctx, on_timeout.as_ref(), patch)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// branch
// ---------------------------------------------------------------------------

pub struct BranchHandler;

impl StepHandler for BranchHandler {
    fn step_type(&self) -> StepType {
        StepType::Branch
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::Branch {
            condition,
            then_step,
            else_step,
        } = &step.config
        else {
            return Err(mismatch(StepType::Branch, step));
        };

        let target = if ctx.evaluate(condition) {
            then_step
        } else {
            else_step
        };
        Ok(StepOutcome::branch(ctx.target(target)?))
    }
}

// ---------------------------------------------------------------------------
// switch
// ---------------------------------------------------------------------------

pub struct SwitchHandler;

impl StepHandler for SwitchHandler {
    fn step_type(&self) -> StepType {
        StepType::Switch
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::Switch {
            variable,
            cases,
            default,
        } = &step.config
        else {
            return Err(mismatch(StepType::Switch, step));
        };

        let value = normalize(&ctx.variable_text(variable));
        let matched = cases
            .iter()
            .find(|case| normalize(&case.value) == value)
            .map(|case| &case.target)
            .or(default.as_ref());

        match matched {
            Some(target) => Ok(StepOutcome::branch(ctx.target(target)?)),
            None => Ok(StepOutcome::advance(ctx.next())),
        }
    }
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

pub struct DelayHandler;

impl StepHandler for DelayHandler {
    fn step_type(&self) -> StepType {
        StepType::Delay
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::Delay { seconds } = &step.config else {
            return Err(mismatch(StepType::Delay, step));
        };

        match (ctx.resume, ctx.resume_at) {
            (Some(Resume::DelayElapsed), _) => Ok(StepOutcome::advance(ctx.next())),
            // Woken by something else before the delay ran out: keep waiting.
            (Some(_), Some(at)) if at > ctx.now => Ok(StepOutcome::Suspend {
                patch: ContextMap::new(),
                resume_at: Some(at),
            }),
            (Some(_), Some(_)) => Ok(StepOutcome::advance(ctx.next())),
            _ => Ok(StepOutcome::Suspend {
                patch: ContextMap::new(),
                resume_at: Some(deadline_after(ctx.now, *seconds)?),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// call_tool
// ---------------------------------------------------------------------------

pub struct CallToolHandler<T> {
    tools: Arc<T>,
}

impl<T> CallToolHandler<T> {
    pub fn new(tools: Arc<T>) -> Self {
        Self { tools }
    }
}

impl<T: ToolInvoker> StepHandler for CallToolHandler<T> {
    fn step_type(&self) -> StepType {
        StepType::CallTool
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::CallTool {
            tool,
            arguments,
            result_variable,
        } = &step.config
        else {
            return Err(mismatch(StepType::CallTool, step));
        };

        let call = ToolCall {
            tool: tool.clone(),
            subject_id: ctx.subject_id.clone(),
            arguments: ctx.resolve_value(arguments),
            idempotency_key: ctx.idempotency_key(),
        };
        let result = self.tools.invoke(&call).await.map_err(HandlerError::Tool)?;

        let mut patch = ContextMap::new();
        if let Some(var) = result_variable {
            patch.insert(var.clone(), result);
        }
        Ok(StepOutcome::Advance {
            next: ctx.next(),
            patch,
        })
    }
}

// ---------------------------------------------------------------------------
// set_variables
// ---------------------------------------------------------------------------

pub struct SetVariablesHandler;

impl StepHandler for SetVariablesHandler {
    fn step_type(&self) -> StepType {
        StepType::SetVariables
    }

    async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let StepConfig::SetVariables { values } = &step.config else {
            return Err(mismatch(StepType::SetVariables, step));
        };

        let patch = values
            .iter()
            .map(|(k, v)| (k.clone(), ctx.resolve_value(v)))
            .collect();
        Ok(StepOutcome::Advance {
            next: ctx.next(),
            patch,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
