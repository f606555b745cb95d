//! Step Library: registry mapping a step type to its handler.
//!
//! Handlers are registered once at startup. The library knows nothing about
//! queues, locks, or persistence; it only turns `(step, context)` into a
//! `StepOutcome`.
//!
//! `StepHandler` uses RPITIT and so cannot be a trait object. Registration
//! goes through the same blanket-impl pattern used for other boxed ports:
//! 1. `StepHandlerDyn` is object-safe with boxed futures
//! 2. every `T: StepHandler` implements `StepHandlerDyn`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cadence_types::error::FlowError;
use cadence_types::execution::ContextMap;
use cadence_types::flow::{FlowDefinition, StepCursor, StepDefinition, StepType};
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::context::StepContext;
use super::handlers::{
    BranchHandler, CallToolHandler, DelayHandler, SendMessageHandler, SetVariablesHandler,
    SwitchHandler, WaitForReplyHandler,
};
use super::outbound::{ChannelClient, OutboundError, ToolInvoker};

// ---------------------------------------------------------------------------
// Outcome and error types
// ---------------------------------------------------------------------------

/// What a step handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Continue sequentially.
    Advance { next: StepCursor, patch: ContextMap },
    /// Jump to a step chosen by the handler.
    Branch { target: StepCursor, patch: ContextMap },
    /// Park in `WAITING_FOR_EVENT` until an external event (or `resume_at`).
    Suspend {
        patch: ContextMap,
        resume_at: Option<DateTime<Utc>>,
    },
    /// Stop the execution as `FAILED`.
    Fail { reason: String },
}

impl StepOutcome {
    pub fn advance(next: StepCursor) -> Self {
        StepOutcome::Advance {
            next,
            patch: ContextMap::new(),
        }
    }

    pub fn branch(target: StepCursor) -> Self {
        StepOutcome::Branch {
            target,
            patch: ContextMap::new(),
        }
    }
}

/// Errors raised by a step handler. Treated exactly like `StepOutcome::Fail`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for step type '{0}'")]
    Unregistered(StepType),

    #[error("handler for '{expected}' received a '{actual}' step")]
    Mismatch { expected: StepType, actual: StepType },

    #[error("unknown branch target '{0}'")]
    InvalidTarget(String),

    #[error("channel error: {0}")]
    Channel(#[source] OutboundError),

    #[error("tool error: {0}")]
    Tool(#[source] OutboundError),

    #[error("duration of {0}s is out of range")]
    DurationOutOfRange(u64),
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// The unit of work executed for one step type.
pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> StepType;

    fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<StepOutcome, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn step_type(&self) -> StepType;

    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, HandlerError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn step_type(&self) -> StepType {
        StepHandler::step_type(self)
    }

    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, HandlerError>> + Send + 'a>> {
        Box::pin(self.handle(step, ctx))
    }
}

/// Type-erased step handler.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn + Send + Sync>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn step_type(&self) -> StepType {
        self.inner.step_type()
    }

    pub async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        self.inner.handle_boxed(step, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Step type -> handler registry.
#[derive(Default)]
pub struct StepLibrary {
    handlers: HashMap<StepType, BoxStepHandler>,
}

impl StepLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// A library with every built-in step type registered.
    pub fn builtin<C, T>(channel: Arc<C>, tools: Arc<T>) -> Self
    where
        C: ChannelClient + 'static,
        T: ToolInvoker + 'static,
    {
        let mut library = Self::new();
        library.register(SendMessageHandler::new(channel.clone()));
        library.register(WaitForReplyHandler::new(channel));
        library.register(BranchHandler);
        library.register(SwitchHandler);
        library.register(DelayHandler);
        library.register(CallToolHandler::new(tools));
        library.register(SetVariablesHandler);
        library
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register<H: StepHandler + 'static>(&mut self, handler: H) {
        let handler = BoxStepHandler::new(handler);
        self.handlers.insert(handler.step_type(), handler);
    }

    pub fn supports(&self, step_type: StepType) -> bool {
        self.handlers.contains_key(&step_type)
    }

    /// Reject a flow that uses a step type with no registered handler.
    pub fn check_flow(&self, flow: &FlowDefinition) -> Result<(), FlowError> {
        match flow.steps.iter().find(|s| !self.supports(s.step_type())) {
            Some(step) => Err(FlowError::Validation(format!(
                "step '{}' uses unsupported type '{}'",
                step.id,
                step.step_type()
            ))),
            None => Ok(()),
        }
    }

    /// Dispatch a step to its handler.
    pub async fn handle(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<StepOutcome, HandlerError> {
        let handler = self
            .handlers
            .get(&step.step_type())
            .ok_or(HandlerError::Unregistered(step.step_type()))?;
        handler.handle(step, ctx).await
    }
}
