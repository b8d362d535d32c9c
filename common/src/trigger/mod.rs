// Trigger evaluation: registrations, the gate deciding whether a detected
// write runs its function, and the general staleness evaluator

pub mod gate;
pub mod staleness;

use crate::blob_path::{BlobPathPattern, RouteParams};
use crate::config::TriggerConfig;
use crate::errors::{PatternError, QueueError, TriggerError};
use crate::models::{AccountIdentity, BlobIdentity, ContainerIdentity};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use gate::TriggerGate;
pub use staleness::{
    BindingDirection, BindingKind, BindingTimestampSet, ExecutionDecision, StalenessEvaluator,
};

/// A function run requested by a blob trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredInvocation {
    pub function: String,
    pub blob: BlobIdentity,
    pub route_params: RouteParams,
    /// Invocation that wrote the triggering blob, when known
    pub parent_id: Option<Uuid>,
}

/// Executor collaborator that actually runs functions
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, invocation: TriggeredInvocation) -> Result<(), QueueError>;
}

/// Receives candidate blobs from a listener strategy
///
/// Returns `Ok(true)` when the blob caused an invocation.
#[async_trait]
pub trait TriggerExecutor: Send + Sync {
    async fn execute(&self, blob: &BlobIdentity) -> Result<bool, TriggerError>;
}

/// One function bound to writes in one container
#[derive(Clone)]
pub struct Registration {
    pub container: ContainerIdentity,
    pub input: BlobPathPattern,
    pub outputs: Vec<BlobPathPattern>,
    pub function: String,
    pub invoker: Arc<dyn FunctionInvoker>,
}

impl Registration {
    /// Build a registration on `account`; the container comes from the input
    /// pattern
    pub fn new(
        account: AccountIdentity,
        function: impl Into<String>,
        input: BlobPathPattern,
        outputs: Vec<BlobPathPattern>,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Self {
        Self {
            container: ContainerIdentity::new(account, input.container()),
            input,
            outputs,
            function: function.into(),
            invoker,
        }
    }

    pub fn from_config(
        account: AccountIdentity,
        trigger: &TriggerConfig,
        invoker: Arc<dyn FunctionInvoker>,
    ) -> Result<Self, PatternError> {
        let input = BlobPathPattern::parse(&trigger.input)?;
        let outputs = trigger
            .outputs
            .iter()
            .map(|output| BlobPathPattern::parse(output))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(account, trigger.function.clone(), input, outputs, invoker))
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("container", &self.container)
            .field("input", &self.input)
            .field("outputs", &self.outputs)
            .field("function", &self.function)
            .finish()
    }
}

/// Hands invocations to an in-process executor over a channel
#[derive(Clone)]
pub struct ChannelInvoker {
    sender: mpsc::UnboundedSender<TriggeredInvocation>,
}

impl ChannelInvoker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TriggeredInvocation>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FunctionInvoker for ChannelInvoker {
    async fn invoke(&self, invocation: TriggeredInvocation) -> Result<(), QueueError> {
        self.sender
            .send(invocation)
            .map_err(|e| QueueError::PublishFailed(format!("Executor channel closed: {}", e)))
    }
}
