// Periodic execution: commands, the adaptive timer that drives them, and the
// failure backoff wrapper

pub mod adaptive;
pub mod backoff;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use adaptive::AdaptiveTimer;
pub use backoff::BackoffCommand;

/// Error returned by a timer command; logged and counted by the timer
pub type CommandError = Box<dyn std::error::Error + Send + Sync>;

/// Work executed repeatedly by an [`AdaptiveTimer`]
#[async_trait]
pub trait TimerCommand: Send + Sync {
    /// Delay before the next execution, re-read after every execution
    fn separation_interval(&self) -> Duration;

    /// Run once; long-running work should stop early when `cancel` fires
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), CommandError>;
}

/// Work that reports success or failure instead of erroring
#[async_trait]
pub trait CanFailCommand: Send + Sync {
    async fn try_execute(&self, cancel: &CancellationToken) -> bool;
}
