// Adaptive periodic timer
// One background task per timer; the delay between executions is asked of
// the command each time around the loop.

use crate::errors::TimerError;
use crate::timer::TimerCommand;
use metrics::counter;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

enum Lifecycle {
    NotStarted,
    Running {
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    },
    Stopped,
    Disposed,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::NotStarted => "not started",
            Lifecycle::Running { .. } => "running",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Disposed => "disposed",
        }
    }
}

/// Runs a [`TimerCommand`] on a background task until stopped
///
/// A timer can be started once. Stopping cancels the pending sleep, waits for
/// an in-flight execution to return and leaves the timer in a terminal state.
pub struct AdaptiveTimer {
    name: String,
    command: Arc<dyn TimerCommand>,
    lifecycle: Mutex<Lifecycle>,
}

impl AdaptiveTimer {
    pub fn new(name: impl Into<String>, command: Arc<dyn TimerCommand>) -> Self {
        Self {
            name: name.into(),
            command,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the timer loop, optionally executing once before the first sleep
    #[instrument(skip(self), fields(timer = %self.name))]
    pub fn start(&self, execute_first: bool) -> Result<(), TimerError> {
        let mut lifecycle = self.lock();
        if !matches!(*lifecycle, Lifecycle::NotStarted) {
            return Err(TimerError::InvalidState(format!(
                "cannot start timer '{}': {}",
                self.name,
                lifecycle.name()
            )));
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.name.clone(),
            Arc::clone(&self.command),
            cancel.clone(),
            execute_first,
        ));
        *lifecycle = Lifecycle::Running { handle, cancel };

        info!("Timer started");
        Ok(())
    }

    /// Cancel the loop and wait for any in-flight execution to finish
    #[instrument(skip(self), fields(timer = %self.name))]
    pub async fn stop(&self) -> Result<(), TimerError> {
        let (handle, cancel) = {
            let mut lifecycle = self.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { handle, cancel } => (handle, cancel),
                other => {
                    let state = other.name();
                    *lifecycle = other;
                    return Err(TimerError::InvalidState(format!(
                        "cannot stop timer '{}': {}",
                        self.name, state
                    )));
                }
            }
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Timer task ended abnormally");
        }

        info!("Timer stopped");
        Ok(())
    }

    /// Stop if running and release the timer; safe to call repeatedly
    pub async fn dispose(&self) {
        if self.is_running() {
            if let Err(e) = self.stop().await {
                debug!(timer = %self.name, error = %e, "Timer already stopping");
            }
        }
        *self.lock() = Lifecycle::Disposed;
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), Lifecycle::Running { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.lock(), Lifecycle::Disposed)
    }
}

impl Drop for AdaptiveTimer {
    fn drop(&mut self) {
        if let Lifecycle::Running { cancel, .. } = &*self.lock() {
            cancel.cancel();
        }
    }
}

async fn run_loop(
    name: String,
    command: Arc<dyn TimerCommand>,
    cancel: CancellationToken,
    execute_first: bool,
) {
    if execute_first && !cancel.is_cancelled() {
        execute_once(&name, command.as_ref(), &cancel).await;
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let interval = command.separation_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if cancel.is_cancelled() {
            break;
        }
        execute_once(&name, command.as_ref(), &cancel).await;
    }

    debug!(timer = %name, "Timer loop exited");
}

async fn execute_once(name: &str, command: &dyn TimerCommand, cancel: &CancellationToken) {
    if let Err(e) = command.execute(cancel).await {
        warn!(timer = %name, error = %e, "Timer command failed");
        counter!("timer_command_failures_total", "timer" => name.to_string()).increment(1);
    }
}
