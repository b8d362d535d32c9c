// Failure backoff for periodic commands
// After k consecutive failures the interval is normal / divisor^k, never
// below the minimum. A success restores the normal interval.

use crate::errors::TimerError;
use crate::timer::{CanFailCommand, CommandError, TimerCommand};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntervalState {
    current: Duration,
    consecutive_failures: u32,
}

/// Adapts a [`CanFailCommand`] into a [`TimerCommand`] that retries sooner
/// after failures
pub struct BackoffCommand {
    inner: Box<dyn CanFailCommand>,
    normal_interval: Duration,
    minimum_interval: Duration,
    failure_speedup_divisor: u32,
    state: Mutex<IntervalState>,
}

impl BackoffCommand {
    pub fn new(
        inner: Box<dyn CanFailCommand>,
        normal_interval: Duration,
        minimum_interval: Duration,
        failure_speedup_divisor: u32,
    ) -> Result<Self, TimerError> {
        if minimum_interval > normal_interval {
            return Err(TimerError::InvalidArgument {
                argument: "minimum_interval".to_string(),
                reason: format!(
                    "{:?} must not be greater than normal_interval {:?}",
                    minimum_interval, normal_interval
                ),
            });
        }
        if failure_speedup_divisor < 1 {
            return Err(TimerError::InvalidArgument {
                argument: "failure_speedup_divisor".to_string(),
                reason: "must not be less than 1".to_string(),
            });
        }

        Ok(Self {
            inner,
            normal_interval,
            minimum_interval,
            failure_speedup_divisor,
            state: Mutex::new(IntervalState {
                current: normal_interval,
                consecutive_failures: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IntervalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Interval after `failures` consecutive failures
    pub fn interval_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.normal_interval;
        }
        let shrunk = self
            .failure_speedup_divisor
            .checked_pow(failures)
            .map(|divisor| self.normal_interval / divisor)
            .unwrap_or(Duration::ZERO);
        shrunk.max(self.minimum_interval)
    }
}

#[async_trait]
impl TimerCommand for BackoffCommand {
    fn separation_interval(&self) -> Duration {
        self.lock().current
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), CommandError> {
        let succeeded = self.inner.try_execute(cancel).await;

        let mut state = self.lock();
        if succeeded {
            state.consecutive_failures = 0;
            state.current = self.normal_interval;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.current = self.interval_after(state.consecutive_failures);
        }

        if succeeded {
            debug!(interval_ms = state.current.as_millis() as u64, "Command succeeded");
        } else {
            warn!(
                consecutive_failures = state.consecutive_failures,
                interval_ms = state.current.as_millis() as u64,
                "Command failed, shortening interval"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Returns scripted outcomes, then succeeds
    struct ScriptedCommand {
        outcomes: Mutex<VecDeque<bool>>,
    }

    impl ScriptedCommand {
        fn boxed(outcomes: &[bool]) -> Box<dyn CanFailCommand> {
            Box::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl CanFailCommand for ScriptedCommand {
        async fn try_execute(&self, _cancel: &CancellationToken) -> bool {
            self.outcomes.lock().unwrap().pop_front().unwrap_or(true)
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_rejects_minimum_above_normal() {
        let result = BackoffCommand::new(ScriptedCommand::boxed(&[]), secs(1), secs(2), 2);
        assert!(matches!(result, Err(TimerError::InvalidArgument { .. })));
    }

    #[test]
    fn test_rejects_zero_divisor() {
        let result = BackoffCommand::new(ScriptedCommand::boxed(&[]), secs(10), secs(1), 0);
        match result {
            Err(TimerError::InvalidArgument { argument, .. }) => {
                assert_eq!(argument, "failure_speedup_divisor")
            }
            _ => panic!("expected InvalidArgument"),
        }
    }

    #[test]
    fn test_initial_interval_is_normal() {
        let command =
            BackoffCommand::new(ScriptedCommand::boxed(&[]), secs(30), secs(2), 2).unwrap();
        assert_eq!(command.separation_interval(), secs(30));
    }

    #[tokio::test]
    async fn test_failures_shrink_interval_to_minimum() {
        let command = BackoffCommand::new(
            ScriptedCommand::boxed(&[false, false, false, false]),
            secs(8),
            secs(1),
            2,
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let mut intervals = Vec::new();
        for _ in 0..4 {
            command.execute(&cancel).await.unwrap();
            intervals.push(command.separation_interval());
        }

        assert_eq!(intervals, vec![secs(4), secs(2), secs(1), secs(1)]);
        assert_eq!(command.consecutive_failures(), 4);
    }

    #[tokio::test]
    async fn test_success_resets_interval() {
        let command = BackoffCommand::new(
            ScriptedCommand::boxed(&[false, false, true]),
            secs(30),
            secs(2),
            2,
        )
        .unwrap();
        let cancel = CancellationToken::new();

        command.execute(&cancel).await.unwrap();
        command.execute(&cancel).await.unwrap();
        assert_eq!(command.separation_interval(), Duration::from_millis(7500));

        command.execute(&cancel).await.unwrap();
        assert_eq!(command.separation_interval(), secs(30));
        assert_eq!(command.consecutive_failures(), 0);
    }

    #[test]
    fn test_divisor_one_keeps_normal_interval() {
        let command =
            BackoffCommand::new(ScriptedCommand::boxed(&[]), secs(10), secs(1), 1).unwrap();
        assert_eq!(command.interval_after(50), secs(10));
    }

    #[test]
    fn test_overflow_saturates_to_minimum() {
        let command =
            BackoffCommand::new(ScriptedCommand::boxed(&[]), secs(10), secs(3), 10).unwrap();
        assert_eq!(command.interval_after(u32::MAX), secs(3));
    }
}
