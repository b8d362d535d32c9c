// Property-based tests for failure backoff intervals

use async_trait::async_trait;
use common::timer::{BackoffCommand, CanFailCommand};
use proptest::prelude::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct NeverRuns;

#[async_trait]
impl CanFailCommand for NeverRuns {
    async fn try_execute(&self, _cancel: &CancellationToken) -> bool {
        true
    }
}

fn command(normal: u64, minimum: u64, divisor: u32) -> BackoffCommand {
    BackoffCommand::new(
        Box::new(NeverRuns),
        Duration::from_millis(normal),
        Duration::from_millis(minimum),
        divisor,
    )
    .unwrap()
}

/// **Property 9: Interval stays within bounds**
///
/// *For any* valid parameters and failure count, the interval lies between
/// the minimum and the normal interval.
#[test]
fn property_interval_bounded() {
    proptest!(|(
        normal in 1u64..1_000_000,
        minimum_fraction in 0u64..=100,
        divisor in 1u32..10,
        failures in 0u32..200,
    )| {
        let minimum = normal * minimum_fraction / 100;
        let command = command(normal, minimum, divisor);
        let interval = command.interval_after(failures);

        prop_assert!(interval >= Duration::from_millis(minimum));
        prop_assert!(interval <= Duration::from_millis(normal));
    });
}

/// **Property 10: More failures never lengthen the interval**
#[test]
fn property_interval_non_increasing() {
    proptest!(|(
        normal in 1u64..1_000_000,
        minimum_fraction in 0u64..=100,
        divisor in 1u32..10,
        failures in 0u32..100,
    )| {
        let minimum = normal * minimum_fraction / 100;
        let command = command(normal, minimum, divisor);
        prop_assert!(command.interval_after(failures + 1) <= command.interval_after(failures));
    });
}

/// **Property 11: Minimum above normal is rejected**
#[test]
fn property_invalid_minimum_rejected() {
    proptest!(|(normal in 0u64..1_000, extra in 1u64..1_000)| {
        let result = BackoffCommand::new(
            Box::new(NeverRuns),
            Duration::from_millis(normal),
            Duration::from_millis(normal + extra),
            2,
        );
        prop_assert!(result.is_err());
    });
}
