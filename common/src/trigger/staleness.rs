// Staleness evaluation over arbitrary binding lists
// Only blob bindings carry timestamps; every other binding kind is neutral.

use crate::blob_path::{BlobPathPattern, RouteParams};
use crate::errors::TriggerError;
use crate::models::ContainerIdentity;
use crate::storage::TimestampOracle;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingDirection {
    Input,
    Output,
}

/// Statically declared binding of a function parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    BlobInput(BlobPathPattern),
    BlobOutput(BlobPathPattern),
    QueueInput(String),
    QueueOutput(String),
    Table(String),
    Literal(String),
}

impl BindingKind {
    /// Blob bindings and their direction; `None` for kinds without timestamps
    pub fn blob(&self) -> Option<(BindingDirection, &BlobPathPattern)> {
        match self {
            BindingKind::BlobInput(pattern) => Some((BindingDirection::Input, pattern)),
            BindingKind::BlobOutput(pattern) => Some((BindingDirection::Output, pattern)),
            BindingKind::QueueInput(_)
            | BindingKind::QueueOutput(_)
            | BindingKind::Table(_)
            | BindingKind::Literal(_) => None,
        }
    }
}

/// Outcome of a staleness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDecision {
    /// Outputs are missing or older than the newest input
    Required,
    /// Every output is at least as new as every input
    NotRequired,
    /// No inputs or no outputs to compare; the caller decides
    DontCare,
}

/// (direction, timestamp) per bound blob, in binding order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTimestampSet {
    entries: Vec<(BindingDirection, Option<DateTime<Utc>>)>,
}

impl BindingTimestampSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, direction: BindingDirection, timestamp: Option<DateTime<Utc>>) {
        self.entries.push((direction, timestamp));
    }

    pub fn with_input(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.push(BindingDirection::Input, timestamp);
        self
    }

    pub fn with_output(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.push(BindingDirection::Output, timestamp);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch the timestamp of every blob binding, bound with `params`
    #[instrument(skip(oracle, container, bindings, params), fields(container = %container))]
    pub async fn resolve(
        oracle: &TimestampOracle,
        container: &ContainerIdentity,
        bindings: &[BindingKind],
        params: &RouteParams,
    ) -> Result<Self, TriggerError> {
        let mut set = Self::new();
        for (direction, pattern) in bindings.iter().filter_map(BindingKind::blob) {
            let blob = pattern.bind_blob(container, params)?;
            let timestamp = oracle.get_last_modified(&blob).await?;
            debug!(blob = %blob, ?direction, ?timestamp, "Binding timestamp resolved");
            set.push(direction, timestamp);
        }
        Ok(set)
    }
}

pub struct StalenessEvaluator;

impl StalenessEvaluator {
    /// Decide whether a function must run to bring its outputs up to date
    ///
    /// The newest input must be strictly newer than the stalest output; an
    /// output that does not exist always requires a run. Equal timestamps do
    /// not.
    pub fn evaluate(set: &BindingTimestampSet) -> ExecutionDecision {
        let newest_input = set
            .entries
            .iter()
            .filter(|(direction, _)| *direction == BindingDirection::Input)
            .filter_map(|(_, timestamp)| *timestamp)
            .max();
        let outputs: Vec<Option<DateTime<Utc>>> = set
            .entries
            .iter()
            .filter(|(direction, _)| *direction == BindingDirection::Output)
            .map(|(_, timestamp)| *timestamp)
            .collect();

        let Some(newest_input) = newest_input else {
            return ExecutionDecision::DontCare;
        };
        if outputs.is_empty() {
            return ExecutionDecision::DontCare;
        }

        let mut stalest_output = None;
        for output in outputs {
            match output {
                None => return ExecutionDecision::Required,
                Some(timestamp) => {
                    stalest_output = Some(stalest_output.map_or(timestamp, |s: DateTime<Utc>| {
                        s.min(timestamp)
                    }));
                }
            }
        }

        match stalest_output {
            Some(stalest) if newest_input > stalest => ExecutionDecision::Required,
            _ => ExecutionDecision::NotRequired,
        }
    }

    /// Resolve `bindings` against storage and evaluate them
    pub async fn evaluate_bindings(
        oracle: &TimestampOracle,
        container: &ContainerIdentity,
        bindings: &[BindingKind],
        params: &RouteParams,
    ) -> Result<ExecutionDecision, TriggerError> {
        let set = BindingTimestampSet::resolve(oracle, container, bindings, params).await?;
        Ok(Self::evaluate(&set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountIdentity;
    use crate::storage::MemoryBlobStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap())
    }

    #[test]
    fn test_empty_sides_dont_care() {
        let only_inputs = BindingTimestampSet::new().with_input(at(1));
        let only_outputs = BindingTimestampSet::new().with_output(at(1));
        assert_eq!(StalenessEvaluator::evaluate(&only_inputs), ExecutionDecision::DontCare);
        assert_eq!(StalenessEvaluator::evaluate(&only_outputs), ExecutionDecision::DontCare);
        assert_eq!(
            StalenessEvaluator::evaluate(&BindingTimestampSet::new()),
            ExecutionDecision::DontCare
        );
    }

    #[test]
    fn test_newer_input_requires_run() {
        let set = BindingTimestampSet::new().with_input(at(2)).with_output(at(1));
        assert_eq!(StalenessEvaluator::evaluate(&set), ExecutionDecision::Required);
    }

    #[test]
    fn test_older_input_not_required() {
        let set = BindingTimestampSet::new().with_input(at(1)).with_output(at(2));
        assert_eq!(StalenessEvaluator::evaluate(&set), ExecutionDecision::NotRequired);
    }

    #[test]
    fn test_missing_output_requires_run() {
        let set = BindingTimestampSet::new().with_input(at(1)).with_output(None);
        assert_eq!(StalenessEvaluator::evaluate(&set), ExecutionDecision::Required);
    }

    #[test]
    fn test_newest_input_against_stalest_output() {
        let inputs_straddle = BindingTimestampSet::new()
            .with_input(at(1))
            .with_input(at(3))
            .with_output(at(2));
        assert_eq!(
            StalenessEvaluator::evaluate(&inputs_straddle),
            ExecutionDecision::Required
        );

        let outputs_straddle = BindingTimestampSet::new()
            .with_input(at(2))
            .with_output(at(1))
            .with_output(at(3));
        assert_eq!(
            StalenessEvaluator::evaluate(&outputs_straddle),
            ExecutionDecision::Required
        );
    }

    #[test]
    fn test_equal_timestamps_not_required() {
        let set = BindingTimestampSet::new().with_input(at(5)).with_output(at(5));
        assert_eq!(StalenessEvaluator::evaluate(&set), ExecutionDecision::NotRequired);
    }

    #[test]
    fn test_absent_inputs_are_ignored() {
        let set = BindingTimestampSet::new()
            .with_input(None)
            .with_input(at(1))
            .with_output(at(2));
        assert_eq!(StalenessEvaluator::evaluate(&set), ExecutionDecision::NotRequired);
    }

    #[tokio::test]
    async fn test_evaluate_bindings_skips_non_blob_kinds() {
        let account = AccountIdentity::new("prod");
        let store = MemoryBlobStore::new(account.clone());
        store.put_blob_at("input", "a.txt", b"in", at(3).unwrap());
        store.put_blob_at("output", "a.txt", b"out", at(1).unwrap());
        let oracle = TimestampOracle::new(Arc::new(store));

        let bindings = vec![
            BindingKind::QueueInput("orders".to_string()),
            BindingKind::BlobInput(BlobPathPattern::parse("input/{name}").unwrap()),
            BindingKind::Table("audit".to_string()),
            BindingKind::BlobOutput(BlobPathPattern::parse("output/{name}").unwrap()),
            BindingKind::Literal("constant".to_string()),
        ];
        let mut params = RouteParams::new();
        params.insert("name".to_string(), "a.txt".to_string());
        let container = ContainerIdentity::new(account, "input");

        let set = BindingTimestampSet::resolve(&oracle, &container, &bindings, &params)
            .await
            .unwrap();
        assert_eq!(set.len(), 2);

        let decision =
            StalenessEvaluator::evaluate_bindings(&oracle, &container, &bindings, &params)
                .await
                .unwrap();
        assert_eq!(decision, ExecutionDecision::Required);
    }

    #[tokio::test]
    async fn test_unbound_parameter_is_an_error() {
        let account = AccountIdentity::new("prod");
        let oracle = TimestampOracle::new(Arc::new(MemoryBlobStore::new(account.clone())));
        let bindings = vec![BindingKind::BlobOutput(
            BlobPathPattern::parse("output/{missing}").unwrap(),
        )];
        let container = ContainerIdentity::new(account, "input");

        let result =
            BindingTimestampSet::resolve(&oracle, &container, &bindings, &RouteParams::new())
                .await;
        assert!(matches!(result, Err(TriggerError::Pattern(_))));
    }
}
