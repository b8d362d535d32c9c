// Trigger gate: decides whether a detected write runs its function
// A blob runs the function unless every declared output already exists and
// is strictly newer than the input.

use crate::errors::TriggerError;
use crate::models::{BlobIdentity, ContainerIdentity};
use crate::queue::causality::CausalityCodec;
use crate::storage::TimestampOracle;
use crate::trigger::{Registration, TriggerExecutor, TriggeredInvocation};
use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info, instrument};

pub struct TriggerGate {
    registration: Registration,
    oracle: TimestampOracle,
}

impl TriggerGate {
    pub fn new(registration: Registration, oracle: TimestampOracle) -> Self {
        Self {
            registration,
            oracle,
        }
    }

    pub fn function(&self) -> &str {
        &self.registration.function
    }

    pub fn container(&self) -> &ContainerIdentity {
        &self.registration.container
    }

    fn skip(&self, reason: &'static str) -> Result<bool, TriggerError> {
        counter!(
            "blob_trigger_skipped_total",
            "function" => self.registration.function.clone(),
            "reason" => reason
        )
        .increment(1);
        Ok(false)
    }
}

#[async_trait]
impl TriggerExecutor for TriggerGate {
    #[instrument(skip(self, blob), fields(function = %self.registration.function, blob = %blob))]
    async fn execute(&self, blob: &BlobIdentity) -> Result<bool, TriggerError> {
        let registration = &self.registration;

        let Some(route_params) = registration.input.match_blob(blob) else {
            debug!(pattern = %registration.input, "Blob does not match input pattern");
            return self.skip("no_match");
        };

        let Some(input) = self.oracle.get_properties(blob).await? else {
            debug!("Input blob no longer exists");
            return self.skip("input_missing");
        };

        if !registration.outputs.is_empty() {
            let mut outputs_current = true;
            for output in &registration.outputs {
                let output_blob = output.bind_blob(&registration.container, &route_params)?;
                match self.oracle.get_last_modified(&output_blob).await? {
                    Some(written) if written > input.last_modified => {}
                    found => {
                        debug!(
                            output = %output_blob,
                            output_modified = ?found,
                            input_modified = %input.last_modified,
                            "Output missing or not newer than input"
                        );
                        outputs_current = false;
                        break;
                    }
                }
            }

            if outputs_current {
                debug!("All outputs are newer than the input");
                return self.skip("outputs_current");
            }
        }

        let parent_id = CausalityCodec::parent_id_from_metadata(&input.metadata);
        let invocation = TriggeredInvocation {
            function: registration.function.clone(),
            blob: blob.clone(),
            route_params,
            parent_id,
        };

        registration
            .invoker
            .invoke(invocation)
            .await
            .map_err(|e| TriggerError::Invocation {
                function: registration.function.clone(),
                reason: e.to_string(),
            })?;

        counter!(
            "blob_trigger_invocations_total",
            "function" => registration.function.clone()
        )
        .increment(1);
        info!(parent_id = ?parent_id, "Function invoked for blob");
        Ok(true)
    }
}
