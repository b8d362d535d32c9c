// Causality envelope for queue messages and blob metadata
// The owner id sits beside the payload, never inside it, so the payload
// deserializes unchanged whatever its shape.

use crate::errors::CausalityError;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Envelope field carrying the id of the invocation that produced a message
pub const PARENT_ID_FIELD: &str = "$AzureJobsParentId";

/// Blob metadata key carrying the id of the invocation that wrote the blob
pub const PARENT_ID_METADATA_KEY: &str = "azurejobsparentid";

/// Owner invocation id and the caller's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalityToken {
    pub owner: Option<Uuid>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    #[serde(rename = "$AzureJobsParentId")]
    parent_id: Uuid,
    payload: String,
}

/// Encodes and decodes causality envelopes
pub struct CausalityCodec;

impl CausalityCodec {
    /// Wrap `payload` with its owner id
    pub fn encode(owner: Uuid, payload: &[u8]) -> Result<Vec<u8>, CausalityError> {
        let envelope = Envelope {
            parent_id: owner,
            payload: general_purpose::STANDARD.encode(payload),
        };
        serde_json::to_vec(&envelope).map_err(|e| CausalityError::SerializationFailed(e.to_string()))
    }

    /// Unwrap an envelope produced by [`CausalityCodec::encode`]
    pub fn decode(message: &[u8]) -> Result<CausalityToken, CausalityError> {
        let envelope: Envelope = serde_json::from_slice(message)
            .map_err(|e| CausalityError::NotAnEnvelope(e.to_string()))?;
        let payload = general_purpose::STANDARD
            .decode(envelope.payload.as_bytes())
            .map_err(|e| CausalityError::InvalidPayload(e.to_string()))?;

        Ok(CausalityToken {
            owner: Some(envelope.parent_id),
            payload,
        })
    }

    /// Like [`CausalityCodec::decode`], but a message written without an
    /// envelope is returned as its own payload with no owner
    pub fn decode_or_raw(message: &[u8]) -> CausalityToken {
        Self::decode(message).unwrap_or_else(|_| CausalityToken {
            owner: None,
            payload: message.to_vec(),
        })
    }

    /// Parent id recorded in blob metadata, if any
    pub fn parent_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
        metadata
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(PARENT_ID_METADATA_KEY))
            .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
    }

    /// Record `owner` as the writer of a blob
    pub fn set_parent_id(metadata: &mut HashMap<String, String>, owner: Uuid) {
        metadata.insert(PARENT_ID_METADATA_KEY.to_string(), owner.to_string());
    }
}
