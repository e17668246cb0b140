// engagement-consumer/src/payload.rs - Inbound MPM engagement payload

use canonsync::WorkError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::models::{EngagementDetails, OVERLAY_FIELDS};

/// Payload type tag of MPM engagement changes
pub const MPM_ENGAGEMENT_V2: &str = "mpm.engagement.v2";

/// Engagement as published by MPM. Every attribute the model does not know about
/// lands in `extension_data` and is carried into the MPM overlay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpmEngagementV2Payload {
    pub engagement_id: Uuid,
    #[serde(flatten)]
    pub details: EngagementDetails,
    #[serde(flatten)]
    pub extension_data: BTreeMap<String, Value>,
}

impl MpmEngagementV2Payload {
    /// Decode and validate a payload. Structural problems (including a missing
    /// engagementId, engagementNo, clientId or clientNo) are deserialization errors;
    /// a team listing the same person twice is a validation error.
    pub fn parse(value: &Value) -> Result<Self, WorkError> {
        let mut payload = Self::deserialize(value)
            .map_err(|e| WorkError::Deserialization(format!("Invalid {MPM_ENGAGEMENT_V2} payload: {e}")))?;

        for field in OVERLAY_FIELDS {
            if payload.extension_data.remove(field).is_some() {
                warn!(
                    engagement.id = %payload.engagement_id,
                    field = field,
                    "Ignoring payload attribute that shadows an overlay field"
                );
            }
        }

        if payload.details.team.has_duplicate_members() {
            return Err(WorkError::Validation("Team contains duplicate members".to_string()));
        }

        Ok(payload)
    }
}
