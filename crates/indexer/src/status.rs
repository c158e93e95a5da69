use crate::consistency::ConsistencyReport;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const INDEX_STATUS_SCHEMA_VERSION: u32 = 1;

/// Operator-facing view of an [`IndexOperationManager`](crate::IndexOperationManager).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct IndexOperationStatus {
    pub schema_version: u32,
    pub index_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_index_id: Option<String>,
    pub closed: bool,
    pub locked: bool,
    pub checking_consistency: bool,
    pub reindexing: bool,
    pub consistency_check: ConsistencyCheckStatus,
    pub reindex: ReindexStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ConsistencyCheckStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ConsistencyReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ReindexStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<usize>,
}

pub(crate) fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_sections_are_omitted() {
        let status = IndexOperationStatus {
            schema_version: INDEX_STATUS_SCHEMA_VERSION,
            index_id: "main".to_string(),
            secondary_index_id: None,
            closed: false,
            locked: false,
            checking_consistency: false,
            reindexing: true,
            consistency_check: ConsistencyCheckStatus::default(),
            reindex: ReindexStatus::default(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "schema_version": 1,
                "index_id": "main",
                "closed": false,
                "locked": false,
                "checking_consistency": false,
                "reindexing": true,
                "consistency_check": {},
                "reindex": {}
            })
        );
    }

    #[test]
    fn unix_ms_of_epoch_is_zero() {
        assert_eq!(unix_ms(UNIX_EPOCH), 0);
    }
}
