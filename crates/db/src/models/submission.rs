//! Visitor submission model and DTOs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;
use widgetry_core::types::{SubmissionId, Timestamp, WidgetId};

use super::fields::{decode_error, decode_timestamp, encode_timestamp, required};
use crate::error::StoreError;

const ENTITY: &str = "submission";

pub const FIELD_ID: &str = "id";
pub const FIELD_WIDGET_ID: &str = "widget_id";
pub const FIELD_DATA: &str = "data";
pub const FIELD_CREATED_AT: &str = "created_at";

/// One visitor payload, stored as the hash at `{widgetId}:submission:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub widget_id: WidgetId,
    pub data: serde_json::Value,
    pub created_at: Timestamp,
    /// When the store will drop this submission, if it has a TTL. Derived
    /// from the key's remaining TTL on read, never stored in the hash.
    pub expires_at: Option<Timestamp>,
}

impl Submission {
    /// Sorted-set score in the widget's submission list.
    pub fn list_score(&self) -> f64 {
        match self.created_at.timestamp_nanos_opt() {
            Some(nanos) => nanos as f64,
            None => self.created_at.timestamp() as f64 * 1e9,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_ID.into(), self.id.to_string()),
            (FIELD_WIDGET_ID.into(), self.widget_id.to_string()),
            (FIELD_DATA.into(), self.data.to_string()),
            (FIELD_CREATED_AT.into(), encode_timestamp(&self.created_at)),
        ]
    }

    /// Set `expires_at` from a `PTTL` reply taken at `now`.
    pub fn with_remaining_ttl(mut self, pttl_ms: i64, now: Timestamp) -> Self {
        self.expires_at = if pttl_ms >= 0 {
            now.checked_add_signed(chrono::Duration::milliseconds(pttl_ms))
        } else {
            None
        };
        self
    }

    /// Decode a submission blob. An empty hash means it expired or never existed.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Option<Self>, StoreError> {
        if fields.is_empty() {
            return Ok(None);
        }
        let parse_id = |name: &str| -> Result<uuid::Uuid, StoreError> {
            let raw = required(ENTITY, fields, name)?;
            uuid::Uuid::parse_str(raw)
                .map_err(|e| decode_error(ENTITY, format!("bad {name} '{raw}': {e}")))
        };
        let data = serde_json::from_str(required(ENTITY, fields, FIELD_DATA)?)
            .map_err(|e| decode_error(ENTITY, format!("bad data: {e}")))?;

        Ok(Some(Self {
            id: parse_id(FIELD_ID)?,
            widget_id: parse_id(FIELD_WIDGET_ID)?,
            data,
            created_at: decode_timestamp(ENTITY, required(ENTITY, fields, FIELD_CREATED_AT)?)?,
            expires_at: None,
        }))
    }
}

/// Longest retention a submission may be given: ten years.
pub const MAX_SUBMISSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// DTO for recording a submission.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSubmission {
    pub data: serde_json::Value,
    /// Retention in seconds; `None` keeps the submission until the widget is deleted.
    #[validate(range(min = 1, max = MAX_SUBMISSION_TTL_SECS))]
    pub ttl_secs: Option<u64>,
}

/// Outcome of a bulk TTL re-application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TtlReport {
    /// Widgets whose submission lists were walked.
    pub widgets: usize,
    /// Submissions whose expiry was reset.
    pub updated: usize,
    /// Dangling list entries (already expired) removed along the way.
    pub pruned: usize,
    /// Submissions whose expiry could not be reset.
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> Submission {
        Submission {
            id: SubmissionId::now_v7(),
            widget_id: WidgetId::now_v7(),
            data: serde_json::json!({"email": "a@b.c"}),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn fields_preserve_payload() {
        let s = sample();
        let map: HashMap<String, String> = s.to_fields().into_iter().collect();
        assert_eq!(Submission::from_fields(&map).unwrap(), Some(s));
    }

    #[test]
    fn remaining_ttl_sets_expiry() {
        let now = Utc::now();
        let s = sample().with_remaining_ttl(1_500, now);
        assert_eq!(s.expires_at, Some(now + chrono::Duration::milliseconds(1_500)));

        assert_eq!(sample().with_remaining_ttl(-1, now).expires_at, None);
    }

    #[test]
    fn retention_is_bounded() {
        let input = |ttl_secs| CreateSubmission {
            data: serde_json::json!({}),
            ttl_secs,
        };
        assert!(input(None).validate().is_ok());
        assert!(input(Some(MAX_SUBMISSION_TTL_SECS)).validate().is_ok());
        assert!(input(Some(0)).validate().is_err());
        assert!(input(Some(MAX_SUBMISSION_TTL_SECS + 1)).validate().is_err());
        assert!(input(Some(u64::MAX / 2)).validate().is_err());
    }

    #[test]
    fn huge_remaining_ttl_has_no_expiry() {
        assert_eq!(sample().with_remaining_ttl(i64::MAX, Utc::now()).expires_at, None);
    }
}
