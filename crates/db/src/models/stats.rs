//! Per-widget usage counters.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use widgetry_core::types::{Timestamp, WidgetId};

use super::fields::{counter, decode_timestamp};
use crate::error::StoreError;

const ENTITY: &str = "widget stats";

pub const FIELD_VIEWS: &str = "views";
pub const FIELD_SUBMITS: &str = "submits";
pub const FIELD_CLOSES: &str = "closes";
pub const FIELD_LAST_VIEW: &str = "last_view";

/// Counters stored as the hash at `{id}:stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetStats {
    pub widget_id: WidgetId,
    pub views: u64,
    pub submits: u64,
    pub closes: u64,
    pub last_view: Option<Timestamp>,
}

impl WidgetStats {
    pub fn zeroed(widget_id: WidgetId) -> Self {
        Self {
            widget_id,
            views: 0,
            submits: 0,
            closes: 0,
            last_view: None,
        }
    }

    /// The initial stats blob written alongside a new widget.
    pub fn zeroed_fields() -> Vec<(String, String)> {
        vec![
            (FIELD_VIEWS.into(), "0".into()),
            (FIELD_SUBMITS.into(), "0".into()),
            (FIELD_CLOSES.into(), "0".into()),
        ]
    }

    /// Decode a stats blob. An empty hash means no stats exist.
    pub fn from_fields(
        widget_id: WidgetId,
        fields: &HashMap<String, String>,
    ) -> Result<Option<Self>, StoreError> {
        if fields.is_empty() {
            return Ok(None);
        }
        let last_view = fields
            .get(FIELD_LAST_VIEW)
            .map(|raw| decode_timestamp(ENTITY, raw))
            .transpose()?;
        Ok(Some(Self {
            widget_id,
            views: counter(ENTITY, fields, FIELD_VIEWS)?,
            submits: counter(ENTITY, fields, FIELD_SUBMITS)?,
            closes: counter(ENTITY, fields, FIELD_CLOSES)?,
            last_view,
        }))
    }
}

/// Which counter an increment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Views,
    Submits,
    Closes,
}

impl StatField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Views => FIELD_VIEWS,
            Self::Submits => FIELD_SUBMITS,
            Self::Closes => FIELD_CLOSES,
        }
    }
}

/// Views recorded on one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyViews {
    pub date: NaiveDate,
    pub views: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn zeroed_blob_decodes_to_zero_counters() {
        let id = WidgetId::now_v7();
        let map: HashMap<String, String> = WidgetStats::zeroed_fields().into_iter().collect();
        assert_eq!(
            WidgetStats::from_fields(id, &map).unwrap(),
            Some(WidgetStats::zeroed(id))
        );
    }

    #[test]
    fn decodes_last_view() {
        let id = WidgetId::now_v7();
        let now = Utc::now();
        let map = HashMap::from([
            (FIELD_VIEWS.to_string(), "7".to_string()),
            (
                FIELD_LAST_VIEW.to_string(),
                super::super::fields::encode_timestamp(&now),
            ),
        ]);
        let stats = WidgetStats::from_fields(id, &map).unwrap().unwrap();
        assert_eq!(stats.views, 7);
        assert_eq!(stats.submits, 0);
        assert_eq!(stats.last_view, Some(now));
    }

    #[test]
    fn garbage_counter_is_a_decode_error() {
        let map = HashMap::from([(FIELD_CLOSES.to_string(), "x".to_string())]);
        assert!(WidgetStats::from_fields(WidgetId::nil(), &map).is_err());
    }
}
