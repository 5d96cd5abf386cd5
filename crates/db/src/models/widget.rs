//! Widget record model and DTOs.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;
use widgetry_core::types::{OwnerId, Timestamp, WidgetId};
use widgetry_core::widget_types::WidgetType;

use super::fields::{
    decode_bool, decode_error, decode_timestamp, encode_bool, encode_timestamp, required,
};
use super::stats::WidgetStats;
use crate::error::StoreError;

const ENTITY: &str = "widget";

pub const FIELD_ID: &str = "id";
pub const FIELD_OWNER_ID: &str = "owner_id";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_NAME: &str = "name";
pub const FIELD_IS_VISIBLE: &str = "is_visible";
pub const FIELD_CONFIG: &str = "config";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_VERSION: &str = "version";

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A lead-capture widget, stored as the hash at `{id}:widget`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: WidgetId,
    pub owner_id: OwnerId,
    #[serde(rename = "type")]
    pub widget_type: WidgetType,
    pub name: String,
    pub is_visible: bool,
    pub config: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Optimistic concurrency token, bumped on every committed update.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<WidgetStats>,
}

impl Widget {
    /// A fresh widget with a new time-ordered id, created now.
    pub fn new(
        owner_id: impl Into<OwnerId>,
        widget_type: WidgetType,
        name: impl Into<String>,
        is_visible: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WidgetId::now_v7(),
            owner_id: owner_id.into(),
            widget_type,
            name: name.into(),
            is_visible,
            config: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
            version: 1,
            stats: None,
        }
    }

    pub fn from_create(input: &CreateWidget) -> Self {
        let mut widget = Self::new(
            input.owner_id.clone(),
            input.widget_type,
            input.name.clone(),
            input.is_visible,
        );
        widget.config = input.config.clone();
        widget
    }

    /// Timeline score: creation time in nanoseconds since the epoch.
    pub fn timeline_score(&self) -> f64 {
        match self.created_at.timestamp_nanos_opt() {
            Some(nanos) => nanos as f64,
            None => self.created_at.timestamp() as f64 * 1e9,
        }
    }

    /// The widget after applying `input`, with a bumped version.
    pub fn with_update(&self, input: &UpdateWidget, now: Timestamp) -> Self {
        let mut next = self.clone();
        if let Some(name) = &input.name {
            next.name = name.clone();
        }
        if let Some(widget_type) = input.widget_type {
            next.widget_type = widget_type;
        }
        if let Some(is_visible) = input.is_visible {
            next.is_visible = is_visible;
        }
        if let Some(config) = &input.config {
            next.config = config.clone();
        }
        next.updated_at = now;
        next.version = self.version + 1;
        next.stats = None;
        next
    }

    /// Hash fields for the record blob. Stats are stored separately.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_ID.into(), self.id.to_string()),
            (FIELD_OWNER_ID.into(), self.owner_id.clone()),
            (FIELD_TYPE.into(), self.widget_type.as_str().into()),
            (FIELD_NAME.into(), self.name.clone()),
            (FIELD_IS_VISIBLE.into(), encode_bool(self.is_visible)),
            (FIELD_CONFIG.into(), self.config.to_string()),
            (FIELD_CREATED_AT.into(), encode_timestamp(&self.created_at)),
            (FIELD_UPDATED_AT.into(), encode_timestamp(&self.updated_at)),
            (FIELD_VERSION.into(), self.version.to_string()),
        ]
    }

    /// Decode a record blob. An empty hash means the record does not exist.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Option<Self>, StoreError> {
        if fields.is_empty() {
            return Ok(None);
        }

        let id = required(ENTITY, fields, FIELD_ID)?;
        let id = WidgetId::parse_str(id)
            .map_err(|e| decode_error(ENTITY, format!("bad id '{id}': {e}")))?;
        let raw_type = required(ENTITY, fields, FIELD_TYPE)?;
        let widget_type = WidgetType::from_known(raw_type)
            .ok_or_else(|| decode_error(ENTITY, format!("unknown type '{raw_type}'")))?;
        let config = match fields.get(FIELD_CONFIG) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| decode_error(ENTITY, format!("bad config: {e}")))?,
            None => serde_json::Value::Null,
        };
        let version = match fields.get(FIELD_VERSION) {
            Some(raw) => raw
                .parse()
                .map_err(|_| decode_error(ENTITY, format!("bad version '{raw}'")))?,
            None => 0,
        };

        Ok(Some(Self {
            id,
            owner_id: required(ENTITY, fields, FIELD_OWNER_ID)?.to_string(),
            widget_type,
            name: required(ENTITY, fields, FIELD_NAME)?.to_string(),
            is_visible: decode_bool(ENTITY, required(ENTITY, fields, FIELD_IS_VISIBLE)?)?,
            config,
            created_at: decode_timestamp(ENTITY, required(ENTITY, fields, FIELD_CREATED_AT)?)?,
            updated_at: decode_timestamp(ENTITY, required(ENTITY, fields, FIELD_UPDATED_AT)?)?,
            version,
            stats: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

fn default_visible() -> bool {
    true
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// DTO for creating a widget.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateWidget {
    #[validate(length(min = 1, max = 128))]
    pub owner_id: OwnerId,
    #[serde(rename = "type")]
    pub widget_type: WidgetType,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

/// DTO for updating a widget. Absent fields are left unchanged; the owner
/// and id are immutable.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateWidget {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub widget_type: Option<WidgetType>,
    pub is_visible: Option<bool>,
    pub config: Option<serde_json::Value>,
}

impl From<&Widget> for UpdateWidget {
    fn from(widget: &Widget) -> Self {
        Self {
            name: Some(widget.name.clone()),
            widget_type: Some(widget.widget_type),
            is_visible: Some(widget.is_visible),
            config: Some(widget.config.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    fn decode(widget: &Widget) -> Widget {
        let map: HashMap<String, String> = widget.to_fields().into_iter().collect();
        Widget::from_fields(&map).unwrap().unwrap()
    }

    #[test]
    fn record_fields_preserve_every_attribute() {
        let mut w = Widget::new("owner-1", WidgetType::Quiz, "Quiz: {odd} name", false);
        w.config = serde_json::json!({"steps": [1, 2], "color": "#fff"});
        assert_eq!(decode(&w), w);
    }

    #[test]
    fn empty_hash_is_absent() {
        assert_eq!(Widget::from_fields(&HashMap::new()).unwrap(), None);
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let w = Widget::new("o", WidgetType::Banner, "b", true);
        let mut map: HashMap<String, String> = w.to_fields().into_iter().collect();
        map.insert(FIELD_TYPE.into(), "carousel".into());
        assert!(matches!(
            Widget::from_fields(&map),
            Err(StoreError::Decode { entity: "widget", .. })
        ));
    }

    #[test]
    fn update_bumps_version_and_keeps_identity() {
        let w = Widget::new("o", WidgetType::Banner, "b", true);
        let input = UpdateWidget {
            widget_type: Some(WidgetType::Popup),
            is_visible: Some(false),
            ..Default::default()
        };
        let next = w.with_update(&input, Utc::now());
        assert_eq!(next.id, w.id);
        assert_eq!(next.owner_id, w.owner_id);
        assert_eq!(next.created_at, w.created_at);
        assert_eq!(next.name, "b");
        assert_eq!(next.widget_type, WidgetType::Popup);
        assert!(!next.is_visible);
        assert_eq!(next.version, w.version + 1);
    }

    #[test]
    fn create_dto_defaults_and_validation() {
        let input: CreateWidget =
            serde_json::from_str(r#"{"owner_id":"u1","type":"lead-form","name":"Signup"}"#)
                .unwrap();
        assert!(input.is_visible);
        assert!(input.config.is_object());
        assert!(input.validate().is_ok());

        let bad = CreateWidget {
            name: String::new(),
            ..input
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn timeline_score_is_nanoseconds() {
        let w = Widget::new("o", WidgetType::Banner, "b", true);
        let expected = w.created_at.timestamp_nanos_opt().unwrap() as f64;
        assert_eq!(w.timeline_score(), expected);
    }
}
