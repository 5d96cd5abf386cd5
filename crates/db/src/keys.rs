//! Key schema.
//!
//! Per-widget keys wrap the widget id in a hash tag (`{id}`) so the record,
//! stats, submission list, submissions, and daily counters all land in the
//! same slot and can be written in one transaction. Owner timelines are
//! tagged by owner id. The type/visibility indexes and the global timeline
//! are plain global keys with no tag.

use chrono::NaiveDate;
use crc16::{State, XMODEM};
use widgetry_core::types::{SubmissionId, WidgetId};
use widgetry_core::widget_types::WidgetType;

/// Number of cluster hash slots.
pub const SLOT_COUNT: u16 = 16_384;

/// Global timeline of every widget (score = created_at in nanoseconds).
pub const GLOBAL_TIMELINE_KEY: &str = "widgets:by_time";

/// Outbox of widgets whose indexes need reconciling (`"{id}|{owner}"` members).
pub const RECONCILE_QUEUE_KEY: &str = "widgets:reconcile";

/// Prefix for per-query temporary keys.
pub const TEMP_KEY_PREFIX: &str = "widgets:tmp";

/// Scan pattern matching every widget record.
pub const RECORD_KEY_PATTERN: &str = "*:widget";

/// Scan pattern matching every owner timeline.
pub const TIMELINE_KEY_PATTERN: &str = "*:user:widgets";

/// Scan pattern matching every type index.
pub const TYPE_INDEX_PATTERN: &str = "widgets:type:*";

/// Scan pattern matching both visibility indexes.
pub const VISIBILITY_INDEX_PATTERN: &str = "widgets:isVisible:*";

const RECORD_SUFFIX: &str = ":widget";
const TIMELINE_SUFFIX: &str = ":user:widgets";

// ---------------------------------------------------------------------------
// Per-widget keys (colocated)
// ---------------------------------------------------------------------------

pub fn record_key(id: &WidgetId) -> String {
    format!("{{{id}}}:widget")
}

pub fn stats_key(id: &WidgetId) -> String {
    format!("{{{id}}}:stats")
}

pub fn submissions_key(id: &WidgetId) -> String {
    format!("{{{id}}}:submissions")
}

pub fn submission_key(id: &WidgetId, submission_id: &SubmissionId) -> String {
    format!("{{{id}}}:submission:{submission_id}")
}

pub fn daily_views_key(id: &WidgetId, date: NaiveDate) -> String {
    format!("{{{id}}}:views:{}", date.format("%Y-%m-%d"))
}

// ---------------------------------------------------------------------------
// Per-owner and global keys
// ---------------------------------------------------------------------------

pub fn timeline_key(owner_id: &str) -> String {
    format!("{{{owner_id}}}{TIMELINE_SUFFIX}")
}

pub fn type_index_key(widget_type: WidgetType) -> String {
    format!("widgets:type:{widget_type}")
}

pub fn visibility_index_key(is_visible: bool) -> String {
    format!("widgets:isVisible:{}", u8::from(is_visible))
}

/// Every type-index key, in [`WidgetType::ALL`] order.
pub fn all_type_index_keys() -> Vec<String> {
    WidgetType::ALL.into_iter().map(type_index_key).collect()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Recover the widget id from a record key produced by [`record_key`].
pub fn widget_id_from_record_key(key: &str) -> Option<WidgetId> {
    let inner = key
        .strip_suffix(RECORD_SUFFIX)?
        .strip_prefix('{')?
        .strip_suffix('}')?;
    WidgetId::parse_str(inner).ok()
}

/// Recover the owner id from a timeline key produced by [`timeline_key`].
pub fn owner_from_timeline_key(key: &str) -> Option<&str> {
    key.strip_suffix(TIMELINE_SUFFIX)?
        .strip_prefix('{')?
        .strip_suffix('}')
}

// ---------------------------------------------------------------------------
// Hash slots
// ---------------------------------------------------------------------------

/// The part of `key` that determines its slot: the content of the first
/// `{...}` section when it is non-empty, otherwise the whole key.
pub fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        let rest = &key[open + 1..];
        if let Some(close) = rest.find('}') {
            if close > 0 {
                return &rest[..close];
            }
        }
    }
    key
}

/// Cluster hash slot of `key` (CRC16/XMODEM of the hash tag, mod 16384).
pub fn hash_slot(key: &str) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key).as_bytes()) % SLOT_COUNT
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
