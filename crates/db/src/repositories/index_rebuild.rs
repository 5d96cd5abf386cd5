//! Full index rebuild from authoritative records, and index snapshots.
//!
//! The rebuild is the recovery path for index drift the reconciliation
//! outbox could not repair. It is not atomic: queries running during a
//! rebuild may briefly see empty indexes.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::StoreError;
use crate::keys::{
    all_type_index_keys, owner_from_timeline_key, visibility_index_key,
    widget_id_from_record_key, GLOBAL_TIMELINE_KEY, RECORD_KEY_PATTERN, TIMELINE_KEY_PATTERN,
    TYPE_INDEX_PATTERN, VISIBILITY_INDEX_PATTERN,
};
use crate::models::widget::Widget;
use crate::repositories::widget_index::WidgetIndex;
use crate::store::{Pipeline, Store};

/// Records read per pipeline during a rebuild.
pub const REBUILD_LOAD_BATCH: usize = 50;

/// Widgets re-indexed per write pipeline.
const REBUILD_WRITE_BATCH: usize = 200;

/// Outcome of [`IndexRebuild::rebuild`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Widgets written back into the indexes.
    pub widgets_indexed: usize,
    /// Distinct owners with at least one widget.
    pub owners: usize,
    /// Record keys that could not be decoded.
    pub skipped: usize,
}

pub struct IndexRebuild;

impl IndexRebuild {
    /// Recompute every index from the widget records.
    ///
    /// Scans all records, clears every type set, both visibility sets, the
    /// global timeline, and every owner timeline, then re-adds each widget.
    pub async fn rebuild(store: &Store) -> Result<RebuildReport, StoreError> {
        let record_keys = store.scan_all(RECORD_KEY_PATTERN).await?;
        let timeline_keys = store.scan_all(TIMELINE_KEY_PATTERN).await?;

        let mut report = RebuildReport::default();
        let mut widgets = Vec::with_capacity(record_keys.len());

        for chunk in record_keys.chunks(REBUILD_LOAD_BATCH) {
            let mut pipe = Pipeline::new();
            for key in chunk {
                pipe.hgetall(key.clone());
            }
            let replies = store.run(pipe).await?;
            for (key, reply) in chunk.iter().zip(replies) {
                let decoded = reply
                    .into_hash()
                    .and_then(|fields| Widget::from_fields(&fields));
                match decoded {
                    Ok(Some(widget)) if widget_id_from_record_key(key) == Some(widget.id) => {
                        widgets.push(widget);
                    }
                    // Expired or deleted between scan and read.
                    Ok(None) => {}
                    Ok(Some(widget)) => {
                        tracing::warn!(key = %key, widget_id = %widget.id, "Record id does not match its key; skipping");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping undecodable record during rebuild");
                        report.skipped += 1;
                    }
                }
            }
        }

        let mut clear = Pipeline::new();
        for key in all_type_index_keys() {
            clear.del(key);
        }
        clear
            .del(visibility_index_key(true))
            .del(visibility_index_key(false))
            .del(GLOBAL_TIMELINE_KEY);
        for key in &timeline_keys {
            clear.del(key.clone());
        }
        store.run_checked(clear).await?;

        for chunk in widgets.chunks(REBUILD_WRITE_BATCH) {
            let mut pipe = Pipeline::new();
            for widget in chunk {
                WidgetIndex::add_commands(&mut pipe, widget);
            }
            store.run_checked(pipe).await?;
        }

        let owners: BTreeSet<&str> = widgets.iter().map(|w| w.owner_id.as_str()).collect();
        report.widgets_indexed = widgets.len();
        report.owners = owners.len();

        tracing::info!(
            widgets = report.widgets_indexed,
            owners = report.owners,
            skipped = report.skipped,
            stale_timelines = timeline_keys
                .iter()
                .filter_map(|k| owner_from_timeline_key(k))
                .filter(|owner| !owners.contains(owner))
                .count(),
            "Widget indexes rebuilt"
        );
        Ok(report)
    }
}

/// Every index key and its members, for comparing index state.
///
/// Set members are sorted; sorted-set members keep their score order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSnapshot {
    pub entries: BTreeMap<String, Vec<String>>,
}

impl IndexSnapshot {
    pub async fn capture(store: &Store) -> Result<Self, StoreError> {
        let mut set_keys = store.scan_all(TYPE_INDEX_PATTERN).await?;
        set_keys.extend(store.scan_all(VISIBILITY_INDEX_PATTERN).await?);
        let mut zset_keys = store.scan_all(TIMELINE_KEY_PATTERN).await?;
        zset_keys.push(GLOBAL_TIMELINE_KEY.to_string());

        let mut pipe = Pipeline::new();
        for key in &set_keys {
            pipe.smembers(key.clone());
        }
        for key in &zset_keys {
            pipe.zrange(key.clone(), 0, -1);
        }
        let replies = store.run(pipe).await?;

        let mut entries = BTreeMap::new();
        let keys = set_keys.iter().map(|k| (k, true)).chain(zset_keys.iter().map(|k| (k, false)));
        for ((key, is_set), reply) in keys.zip(replies) {
            let mut members = reply.into_list()?;
            if members.is_empty() {
                continue;
            }
            if is_set {
                members.sort();
            }
            entries.insert(key.clone(), members);
        }
        Ok(Self { entries })
    }

    /// Members of one index key, empty when absent.
    pub fn members(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether `member` appears under any index key.
    pub fn contains_member(&self, member: &str) -> bool {
        self.entries
            .values()
            .any(|members| members.iter().any(|m| m == member))
    }
}
