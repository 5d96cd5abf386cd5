//! Hydrates ordered id lists into widgets with stats.

use widgetry_core::types::WidgetId;

use crate::error::StoreError;
use crate::keys::{record_key, stats_key};
use crate::models::stats::WidgetStats;
use crate::models::widget::Widget;
use crate::store::{Pipeline, Reply, Store};

/// Ids per pipelined batch.
pub const LOAD_BATCH: usize = 50;

/// Batch loader for widget pages.
pub struct WidgetLoader;

impl WidgetLoader {
    /// Load `ids` in order, one record pipeline and one stats pipeline per
    /// batch of [`LOAD_BATCH`]. Ids whose record is missing or undecodable
    /// are skipped; store failures are returned.
    pub async fn load(store: &Store, ids: &[WidgetId]) -> Result<Vec<Widget>, StoreError> {
        let mut widgets = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(LOAD_BATCH) {
            let mut records = Pipeline::new();
            let mut stats = Pipeline::new();
            for id in chunk {
                records.hgetall(record_key(id));
                stats.hgetall(stats_key(id));
            }
            let (record_replies, stats_replies) =
                tokio::try_join!(store.run(records), store.run(stats))?;

            for ((id, record), stats) in chunk.iter().zip(record_replies).zip(stats_replies) {
                if let Some(widget) = hydrate(id, record, stats) {
                    widgets.push(widget);
                }
            }
        }

        Ok(widgets)
    }
}

fn hydrate(id: &WidgetId, record: Reply, stats: Reply) -> Option<Widget> {
    let decoded = record
        .into_hash()
        .and_then(|fields| Widget::from_fields(&fields));
    let mut widget = match decoded {
        Ok(Some(widget)) => widget,
        Ok(None) => {
            tracing::debug!(widget_id = %id, "Indexed widget has no record; skipping");
            return None;
        }
        Err(e) => {
            tracing::warn!(widget_id = %id, error = %e, "Skipping undecodable widget record");
            return None;
        }
    };

    widget.stats = match stats
        .into_hash()
        .and_then(|fields| WidgetStats::from_fields(*id, &fields))
    {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(widget_id = %id, error = %e, "Ignoring undecodable widget stats");
            None
        }
    };
    Some(widget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use widgetry_core::widget_types::WidgetType;

    fn record_reply(widget: &Widget) -> Reply {
        Reply::Hash(widget.to_fields().into_iter().collect())
    }

    #[test]
    fn hydrate_attaches_stats() {
        let widget = Widget::new("o", WidgetType::Survey, "s", true);
        let stats = Reply::Hash(WidgetStats::zeroed_fields().into_iter().collect());
        let loaded = hydrate(&widget.id, record_reply(&widget), stats).unwrap();
        assert_eq!(loaded.stats, Some(WidgetStats::zeroed(widget.id)));
    }

    #[test]
    fn hydrate_skips_missing_records() {
        let id = WidgetId::now_v7();
        assert!(hydrate(&id, Reply::Hash(HashMap::new()), Reply::Hash(HashMap::new())).is_none());
    }

    #[test]
    fn hydrate_skips_failed_record_reads() {
        let id = WidgetId::now_v7();
        let failed = Reply::Error("Wrong value type".to_string());
        assert!(hydrate(&id, failed, Reply::Hash(HashMap::new())).is_none());
    }

    #[test]
    fn hydrate_keeps_widget_with_bad_stats() {
        let widget = Widget::new("o", WidgetType::Survey, "s", true);
        let loaded = hydrate(&widget.id, record_reply(&widget), Reply::Nil).unwrap();
        assert_eq!(loaded.stats, None);
    }
}
