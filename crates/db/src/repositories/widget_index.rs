//! Maintenance of the four denormalized widget indexes.
//!
//! Indexes live outside any widget's hash slot, so they are written with
//! plain pipelines after the record commit. Every write is idempotent:
//! adds re-add the same member with the same score and removals tolerate
//! absent members. A failed write is logged as a partial index failure and
//! the widget is queued in the reconciliation outbox
//! ([`RECONCILE_QUEUE_KEY`]), which [`WidgetIndex::reconcile_pending`]
//! drains by recomputing membership from the record.

use serde::Serialize;
use widgetry_core::types::WidgetId;
use widgetry_core::widget_types::WidgetType;

use crate::error::StoreError;
use crate::keys::{
    record_key, timeline_key, type_index_key, visibility_index_key, GLOBAL_TIMELINE_KEY,
    RECONCILE_QUEUE_KEY,
};
use crate::models::widget::{Widget, FIELD_VERSION};
use crate::store::{Command, Pipeline, Store};

/// Separator between widget id and owner id in outbox members.
const OUTBOX_SEPARATOR: char = '|';

/// Outcome of one outbox drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Entries whose indexes were recomputed.
    pub reconciled: usize,
    /// Entries that failed again and were re-queued.
    pub failed: usize,
    /// Entries that could not be parsed and were dropped.
    pub malformed: usize,
}

/// Index maintenance for widget records.
pub struct WidgetIndex;

impl WidgetIndex {
    // -----------------------------------------------------------------------
    // Command builders
    // -----------------------------------------------------------------------

    /// Add `widget` to its owner timeline, the global timeline, its type set
    /// and its visibility set.
    pub fn add_commands(pipe: &mut Pipeline, widget: &Widget) {
        let id = widget.id.to_string();
        let score = widget.timeline_score();
        pipe.zadd(timeline_key(&widget.owner_id), vec![(score, id.clone())])
            .zadd(GLOBAL_TIMELINE_KEY, vec![(score, id.clone())])
            .sadd(type_index_key(widget.widget_type), vec![id.clone()])
            .sadd(visibility_index_key(widget.is_visible), vec![id]);
    }

    /// Remove `id` from every index it could be in.
    pub fn remove_commands(pipe: &mut Pipeline, id: &WidgetId, owner_id: &str) {
        let id = id.to_string();
        pipe.zrem(timeline_key(owner_id), vec![id.clone()])
            .zrem(GLOBAL_TIMELINE_KEY, vec![id.clone()]);
        for widget_type in WidgetType::ALL {
            pipe.srem(type_index_key(widget_type), vec![id.clone()]);
        }
        pipe.srem(visibility_index_key(true), vec![id.clone()])
            .srem(visibility_index_key(false), vec![id]);
    }

    /// Move membership from `prev` to `next`. Only the sets whose key
    /// changed are touched.
    pub fn move_commands(pipe: &mut Pipeline, prev: &Widget, next: &Widget) {
        let id = next.id.to_string();
        if prev.widget_type != next.widget_type {
            pipe.srem(type_index_key(prev.widget_type), vec![id.clone()])
                .sadd(type_index_key(next.widget_type), vec![id.clone()]);
        }
        if prev.is_visible != next.is_visible {
            pipe.srem(visibility_index_key(prev.is_visible), vec![id.clone()])
                .sadd(visibility_index_key(next.is_visible), vec![id]);
        }
    }

    /// Exactly the membership `widget` should have: add it where it belongs
    /// and remove it from every other type and visibility set.
    pub fn converge_commands(pipe: &mut Pipeline, widget: &Widget) {
        let id = widget.id.to_string();
        for widget_type in WidgetType::ALL {
            if widget_type != widget.widget_type {
                pipe.srem(type_index_key(widget_type), vec![id.clone()]);
            }
        }
        pipe.srem(visibility_index_key(!widget.is_visible), vec![id]);
        Self::add_commands(pipe, widget);
    }

    // -----------------------------------------------------------------------
    // Best-effort writes
    // -----------------------------------------------------------------------

    /// Index a newly created widget.
    pub async fn add(store: &Store, widget: &Widget) -> bool {
        let mut pipe = Pipeline::new();
        Self::add_commands(&mut pipe, widget);
        Self::apply(store, pipe, &widget.id, &widget.owner_id, "create").await
    }

    /// Repair membership after an update committed from `prev` to `next`.
    ///
    /// When the record has moved past `next.version` by the time the
    /// repair lands, a concurrent writer may have raced it, so the widget is
    /// queued for reconciliation.
    pub async fn update(store: &Store, prev: &Widget, next: &Widget) -> bool {
        let mut pipe = Pipeline::new();
        Self::move_commands(&mut pipe, prev, next);
        if pipe.is_empty() {
            return true;
        }
        let applied = Self::apply(store, pipe, &next.id, &next.owner_id, "update").await;
        if !applied {
            return false;
        }

        let store = store.detached();
        let current = store
            .cmd(Command::HGet {
                key: record_key(&next.id),
                field: FIELD_VERSION.to_string(),
            })
            .await
            .and_then(|reply| reply.into_opt_string());
        match current {
            Ok(Some(v)) if v == next.version.to_string() => true,
            Ok(current) => {
                tracing::debug!(
                    widget_id = %next.id,
                    expected = next.version,
                    current = ?current,
                    "Record moved during index repair; queueing reconciliation"
                );
                Self::enqueue(&store, &next.id, &next.owner_id).await;
                false
            }
            Err(e) => {
                tracing::warn!(widget_id = %next.id, error = %e, "Version re-check failed");
                Self::enqueue(&store, &next.id, &next.owner_id).await;
                false
            }
        }
    }

    /// Drop a deleted widget from every index.
    pub async fn remove(store: &Store, id: &WidgetId, owner_id: &str) -> bool {
        let mut pipe = Pipeline::new();
        Self::remove_commands(&mut pipe, id, owner_id);
        Self::apply(store, pipe, id, owner_id, "delete").await
    }

    /// Run index writes on a detached handle so a cancelled caller cannot
    /// abandon them halfway. Returns whether they were applied.
    async fn apply(
        store: &Store,
        pipe: Pipeline,
        id: &WidgetId,
        owner_id: &str,
        operation: &'static str,
    ) -> bool {
        let store = store.detached();
        match store.run_checked(pipe).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    widget_id = %id,
                    owner_id,
                    operation,
                    error = %e,
                    "PartialIndexFailure: record committed but index write failed"
                );
                Self::enqueue(&store, id, owner_id).await;
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation outbox
    // -----------------------------------------------------------------------

    /// Queue a widget for reconciliation. Failures are logged; the rebuild
    /// job remains the backstop.
    pub async fn enqueue(store: &Store, id: &WidgetId, owner_id: &str) {
        let mut pipe = Pipeline::new();
        pipe.sadd(RECONCILE_QUEUE_KEY, vec![outbox_member(id, owner_id)]);
        if let Err(e) = store.run_checked(pipe).await {
            tracing::error!(
                widget_id = %id,
                owner_id,
                error = %e,
                "Failed to queue index reconciliation"
            );
        }
    }

    /// Number of widgets waiting for reconciliation.
    pub async fn pending(store: &Store) -> Result<usize, StoreError> {
        let reply = store
            .cmd(Command::SCard {
                key: RECONCILE_QUEUE_KEY.to_string(),
            })
            .await?;
        Ok(reply.into_int()?.max(0) as usize)
    }

    /// Recompute one widget's index membership from its record. A missing
    /// record removes the widget from every index.
    pub async fn reconcile_one(
        store: &Store,
        id: &WidgetId,
        owner_id: &str,
    ) -> Result<(), StoreError> {
        let fields = store
            .cmd(Command::HGetAll {
                key: record_key(id),
            })
            .await?
            .into_hash()?;

        let mut pipe = Pipeline::new();
        match Widget::from_fields(&fields)? {
            Some(widget) => Self::converge_commands(&mut pipe, &widget),
            None => Self::remove_commands(&mut pipe, id, owner_id),
        }
        store.run_checked(pipe).await?;
        Ok(())
    }

    /// Pop up to `batch` outbox entries and reconcile each. Entries that
    /// fail are pushed back for the next drain.
    pub async fn reconcile_pending(
        store: &Store,
        batch: usize,
    ) -> Result<ReconcileReport, StoreError> {
        let popped = store
            .cmd(Command::SPop {
                key: RECONCILE_QUEUE_KEY.to_string(),
                count: batch,
            })
            .await?
            .into_list()?;

        let mut report = ReconcileReport::default();
        let mut retry = Vec::new();

        for member in popped {
            let Some((id, owner_id)) = parse_outbox_member(&member) else {
                tracing::warn!(member = %member, "Dropping malformed reconciliation entry");
                report.malformed += 1;
                continue;
            };
            match Self::reconcile_one(store, &id, owner_id).await {
                Ok(()) => report.reconciled += 1,
                Err(e) => {
                    tracing::warn!(widget_id = %id, owner_id, error = %e, "Reconciliation failed");
                    report.failed += 1;
                    retry.push(member.clone());
                }
            }
        }

        if !retry.is_empty() {
            let mut pipe = Pipeline::new();
            pipe.sadd(RECONCILE_QUEUE_KEY, retry);
            store.run_checked(pipe).await?;
        }

        Ok(report)
    }
}

fn outbox_member(id: &WidgetId, owner_id: &str) -> String {
    format!("{id}{OUTBOX_SEPARATOR}{owner_id}")
}

fn parse_outbox_member(member: &str) -> Option<(WidgetId, &str)> {
    let (id, owner_id) = member.split_once(OUTBOX_SEPARATOR)?;
    if owner_id.is_empty() {
        return None;
    }
    Some((WidgetId::parse_str(id).ok()?, owner_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_members_parse_back() {
        let id = WidgetId::now_v7();
        let member = outbox_member(&id, "user|with|pipes");
        assert_eq!(parse_outbox_member(&member), Some((id, "user|with|pipes")));
    }

    #[test]
    fn malformed_outbox_members_are_rejected() {
        assert_eq!(parse_outbox_member("not-a-uuid|owner"), None);
        assert_eq!(parse_outbox_member(&WidgetId::now_v7().to_string()), None);
        assert_eq!(parse_outbox_member(&format!("{}|", WidgetId::now_v7())), None);
    }

    #[test]
    fn move_touches_only_changed_sets() {
        let prev = Widget::new("o", WidgetType::Banner, "b", true);
        let mut next = prev.clone();
        next.is_visible = false;

        let mut pipe = Pipeline::new();
        WidgetIndex::move_commands(&mut pipe, &prev, &next);
        let keys: Vec<&str> = pipe.commands().iter().flat_map(Command::keys).collect();
        assert_eq!(keys, vec!["widgets:isVisible:1", "widgets:isVisible:0"]);

        let mut pipe = Pipeline::new();
        WidgetIndex::move_commands(&mut pipe, &prev, &prev);
        assert!(pipe.is_empty());
    }
}
