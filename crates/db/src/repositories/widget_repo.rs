//! Record store for widgets: the `{id}:widget` and `{id}:stats` hashes.
//!
//! Record writes are same-slot transactions. Index maintenance happens
//! afterwards through [`WidgetIndex`] and never fails the write.

use chrono::Utc;
use widgetry_core::types::WidgetId;

use crate::error::StoreError;
use crate::keys::{record_key, stats_key, submission_key, submissions_key, timeline_key};
use crate::models::stats::WidgetStats;
use crate::models::widget::{UpdateWidget, Widget, FIELD_ID, FIELD_VERSION};
use crate::repositories::widget_index::WidgetIndex;
use crate::store::{Command, Guard, Pipeline, Store, Transaction, TxOutcome};

/// Optimistic write attempts before an update or delete gives up.
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Provides CRUD operations for widget records.
pub struct WidgetRepo;

impl WidgetRepo {
    /// Write the record and a zeroed stats blob atomically, then index it.
    ///
    /// Fails with [`StoreError::Conflict`] if a record with the same id
    /// already exists. Index failures are logged and queued, not returned.
    pub async fn create(store: &Store, widget: &Widget) -> Result<(), StoreError> {
        let mut pipe = Pipeline::new();
        pipe.hset(record_key(&widget.id), widget.to_fields())
            .del(stats_key(&widget.id))
            .hset(stats_key(&widget.id), WidgetStats::zeroed_fields());
        let tx = Transaction::new(pipe)
            .with_guard(Guard::field_equals(record_key(&widget.id), FIELD_ID, None));

        match store.transact(tx).await? {
            TxOutcome::Committed(_) => {}
            TxOutcome::Aborted => {
                return Err(StoreError::Conflict(format!(
                    "widget {} already exists",
                    widget.id
                )));
            }
        }

        tracing::debug!(widget_id = %widget.id, owner_id = %widget.owner_id, "Widget record created");
        WidgetIndex::add(store, widget).await;
        Ok(())
    }

    /// Read a record. An empty hash is reported as `None`.
    pub async fn find_by_id(store: &Store, id: &WidgetId) -> Result<Option<Widget>, StoreError> {
        let fields = store
            .cmd(Command::HGetAll {
                key: record_key(id),
            })
            .await?
            .into_hash()?;
        Widget::from_fields(&fields)
    }

    /// Read a record together with its stats in one round trip.
    pub async fn find_with_stats(
        store: &Store,
        id: &WidgetId,
    ) -> Result<Option<Widget>, StoreError> {
        let mut pipe = Pipeline::new();
        pipe.hgetall(record_key(id)).hgetall(stats_key(id));
        let mut replies = store.run(pipe).await?.into_iter();

        let (Some(record), Some(stats)) = (replies.next(), replies.next()) else {
            return Err(StoreError::UnexpectedReply {
                expected: "record and stats",
                got: "fewer replies".to_string(),
            });
        };
        let Some(mut widget) = Widget::from_fields(&record.into_hash()?)? else {
            return Ok(None);
        };
        widget.stats = WidgetStats::from_fields(*id, &stats.into_hash()?)?;
        Ok(Some(widget))
    }

    /// Apply `input` to the record under an optimistic version check.
    ///
    /// The commit is guarded on the version that was read; on a lost race
    /// the record is re-read and the update re-applied, up to
    /// [`MAX_UPDATE_ATTEMPTS`] times. Index membership is then moved from
    /// the exact version the commit replaced. Returns `None` when the
    /// record does not exist.
    pub async fn update(
        store: &Store,
        id: &WidgetId,
        input: &UpdateWidget,
    ) -> Result<Option<Widget>, StoreError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(current) = Self::find_by_id(store, id).await? else {
                return Ok(None);
            };
            let next = current.with_update(input, Utc::now());

            let mut pipe = Pipeline::new();
            pipe.hset(record_key(id), next.to_fields());
            let tx = Transaction::new(pipe).with_guard(version_guard(&current));

            match store.transact(tx).await? {
                TxOutcome::Committed(_) => {
                    WidgetIndex::update(store, &current, &next).await;
                    return Ok(Some(next));
                }
                TxOutcome::Aborted => {
                    tracing::debug!(widget_id = %id, attempt, "Update lost a version race; retrying");
                }
            }
        }

        Err(StoreError::Conflict(format!(
            "widget {id} changed concurrently {MAX_UPDATE_ATTEMPTS} times"
        )))
    }

    /// Overwrite the mutable attributes of a stored widget with those of
    /// `widget`. Identity, owner, and creation time are kept.
    pub async fn replace(store: &Store, widget: &Widget) -> Result<Option<Widget>, StoreError> {
        Self::update(store, &widget.id, &UpdateWidget::from(widget)).await
    }

    /// Delete the record, its stats, and every submission in one same-slot
    /// transaction, then drop it from every index.
    ///
    /// Returns `false` when the record does not exist.
    pub async fn delete(store: &Store, id: &WidgetId) -> Result<bool, StoreError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(current) = Self::find_by_id(store, id).await? else {
                return Ok(false);
            };
            let submission_ids = store
                .cmd(Command::ZRange {
                    key: submissions_key(id),
                    start: 0,
                    stop: -1,
                })
                .await?
                .into_list()?;

            let mut pipe = Pipeline::new();
            pipe.del(record_key(id))
                .del(stats_key(id))
                .del(submissions_key(id));
            for raw in &submission_ids {
                match uuid::Uuid::parse_str(raw) {
                    Ok(submission_id) => {
                        pipe.del(submission_key(id, &submission_id));
                    }
                    Err(_) => {
                        tracing::warn!(widget_id = %id, member = %raw, "Skipping malformed submission id");
                    }
                }
            }
            let tx = Transaction::new(pipe).with_guard(version_guard(&current));

            match store.transact(tx).await? {
                TxOutcome::Committed(_) => {
                    tracing::debug!(
                        widget_id = %id,
                        owner_id = %current.owner_id,
                        submissions = submission_ids.len(),
                        "Widget record deleted"
                    );
                    WidgetIndex::remove(store, id, &current.owner_id).await;
                    return Ok(true);
                }
                TxOutcome::Aborted => {
                    tracing::debug!(widget_id = %id, attempt, "Delete lost a version race; retrying");
                }
            }
        }

        Err(StoreError::Conflict(format!(
            "widget {id} changed concurrently {MAX_UPDATE_ATTEMPTS} times"
        )))
    }

    /// Number of widgets in an owner's timeline.
    pub async fn count_by_owner(store: &Store, owner_id: &str) -> Result<usize, StoreError> {
        let reply = store
            .cmd(Command::ZCard {
                key: timeline_key(owner_id),
            })
            .await?;
        Ok(reply.into_int()?.max(0) as usize)
    }
}

/// Guard that holds while the record still carries `widget.version`.
/// Records written before versioning have no version field.
fn version_guard(widget: &Widget) -> Guard {
    let expected = (widget.version > 0).then(|| widget.version.to_string());
    Guard::field_equals(record_key(&widget.id), FIELD_VERSION, expected)
}
