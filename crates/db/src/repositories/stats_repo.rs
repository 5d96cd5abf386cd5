//! Usage counters stored in `{id}:stats` and `{id}:views:{date}`.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use widgetry_core::types::WidgetId;

use crate::error::StoreError;
use crate::keys::{daily_views_key, record_key, stats_key};
use crate::models::stats::{DailyViews, StatField, WidgetStats, FIELD_LAST_VIEW};
use crate::models::widget::FIELD_ID;
use crate::store::{Command, Guard, Pipeline, Store, Transaction, TxOutcome};

/// Lifetime of a daily view counter.
pub const DAILY_VIEWS_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Longest history [`StatsRepo::daily_views`] will read.
pub const MAX_DAILY_VIEW_DAYS: u32 = 30;

pub struct StatsRepo;

impl StatsRepo {
    /// Bump one counter. Views also stamp `last_view` and bump today's
    /// daily counter.
    ///
    /// The write is guarded on the widget record existing, so a deleted
    /// widget never regains a stats blob. Returns `false` in that case.
    pub async fn increment(
        store: &Store,
        widget_id: &WidgetId,
        field: StatField,
    ) -> Result<bool, StoreError> {
        let key = stats_key(widget_id);
        let mut pipe = Pipeline::new();
        pipe.hincr_by(key.clone(), field.as_str(), 1);
        if field == StatField::Views {
            let now = Utc::now();
            let daily = daily_views_key(widget_id, now.date_naive());
            pipe.hset(
                key,
                vec![(
                    FIELD_LAST_VIEW.to_string(),
                    crate::models::encode_timestamp(&now),
                )],
            )
            .incr_by(daily.clone(), 1)
            .expire(daily, DAILY_VIEWS_TTL);
        }

        let guard = Guard::field_equals(
            record_key(widget_id),
            FIELD_ID,
            Some(widget_id.to_string()),
        );
        match store.transact(Transaction::new(pipe).with_guard(guard)).await? {
            TxOutcome::Committed(_) => Ok(true),
            TxOutcome::Aborted => {
                tracing::debug!(widget_id = %widget_id, field = field.as_str(), "Counter increment on missing widget");
                Ok(false)
            }
        }
    }

    pub async fn increment_views(store: &Store, widget_id: &WidgetId) -> Result<bool, StoreError> {
        Self::increment(store, widget_id, StatField::Views).await
    }

    pub async fn increment_submits(
        store: &Store,
        widget_id: &WidgetId,
    ) -> Result<bool, StoreError> {
        Self::increment(store, widget_id, StatField::Submits).await
    }

    pub async fn increment_closes(store: &Store, widget_id: &WidgetId) -> Result<bool, StoreError> {
        Self::increment(store, widget_id, StatField::Closes).await
    }

    /// Read the stats blob.
    pub async fn find(
        store: &Store,
        widget_id: &WidgetId,
    ) -> Result<Option<WidgetStats>, StoreError> {
        let fields = store
            .cmd(Command::HGetAll {
                key: stats_key(widget_id),
            })
            .await?
            .into_hash()?;
        WidgetStats::from_fields(*widget_id, &fields)
    }

    /// Views per day for the `days` days ending on `today`, oldest first.
    /// Days without a counter report zero. `days` is capped at
    /// [`MAX_DAILY_VIEW_DAYS`].
    pub async fn daily_views(
        store: &Store,
        widget_id: &WidgetId,
        days: u32,
        today: NaiveDate,
    ) -> Result<Vec<DailyViews>, StoreError> {
        let dates: Vec<NaiveDate> = (0..days.min(MAX_DAILY_VIEW_DAYS))
            .rev()
            .filter_map(|back| today.checked_sub_days(chrono::Days::new(u64::from(back))))
            .collect();

        let mut pipe = Pipeline::new();
        for date in &dates {
            pipe.get(daily_views_key(widget_id, *date));
        }
        let replies = store.run(pipe).await?;

        dates
            .into_iter()
            .zip(replies)
            .map(|(date, reply)| {
                let views = match reply.into_opt_string()? {
                    Some(raw) => raw.parse::<u64>().map_err(|_| StoreError::InvalidValue {
                        key: daily_views_key(widget_id, date),
                        reason: format!("not a counter: '{raw}'"),
                    })?,
                    None => 0,
                };
                Ok(DailyViews { date, views })
            })
            .collect()
    }
}
