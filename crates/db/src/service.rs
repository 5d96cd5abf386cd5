//! Widget service: the read/write contract exposed to handlers and jobs.
//!
//! Wraps the repositories behind domain errors. Absent records become
//! [`CoreError::NotFound`], DTO validation failures become
//! [`CoreError::Validation`], and lost optimistic races become
//! [`CoreError::Conflict`]. Store failures pass through untouched; retry
//! policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use validator::Validate;
use widgetry_core::access::ensure_owner;
use widgetry_core::error::CoreError;
use widgetry_core::pagination::Page;
use widgetry_core::types::{SubmissionId, WidgetId};
use widgetry_core::widget_filter::FilterOptions;

use crate::error::ServiceResult;
use crate::models::stats::{DailyViews, WidgetStats};
use crate::models::submission::{
    CreateSubmission, Submission, TtlReport, MAX_SUBMISSION_TTL_SECS,
};
use crate::models::widget::{CreateWidget, UpdateWidget, Widget};
use crate::repositories::{
    IndexRebuild, IndexSnapshot, RebuildReport, ReconcileReport, StatsRepo, SubmissionRepo,
    WidgetIndex, WidgetLoader, WidgetQuery, WidgetRepo,
};
use crate::store::{MemoryStore, RequestContext, Store, StoreConfig};

/// A page of hydrated widgets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WidgetPage {
    pub widgets: Vec<Widget>,
    /// Size of the full (filtered) listing.
    pub total: usize,
}

/// A page of submissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubmissionPage {
    pub submissions: Vec<Submission>,
    pub total: usize,
}

/// Stateless facade over the widget repositories.
#[derive(Debug, Clone)]
pub struct WidgetService {
    store: Store,
}

impl WidgetService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// A service over a fresh embedded store.
    pub fn embedded(config: &StoreConfig) -> (Self, Arc<MemoryStore>) {
        let (store, memory) = Store::embedded(config);
        (Self::new(store), memory)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// A service whose store calls honour the request's deadline and
    /// cancellation.
    pub fn for_request(&self, ctx: &RequestContext) -> Self {
        Self::new(self.store.with_context(ctx))
    }

    // -----------------------------------------------------------------------
    // Widgets
    // -----------------------------------------------------------------------

    /// Validate `input`, then create and index a new widget.
    pub async fn create(&self, input: &CreateWidget) -> ServiceResult<Widget> {
        input.validate().map_err(CoreError::from)?;
        let widget = Widget::from_create(input);
        WidgetRepo::create(&self.store, &widget).await?;
        tracing::info!(widget_id = %widget.id, owner_id = %widget.owner_id, widget_type = %widget.widget_type, "Widget created");
        Ok(widget)
    }

    /// Store a caller-built widget as is.
    pub async fn insert(&self, widget: &Widget) -> ServiceResult<()> {
        if widget.name.is_empty() || widget.name.chars().count() > 200 {
            return Err(CoreError::Validation("name must be 1-200 characters".to_string()).into());
        }
        WidgetRepo::create(&self.store, widget).await?;
        Ok(())
    }

    /// A widget with its stats.
    pub async fn get_by_id(&self, id: &WidgetId) -> ServiceResult<Widget> {
        WidgetRepo::find_with_stats(&self.store, id)
            .await?
            .ok_or_else(|| not_found("widget", id))
    }

    /// A widget with its stats, provided `owner_id` owns it.
    pub async fn get_owned(&self, id: &WidgetId, owner_id: &str) -> ServiceResult<Widget> {
        let widget = self.get_by_id(id).await?;
        ensure_owner(&widget.owner_id, owner_id)?;
        Ok(widget)
    }

    /// An owner's widgets, newest first.
    pub async fn get_by_owner(&self, owner_id: &str, page: Page) -> ServiceResult<WidgetPage> {
        let ids = WidgetQuery::owner_page(&self.store, owner_id, page).await?;
        self.hydrate(ids.ids, ids.total).await
    }

    /// An owner's widgets narrowed by `filter`, newest first.
    ///
    /// Unknown type names are ignored rather than rejected; a filter made
    /// only of unknown types lists everything. Use
    /// [`FilterOptions::unknown_types`] first to reject them instead.
    pub async fn get_by_owner_filtered(
        &self,
        owner_id: &str,
        filter: Option<&FilterOptions>,
        page: Page,
    ) -> ServiceResult<WidgetPage> {
        let ids = WidgetQuery::filtered_page(&self.store, owner_id, filter, page).await?;
        self.hydrate(ids.ids, ids.total).await
    }

    async fn hydrate(&self, ids: Vec<WidgetId>, total: usize) -> ServiceResult<WidgetPage> {
        let widgets = WidgetLoader::load(&self.store, &ids).await?;
        Ok(WidgetPage { widgets, total })
    }

    /// Apply a partial update.
    pub async fn update(&self, id: &WidgetId, input: &UpdateWidget) -> ServiceResult<Widget> {
        input.validate().map_err(CoreError::from)?;
        WidgetRepo::update(&self.store, id, input)
            .await?
            .ok_or_else(|| not_found("widget", id))
    }

    /// Overwrite a widget's mutable attributes with those of `widget`.
    pub async fn replace(&self, widget: &Widget) -> ServiceResult<Widget> {
        self.update(&widget.id, &UpdateWidget::from(widget)).await
    }

    /// Delete a widget with its stats, submissions, and index entries.
    pub async fn delete(&self, id: &WidgetId) -> ServiceResult<()> {
        if WidgetRepo::delete(&self.store, id).await? {
            tracing::info!(widget_id = %id, "Widget deleted");
            Ok(())
        } else {
            Err(not_found("widget", id))
        }
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    pub async fn increment_view(&self, id: &WidgetId) -> ServiceResult<()> {
        found(StatsRepo::increment_views(&self.store, id).await?, id)
    }

    pub async fn increment_submit(&self, id: &WidgetId) -> ServiceResult<()> {
        found(StatsRepo::increment_submits(&self.store, id).await?, id)
    }

    pub async fn increment_close(&self, id: &WidgetId) -> ServiceResult<()> {
        found(StatsRepo::increment_closes(&self.store, id).await?, id)
    }

    pub async fn stats(&self, id: &WidgetId) -> ServiceResult<WidgetStats> {
        StatsRepo::find(&self.store, id)
            .await?
            .ok_or_else(|| not_found("widget stats", id))
    }

    /// Daily view counts for the last `days` days (UTC), oldest first.
    pub async fn daily_views(&self, id: &WidgetId, days: u32) -> ServiceResult<Vec<DailyViews>> {
        let today = Utc::now().date_naive();
        Ok(StatsRepo::daily_views(&self.store, id, days, today).await?)
    }

    // -----------------------------------------------------------------------
    // Submissions
    // -----------------------------------------------------------------------

    /// Store a submission and bump the widget's submit counter.
    pub async fn record_submission(
        &self,
        widget_id: &WidgetId,
        input: &CreateSubmission,
    ) -> ServiceResult<Submission> {
        input.validate().map_err(CoreError::from)?;
        let submission = SubmissionRepo::create(&self.store, widget_id, input)
            .await?
            .ok_or_else(|| not_found("widget", widget_id))?;
        if !StatsRepo::increment_submits(&self.store, widget_id).await? {
            tracing::warn!(widget_id = %widget_id, submission_id = %submission.id, "Widget deleted before submit was counted");
        }
        Ok(submission)
    }

    pub async fn get_submission(
        &self,
        widget_id: &WidgetId,
        submission_id: &SubmissionId,
    ) -> ServiceResult<Submission> {
        SubmissionRepo::find(&self.store, widget_id, submission_id)
            .await?
            .ok_or_else(|| not_found("submission", submission_id))
    }

    pub async fn list_submissions(
        &self,
        widget_id: &WidgetId,
        page: Page,
    ) -> ServiceResult<SubmissionPage> {
        let (submissions, total) = SubmissionRepo::list(&self.store, widget_id, page).await?;
        Ok(SubmissionPage { submissions, total })
    }

    pub async fn delete_submission(
        &self,
        widget_id: &WidgetId,
        submission_id: &SubmissionId,
    ) -> ServiceResult<()> {
        if SubmissionRepo::delete(&self.store, widget_id, submission_id).await? {
            Ok(())
        } else {
            Err(not_found("submission", submission_id))
        }
    }

    /// Re-expire every submission of `widget_ids` to `ttl` (for example
    /// after a retention plan change).
    pub async fn reapply_submission_ttl(
        &self,
        widget_ids: &[WidgetId],
        ttl: Duration,
    ) -> ServiceResult<TtlReport> {
        if ttl.is_zero() {
            return Err(CoreError::Validation("retention must be at least one second".to_string()).into());
        }
        if ttl.as_secs() > MAX_SUBMISSION_TTL_SECS {
            return Err(CoreError::Validation(format!(
                "retention must be at most {MAX_SUBMISSION_TTL_SECS} seconds"
            ))
            .into());
        }
        Ok(SubmissionRepo::reapply_ttl(&self.store, widget_ids, ttl).await?)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Recompute every index from the records.
    pub async fn rebuild_indexes(&self) -> ServiceResult<RebuildReport> {
        Ok(IndexRebuild::rebuild(&self.store).await?)
    }

    /// Drain up to `batch` entries from the reconciliation outbox.
    pub async fn reconcile_indexes(&self, batch: usize) -> ServiceResult<ReconcileReport> {
        Ok(WidgetIndex::reconcile_pending(&self.store, batch).await?)
    }

    pub async fn pending_reconciliations(&self) -> ServiceResult<usize> {
        Ok(WidgetIndex::pending(&self.store).await?)
    }

    pub async fn index_snapshot(&self) -> ServiceResult<IndexSnapshot> {
        Ok(IndexSnapshot::capture(&self.store).await?)
    }
}

fn not_found(entity: &'static str, id: &impl ToString) -> crate::error::ServiceError {
    CoreError::NotFound {
        entity,
        id: id.to_string(),
    }
    .into()
}

fn found(applied: bool, id: &WidgetId) -> ServiceResult<()> {
    if applied {
        Ok(())
    } else {
        Err(not_found("widget", id))
    }
}
