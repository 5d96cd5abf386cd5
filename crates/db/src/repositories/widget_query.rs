//! Filter query engine over the widget indexes.
//!
//! The store has no secondary indexes and no substring predicate, so a
//! filtered listing is planned by hand:
//!
//! 1. No active predicate: page straight off the owner timeline.
//! 2. Type/visibility predicates: copy the owner timeline into a temporary
//!    set, intersect it with the type set (or a temporary union of several
//!    type sets) and the visibility set.
//! 3. Rank the unordered candidates by their timeline score, newest first.
//! 4. Search: fetch names in pipelined batches and keep substring matches.
//! 5. Slice the requested page; `total` is the full filtered length.

use serde::Serialize;
use std::time::Duration;
use widgetry_core::pagination::Page;
use widgetry_core::types::WidgetId;
use widgetry_core::widget_filter::{FilterOptions, NormalizedFilter};

use crate::error::StoreError;
use crate::keys::{record_key, timeline_key, type_index_key, visibility_index_key};
use crate::models::widget::FIELD_NAME;
use crate::store::{Command, Pipeline, Store, TempKeys};

/// Members per `SADD` when materializing the owner set.
const MATERIALIZE_CHUNK: usize = 500;

/// Ids per pipelined score or name lookup.
const LOOKUP_BATCH: usize = 100;

/// Expiry on temporary keys in case cleanup never runs.
const TEMP_KEY_TTL: Duration = Duration::from_secs(60);

/// One page of widget ids with the size of the full result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdPage {
    pub ids: Vec<WidgetId>,
    pub total: usize,
}

/// Plans and runs owner-scoped widget listings.
pub struct WidgetQuery;

impl WidgetQuery {
    /// Unfiltered fast path: one round trip for the count and the page.
    pub async fn owner_page(store: &Store, owner_id: &str, page: Page) -> Result<IdPage, StoreError> {
        let key = timeline_key(owner_id);
        let Some((start, stop)) = page.rank_range() else {
            let total = store.cmd(Command::ZCard { key }).await?.into_int()?;
            return Ok(IdPage {
                ids: Vec::new(),
                total: total.max(0) as usize,
            });
        };
        let mut pipe = Pipeline::new();
        pipe.zcard(key.clone()).zrevrange(key, start, stop);
        let mut replies = store.run(pipe).await?.into_iter();

        let (Some(count), Some(members)) = (replies.next(), replies.next()) else {
            return Err(StoreError::UnexpectedReply {
                expected: "count and range",
                got: "fewer replies".to_string(),
            });
        };
        Ok(IdPage {
            ids: parse_ids(members.into_list()?),
            total: count.into_int()?.max(0) as usize,
        })
    }

    /// Filtered listing. A missing filter, or one with no predicate left
    /// after normalization, takes the [`owner_page`](Self::owner_page) path.
    pub async fn filtered_page(
        store: &Store,
        owner_id: &str,
        filter: Option<&FilterOptions>,
        page: Page,
    ) -> Result<IdPage, StoreError> {
        let Some(filter) = filter.and_then(FilterOptions::normalize) else {
            return Self::owner_page(store, owner_id, page).await;
        };

        let ids = Self::filtered_ids(store, owner_id, &filter).await?;
        Ok(IdPage {
            total: ids.len(),
            ids: page.slice(&ids),
        })
    }

    /// Every id matching `filter`, newest first.
    pub async fn filtered_ids(
        store: &Store,
        owner_id: &str,
        filter: &NormalizedFilter,
    ) -> Result<Vec<WidgetId>, StoreError> {
        let timeline = timeline_key(owner_id);

        if !filter.has_set_predicate() {
            // Search only: the timeline already yields recency order.
            let members = store
                .cmd(Command::ZRevRange {
                    key: timeline,
                    start: 0,
                    stop: -1,
                })
                .await?
                .into_list()?;
            tracing::debug!(owner_id, candidates = members.len(), "Search-only widget query");
            return Self::filter_by_name(store, parse_ids(members), filter).await;
        }

        let size = store
            .cmd(Command::ZCard {
                key: timeline.clone(),
            })
            .await?
            .into_int()?;
        if size <= 0 {
            return Ok(Vec::new());
        }

        let mut temp = TempKeys::new(store, owner_id);
        let candidates = Self::intersect(store, &mut temp, &timeline, filter).await;
        temp.release().await;
        let candidates = candidates?;

        tracing::debug!(
            owner_id,
            owner_widgets = size,
            candidates = candidates.len(),
            types = filter.types.len(),
            is_visible = ?filter.is_visible,
            "Filtered widget query"
        );

        let ranked = Self::rank(store, &timeline, candidates).await?;
        Self::filter_by_name(store, ranked, filter).await
    }

    /// Candidate ids from set algebra. Temporary keys are registered in
    /// `temp` before they are written.
    async fn intersect(
        store: &Store,
        temp: &mut TempKeys,
        timeline: &str,
        filter: &NormalizedFilter,
    ) -> Result<Vec<String>, StoreError> {
        let members = store
            .cmd(Command::ZRange {
                key: timeline.to_string(),
                start: 0,
                stop: -1,
            })
            .await?
            .into_list()?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let owner_set = temp.allocate("owner");
        let mut pipe = Pipeline::new();
        for chunk in members.chunks(MATERIALIZE_CHUNK) {
            pipe.sadd(owner_set.clone(), chunk.to_vec());
        }
        pipe.expire(owner_set.clone(), TEMP_KEY_TTL);

        let mut keys = vec![owner_set];
        match filter.types.as_slice() {
            [] => {}
            [single] => keys.push(type_index_key(*single)),
            many => {
                let union = temp.allocate("types");
                let sources = many.iter().map(|t| type_index_key(*t)).collect();
                pipe.sunionstore(union.clone(), sources)
                    .expire(union.clone(), TEMP_KEY_TTL);
                keys.push(union);
            }
        }
        if let Some(visible) = filter.is_visible {
            keys.push(visibility_index_key(visible));
        }
        store.run_checked(pipe).await?;

        store.cmd(Command::SInter { keys }).await?.into_list()
    }

    /// Order candidates by timeline score, newest first. Ids without a
    /// score sort last; equal scores fall back to descending id.
    async fn rank(
        store: &Store,
        timeline: &str,
        candidates: Vec<String>,
    ) -> Result<Vec<WidgetId>, StoreError> {
        let mut scored: Vec<(f64, String)> = Vec::with_capacity(candidates.len());
        for chunk in candidates.chunks(LOOKUP_BATCH) {
            let mut pipe = Pipeline::new();
            for id in chunk {
                pipe.zscore(timeline.to_string(), id.clone());
            }
            let replies = store.run(pipe).await?;
            for (id, reply) in chunk.iter().zip(replies) {
                let score = match reply.into_score() {
                    Ok(Some(score)) => score,
                    Ok(None) | Err(_) => f64::NEG_INFINITY,
                };
                scored.push((score, id.clone()));
            }
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(parse_ids(scored.into_iter().map(|(_, id)| id)))
    }

    /// Keep ids whose name contains the search term. Ids whose record is
    /// gone are dropped. Order is preserved.
    async fn filter_by_name(
        store: &Store,
        ids: Vec<WidgetId>,
        filter: &NormalizedFilter,
    ) -> Result<Vec<WidgetId>, StoreError> {
        if filter.search.is_none() {
            return Ok(ids);
        }

        let mut kept = Vec::new();
        for chunk in ids.chunks(LOOKUP_BATCH) {
            let mut pipe = Pipeline::new();
            for id in chunk {
                pipe.hget(record_key(id), FIELD_NAME);
            }
            let replies = store.run(pipe).await?;
            for (id, reply) in chunk.iter().zip(replies) {
                if let Ok(Some(name)) = reply.into_opt_string() {
                    if filter.matches_name(&name) {
                        kept.push(*id);
                    }
                }
            }
        }
        Ok(kept)
    }
}

/// Parse index members into ids, skipping anything malformed.
fn parse_ids<I>(members: I) -> Vec<WidgetId>
where
    I: IntoIterator<Item = String>,
{
    members
        .into_iter()
        .filter_map(|member| match WidgetId::parse_str(&member) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(member = %member, "Skipping malformed index member");
                None
            }
        })
        .collect()
}
