//! Repository for visitor submissions.
//!
//! Each submission is its own hash (`{widgetId}:submission:{id}`) with an
//! optional TTL, listed in the widget's `{widgetId}:submissions` sorted set.
//! List entries can outlive their hash when the TTL fires; readers prune
//! them as they find them.

use std::time::Duration;

use chrono::Utc;
use widgetry_core::pagination::Page;
use widgetry_core::types::{SubmissionId, Timestamp, WidgetId};

use crate::error::StoreError;
use crate::keys::{record_key, submission_key, submissions_key};
use crate::models::submission::{CreateSubmission, Submission, TtlReport};
use crate::models::widget::FIELD_ID;
use crate::store::{Command, Guard, Pipeline, Reply, Store, Transaction, TxOutcome};

/// Submission ids re-expired per pipeline by [`SubmissionRepo::reapply_ttl`].
pub const TTL_REAPPLY_PAGE: usize = 200;

pub struct SubmissionRepo;

impl SubmissionRepo {
    /// Store a submission. Guarded on the widget record existing; returns
    /// `None` when it does not.
    pub async fn create(
        store: &Store,
        widget_id: &WidgetId,
        input: &CreateSubmission,
    ) -> Result<Option<Submission>, StoreError> {
        let now = Utc::now();
        let id = SubmissionId::now_v7();
        let key = submission_key(widget_id, &id);
        let expires_at = match input.ttl_secs {
            Some(secs) => Some(expiry_after(&key, now, secs)?),
            None => None,
        };
        let submission = Submission {
            id,
            widget_id: *widget_id,
            data: input.data.clone(),
            created_at: now,
            expires_at,
        };

        let mut pipe = Pipeline::new();
        pipe.hset(key.clone(), submission.to_fields());
        if let Some(secs) = input.ttl_secs {
            pipe.expire(key, Duration::from_secs(secs));
        }
        pipe.zadd(
            submissions_key(widget_id),
            vec![(submission.list_score(), submission.id.to_string())],
        );

        let guard = Guard::field_equals(
            record_key(widget_id),
            FIELD_ID,
            Some(widget_id.to_string()),
        );
        match store.transact(Transaction::new(pipe).with_guard(guard)).await? {
            TxOutcome::Committed(_) => Ok(Some(submission)),
            TxOutcome::Aborted => Ok(None),
        }
    }

    /// Read one submission, with `expires_at` taken from its live TTL.
    pub async fn find(
        store: &Store,
        widget_id: &WidgetId,
        submission_id: &SubmissionId,
    ) -> Result<Option<Submission>, StoreError> {
        let key = submission_key(widget_id, submission_id);
        let mut pipe = Pipeline::new();
        pipe.hgetall(key.clone()).pttl(key);
        let mut replies = store.run(pipe).await?.into_iter();
        let (Some(record), Some(ttl)) = (replies.next(), replies.next()) else {
            return Err(StoreError::UnexpectedReply {
                expected: "record and ttl",
                got: "fewer replies".to_string(),
            });
        };
        decode(record, ttl)
    }

    /// One page of submissions, newest first, and the list size.
    ///
    /// Entries whose hash has expired are skipped, removed from the list,
    /// and not counted in the returned total.
    pub async fn list(
        store: &Store,
        widget_id: &WidgetId,
        page: Page,
    ) -> Result<(Vec<Submission>, usize), StoreError> {
        let list_key = submissions_key(widget_id);
        let Some((start, stop)) = page.rank_range() else {
            let total = store.cmd(Command::ZCard { key: list_key }).await?.into_int()?;
            return Ok((Vec::new(), total.max(0) as usize));
        };
        let mut pipe = Pipeline::new();
        pipe.zcard(list_key.clone())
            .zrevrange(list_key.clone(), start, stop);
        let mut replies = store.run(pipe).await?.into_iter();
        let (Some(count), Some(members)) = (replies.next(), replies.next()) else {
            return Err(StoreError::UnexpectedReply {
                expected: "count and range",
                got: "fewer replies".to_string(),
            });
        };
        let total = count.into_int()?.max(0) as usize;
        let members = members.into_list()?;

        let mut ids = Vec::with_capacity(members.len());
        let mut dangling = Vec::new();
        for member in members {
            match SubmissionId::parse_str(&member) {
                Ok(id) => ids.push((id, member)),
                Err(_) => dangling.push(member),
            }
        }

        let mut pipe = Pipeline::new();
        for (id, _) in &ids {
            let key = submission_key(widget_id, id);
            pipe.hgetall(key.clone()).pttl(key);
        }
        let mut replies = store.run(pipe).await?.into_iter();

        let mut submissions = Vec::with_capacity(ids.len());
        for (_, member) in ids {
            let (Some(record), Some(ttl)) = (replies.next(), replies.next()) else {
                break;
            };
            match decode(record, ttl)? {
                Some(submission) => submissions.push(submission),
                None => dangling.push(member),
            }
        }

        let pruned = dangling.len();
        if pruned > 0 {
            tracing::debug!(widget_id = %widget_id, pruned, "Pruning expired submission entries");
            let mut pipe = Pipeline::new();
            pipe.zrem(list_key, dangling);
            store.run_checked(pipe).await?;
        }

        Ok((submissions, total.saturating_sub(pruned)))
    }

    /// Delete one submission. Returns `false` if it did not exist.
    pub async fn delete(
        store: &Store,
        widget_id: &WidgetId,
        submission_id: &SubmissionId,
    ) -> Result<bool, StoreError> {
        let mut pipe = Pipeline::new();
        pipe.del(submission_key(widget_id, submission_id))
            .zrem(submissions_key(widget_id), vec![submission_id.to_string()]);
        match store.transact(Transaction::new(pipe)).await? {
            TxOutcome::Committed(replies) => {
                let existed = replies.into_iter().next().map(Reply::into_int);
                Ok(matches!(existed, Some(Ok(n)) if n > 0))
            }
            TxOutcome::Aborted => Ok(false),
        }
    }

    /// Number of entries in a widget's submission list.
    pub async fn count(store: &Store, widget_id: &WidgetId) -> Result<usize, StoreError> {
        let reply = store
            .cmd(Command::ZCard {
                key: submissions_key(widget_id),
            })
            .await?;
        Ok(reply.into_int()?.max(0) as usize)
    }

    /// Reset the TTL of every stored submission of `widget_ids` to `ttl`.
    ///
    /// There is no hierarchical expiry, so each submission key is
    /// re-expired individually, [`TTL_REAPPLY_PAGE`] keys per pipeline. A
    /// failed page is counted and skipped; the walk continues. Entries whose
    /// hash is already gone are pruned from the list.
    pub async fn reapply_ttl(
        store: &Store,
        widget_ids: &[WidgetId],
        ttl: Duration,
    ) -> Result<TtlReport, StoreError> {
        let mut report = TtlReport::default();

        for widget_id in widget_ids {
            report.widgets += 1;
            let list_key = submissions_key(widget_id);
            let mut dangling = Vec::new();
            let mut start = 0i64;

            loop {
                let stop = start + TTL_REAPPLY_PAGE as i64 - 1;
                let members = store
                    .cmd(Command::ZRange {
                        key: list_key.clone(),
                        start,
                        stop,
                    })
                    .await?
                    .into_list()?;
                if members.is_empty() {
                    break;
                }
                start += members.len() as i64;

                let mut pipe = Pipeline::new();
                let mut expired_members = Vec::with_capacity(members.len());
                for member in members {
                    match SubmissionId::parse_str(&member) {
                        Ok(id) => {
                            pipe.expire(submission_key(widget_id, &id), ttl);
                            expired_members.push(member);
                        }
                        Err(_) => dangling.push(member),
                    }
                }

                match store.run(pipe).await {
                    Ok(replies) => {
                        for (member, reply) in expired_members.into_iter().zip(replies) {
                            match reply.into_int() {
                                Ok(1) => report.updated += 1,
                                Ok(_) => dangling.push(member),
                                Err(_) => report.failed += 1,
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            widget_id = %widget_id,
                            count = expired_members.len(),
                            error = %e,
                            "Failed to re-expire a page of submissions"
                        );
                        report.failed += expired_members.len();
                    }
                }
            }

            if !dangling.is_empty() {
                report.pruned += dangling.len();
                let mut pipe = Pipeline::new();
                pipe.zrem(list_key, dangling);
                if let Err(e) = store.run_checked(pipe).await {
                    tracing::warn!(widget_id = %widget_id, error = %e, "Failed to prune submission list");
                }
            }
        }

        tracing::info!(
            widgets = report.widgets,
            updated = report.updated,
            pruned = report.pruned,
            failed = report.failed,
            ttl_secs = ttl.as_secs(),
            "Submission TTL re-applied"
        );
        Ok(report)
    }
}

/// `now + secs`, or an error when the sum leaves the timestamp range.
fn expiry_after(key: &str, now: Timestamp, secs: u64) -> Result<Timestamp, StoreError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| StoreError::InvalidValue {
            key: key.to_string(),
            reason: format!("ttl of {secs}s is out of range"),
        })
}

fn decode(record: Reply, ttl: Reply) -> Result<Option<Submission>, StoreError> {
    let Some(submission) = Submission::from_fields(&record.into_hash()?)? else {
        return Ok(None);
    };
    Ok(Some(submission.with_remaining_ttl(ttl.into_int()?, Utc::now())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn expiry_is_offset_from_now() {
        let now = Utc::now();
        assert_eq!(
            expiry_after("k", now, 90).unwrap(),
            now + chrono::Duration::seconds(90)
        );
    }

    #[test]
    fn out_of_range_expiry_is_rejected() {
        let now = Utc::now();
        assert_matches!(expiry_after("k", now, u64::MAX), Err(StoreError::InvalidValue { .. }));
        assert_matches!(
            expiry_after("k", now, i64::MAX as u64),
            Err(StoreError::InvalidValue { .. })
        );
    }
}
