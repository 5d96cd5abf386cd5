//! Shared helpers for the widget store integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use widgetry_core::widget_types::WidgetType;
use widgetry_db::models::widget::Widget;
use widgetry_db::store::{
    Command, KvBackend, MemoryStore, Pipeline, Reply, Store, StoreConfig, Transaction, TxOutcome,
};
use widgetry_db::{StoreError, WidgetService};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn service() -> (WidgetService, Arc<MemoryStore>) {
    WidgetService::embedded(&StoreConfig::default())
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// A widget created `seq` seconds after a fixed base time, so creation
/// order is deterministic.
pub fn widget_at(owner: &str, widget_type: WidgetType, name: &str, visible: bool, seq: i64) -> Widget {
    let mut widget = Widget::new(owner, widget_type, name, visible);
    widget.created_at = base_time() + Duration::seconds(seq);
    widget.updated_at = widget.created_at;
    widget
}

/// Insert widgets in order, returning them.
pub async fn seed(service: &WidgetService, widgets: Vec<Widget>) -> Vec<Widget> {
    for widget in &widgets {
        service.insert(widget).await.unwrap();
    }
    widgets
}

pub fn ids(widgets: &[Widget]) -> Vec<uuid::Uuid> {
    widgets.iter().map(|w| w.id).collect()
}

pub async fn run(store: &Store, build: impl FnOnce(&mut Pipeline)) -> Vec<Reply> {
    let mut pipe = Pipeline::new();
    build(&mut pipe);
    store.run(pipe).await.unwrap()
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// What the [`FaultyBackend`] should break.
#[derive(Debug, Clone, Default)]
pub enum Fault {
    #[default]
    None,
    /// Fail any pipeline that writes an index key.
    IndexWrites,
    /// Fail any pipeline containing a set intersection.
    Intersection,
    /// Cancel `token` and hang on any pipeline containing a set intersection.
    CancelOnIntersection(CancellationToken),
    /// Never answer a pipeline.
    Hang,
    /// Answer index writes with an error reply; the rest of the pipeline runs.
    IndexWriteReplies,
    /// Answer `ZSCORE` lookups of this member with an error reply.
    ScoreReplies(String),
}

impl Fault {
    fn fails_command(&self, command: &Command) -> bool {
        match (self, command) {
            (Fault::IndexWriteReplies, command) => is_index_write(command),
            (Fault::ScoreReplies(target), Command::ZScore { member, .. }) => member == target,
            _ => false,
        }
    }
}

/// A [`MemoryStore`] wrapper that injects failures on demand.
pub struct FaultyBackend {
    pub inner: Arc<MemoryStore>,
    fault: Mutex<Fault>,
}

impl FaultyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MemoryStore::default()),
            fault: Mutex::new(Fault::None),
        })
    }

    pub fn set(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    pub fn service(self: &Arc<Self>) -> WidgetService {
        let backend: Arc<dyn KvBackend> = self.clone();
        WidgetService::new(Store::new(backend, &StoreConfig::default()))
    }
}

fn is_index_key(key: &str) -> bool {
    key.starts_with("widgets:type:")
        || key.starts_with("widgets:isVisible:")
        || key == "widgets:by_time"
        || key.ends_with(":user:widgets")
}

fn is_index_write(command: &Command) -> bool {
    matches!(
        command,
        Command::SAdd { .. } | Command::SRem { .. } | Command::ZAdd { .. } | Command::ZRem { .. }
    ) && command.keys().into_iter().any(is_index_key)
}

#[async_trait]
impl KvBackend for FaultyBackend {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        let fault = self.fault.lock().unwrap().clone();
        let has_intersection = pipeline
            .commands()
            .iter()
            .any(|c| matches!(c, Command::SInter { .. }));
        match &fault {
            Fault::IndexWrites if pipeline.commands().iter().any(is_index_write) => {
                return Err(StoreError::Unavailable("injected index failure".to_string()));
            }
            Fault::Intersection if has_intersection => {
                return Err(StoreError::Unavailable("injected intersection failure".to_string()));
            }
            Fault::CancelOnIntersection(token) if has_intersection => {
                token.cancel();
                std::future::pending::<()>().await;
            }
            Fault::Hang => std::future::pending::<()>().await,
            _ => {}
        }
        if !pipeline.commands().iter().any(|c| fault.fails_command(c)) {
            return self.inner.execute(pipeline).await;
        }

        let mut replies = Vec::with_capacity(pipeline.len());
        for command in pipeline.into_commands() {
            if fault.fails_command(&command) {
                replies.push(Reply::Error("injected command failure".to_string()));
                continue;
            }
            let mut single = Pipeline::new();
            single.push(command);
            replies.extend(self.inner.execute(single).await?);
        }
        Ok(replies)
    }

    async fn transact(&self, tx: Transaction) -> Result<TxOutcome, StoreError> {
        self.inner.transact(tx).await
    }
}
