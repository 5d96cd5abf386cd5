//! Key-value store abstraction.
//!
//! Repositories talk to the store exclusively through [`Store`], a cheap
//! clonable handle that bounds every round trip by a timeout and the
//! caller's cancellation token. Commands are batched into a [`Pipeline`]
//! (one round trip, not atomic) or a [`Transaction`] (atomic, single slot,
//! optionally guarded).

pub mod memory;
mod temp;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use temp::TempKeys;

/// Default number of shards in the embedded store.
pub const DEFAULT_SHARDS: usize = 16;

/// Default per-round-trip timeout.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Commands and replies
// ---------------------------------------------------------------------------

/// A single store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    IncrBy { key: String, delta: i64 },
    HSet { key: String, fields: Vec<(String, String)> },
    HGet { key: String, field: String },
    HGetAll { key: String },
    HIncrBy { key: String, field: String, delta: i64 },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    SMembers { key: String },
    SCard { key: String },
    SPop { key: String, count: usize },
    SInter { keys: Vec<String> },
    SInterStore { dest: String, keys: Vec<String> },
    SUnionStore { dest: String, keys: Vec<String> },
    ZAdd { key: String, members: Vec<(f64, String)> },
    ZRem { key: String, members: Vec<String> },
    ZScore { key: String, member: String },
    ZCard { key: String },
    ZRange { key: String, start: i64, stop: i64 },
    ZRevRange { key: String, start: i64, stop: i64 },
    Del { key: String },
    Expire { key: String, ttl: Duration },
    /// Remaining time to live in milliseconds; `-1` without expiry, `-2` when missing.
    PTtl { key: String },
    Scan { cursor: u64, pattern: String, count: usize },
}

impl Command {
    /// Every key this command reads or writes.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Command::Get { key }
            | Command::IncrBy { key, .. }
            | Command::HSet { key, .. }
            | Command::HGet { key, .. }
            | Command::HGetAll { key }
            | Command::HIncrBy { key, .. }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::SMembers { key }
            | Command::SCard { key }
            | Command::SPop { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZScore { key, .. }
            | Command::ZCard { key }
            | Command::ZRange { key, .. }
            | Command::ZRevRange { key, .. }
            | Command::Del { key }
            | Command::Expire { key, .. }
            | Command::PTtl { key } => vec![key.as_str()],
            Command::SInter { keys } => keys.iter().map(String::as_str).collect(),
            Command::SInterStore { dest, keys } | Command::SUnionStore { dest, keys } => {
                std::iter::once(dest.as_str())
                    .chain(keys.iter().map(String::as_str))
                    .collect()
            }
            Command::Scan { .. } => Vec::new(),
        }
    }
}

/// A command reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Nil,
    Int(i64),
    Score(f64),
    Str(String),
    List(Vec<String>),
    Hash(HashMap<String, String>),
    Scan { cursor: u64, keys: Vec<String> },
    /// This command failed; the rest of its pipeline still ran.
    Error(String),
}

impl Reply {
    fn unexpected(&self, expected: &'static str) -> StoreError {
        match self {
            Reply::Error(message) => StoreError::Command(message.clone()),
            other => StoreError::UnexpectedReply {
                expected,
                got: format!("{other:?}"),
            },
        }
    }

    /// Turn a per-command failure into an error.
    pub fn into_result(self) -> Result<Reply, StoreError> {
        match self {
            Reply::Error(message) => Err(StoreError::Command(message)),
            other => Ok(other),
        }
    }

    pub fn into_int(self) -> Result<i64, StoreError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn into_opt_string(self) -> Result<Option<String>, StoreError> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Str(s) => Ok(Some(s)),
            other => Err(other.unexpected("string or nil")),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>, StoreError> {
        match self {
            Reply::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    /// Hash replies; a missing key yields an empty map.
    pub fn into_hash(self) -> Result<HashMap<String, String>, StoreError> {
        match self {
            Reply::Hash(map) => Ok(map),
            other => Err(other.unexpected("hash")),
        }
    }

    pub fn into_score(self) -> Result<Option<f64>, StoreError> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Score(s) => Ok(Some(s)),
            other => Err(other.unexpected("score or nil")),
        }
    }

    pub fn into_scan(self) -> Result<(u64, Vec<String>), StoreError> {
        match self {
            Reply::Scan { cursor, keys } => Ok((cursor, keys)),
            other => Err(other.unexpected("scan page")),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipelines and transactions
// ---------------------------------------------------------------------------

/// An ordered batch of commands sent in one round trip.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Get { key: key.into() })
    }

    pub fn incr_by(&mut self, key: impl Into<String>, delta: i64) -> &mut Self {
        self.push(Command::IncrBy {
            key: key.into(),
            delta,
        })
    }

    pub fn hset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.push(Command::HSet {
            key: key.into(),
            fields,
        })
    }

    pub fn hget(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(Command::HGet {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn hgetall(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::HGetAll { key: key.into() })
    }

    pub fn hincr_by(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
    ) -> &mut Self {
        self.push(Command::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        })
    }

    pub fn sadd(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.push(Command::SAdd {
            key: key.into(),
            members,
        })
    }

    pub fn srem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.push(Command::SRem {
            key: key.into(),
            members,
        })
    }

    pub fn smembers(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::SMembers { key: key.into() })
    }

    pub fn scard(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::SCard { key: key.into() })
    }

    pub fn spop(&mut self, key: impl Into<String>, count: usize) -> &mut Self {
        self.push(Command::SPop {
            key: key.into(),
            count,
        })
    }

    pub fn sinter(&mut self, keys: Vec<String>) -> &mut Self {
        self.push(Command::SInter { keys })
    }

    pub fn sinterstore(&mut self, dest: impl Into<String>, keys: Vec<String>) -> &mut Self {
        self.push(Command::SInterStore {
            dest: dest.into(),
            keys,
        })
    }

    pub fn sunionstore(&mut self, dest: impl Into<String>, keys: Vec<String>) -> &mut Self {
        self.push(Command::SUnionStore {
            dest: dest.into(),
            keys,
        })
    }

    pub fn zadd(&mut self, key: impl Into<String>, members: Vec<(f64, String)>) -> &mut Self {
        self.push(Command::ZAdd {
            key: key.into(),
            members,
        })
    }

    pub fn zrem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.push(Command::ZRem {
            key: key.into(),
            members,
        })
    }

    pub fn zscore(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Command::ZScore {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn zcard(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::ZCard { key: key.into() })
    }

    pub fn zrange(&mut self, key: impl Into<String>, start: i64, stop: i64) -> &mut Self {
        self.push(Command::ZRange {
            key: key.into(),
            start,
            stop,
        })
    }

    pub fn zrevrange(&mut self, key: impl Into<String>, start: i64, stop: i64) -> &mut Self {
        self.push(Command::ZRevRange {
            key: key.into(),
            start,
            stop,
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Del { key: key.into() })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn pttl(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::PTtl { key: key.into() })
    }
}

/// Optimistic precondition checked atomically before a transaction runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Hash field `field` at `key` must equal `expected` (`None` = absent).
    FieldEquals {
        key: String,
        field: String,
        expected: Option<String>,
    },
}

impl Guard {
    pub fn field_equals(
        key: impl Into<String>,
        field: impl Into<String>,
        expected: Option<String>,
    ) -> Self {
        Guard::FieldEquals {
            key: key.into(),
            field: field.into(),
            expected,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Guard::FieldEquals { key, .. } => key,
        }
    }
}

/// Commands applied atomically; every key must map to the same hash slot.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub guard: Option<Guard>,
    pub pipeline: Pipeline,
}

impl Transaction {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            guard: None,
            pipeline,
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Every key touched, guard included.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.guard.iter().map(Guard::key).collect();
        for command in self.pipeline.commands() {
            keys.extend(command.keys());
        }
        keys
    }
}

/// Result of a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    Committed(Vec<Reply>),
    /// The guard did not hold; nothing was written.
    Aborted,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// A key-value store offering strings, hashes, sets, sorted sets, set
/// algebra, and per-key expiry.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Run a pipeline in one round trip. Replies come back in command order.
    /// Commands are applied independently; there is no atomicity. A command
    /// that fails yields [`Reply::Error`] in its slot, and `Err` is kept for
    /// failures of the round trip itself.
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError>;

    /// Run a single-slot transaction atomically.
    async fn transact(&self, tx: Transaction) -> Result<TxOutcome, StoreError>;
}

// ---------------------------------------------------------------------------
// Configuration and request context
// ---------------------------------------------------------------------------

/// Store handle configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Shard count for the embedded store.
    pub shards: usize,
    /// Upper bound on any single round trip.
    pub op_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

/// Deadline and cancellation inherited from the caller's request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire the context `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Tie the context to an externally owned token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Bounded, cancellable access to a [`KvBackend`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    op_timeout: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("op_timeout", &self.op_timeout)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            op_timeout: config.op_timeout,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A handle over a fresh embedded [`MemoryStore`], returned alongside it
    /// for diagnostics and expiry sweeps.
    pub fn embedded(config: &StoreConfig) -> (Self, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new(config.shards));
        let store = Self::new(memory.clone(), config);
        (store, memory)
    }

    /// A handle bound to the caller's deadline and cancellation.
    ///
    /// The effective deadline is the earlier of the existing one and the
    /// context's.
    pub fn with_context(&self, ctx: &RequestContext) -> Self {
        let deadline = match (self.deadline, ctx.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            backend: Arc::clone(&self.backend),
            op_timeout: self.op_timeout,
            deadline,
            cancel: ctx.cancel_token().clone(),
        }
    }

    /// A handle that ignores the caller's deadline and cancellation. Each
    /// round trip is still bounded by the per-call timeout.
    pub fn detached(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            op_timeout: self.op_timeout,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Run a pipeline. An empty pipeline costs no round trip.
    pub async fn run(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }
        let expected = pipeline.len();
        let replies = self.bounded(self.backend.execute(pipeline)).await?;
        if replies.len() != expected {
            return Err(StoreError::UnexpectedReply {
                expected: "one reply per command",
                got: format!("{} replies for {expected} commands", replies.len()),
            });
        }
        Ok(replies)
    }

    /// Run a pipeline and fail on the first command that failed.
    pub async fn run_checked(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        self.run(pipeline)
            .await?
            .into_iter()
            .map(Reply::into_result)
            .collect()
    }

    /// Run a single command.
    pub async fn cmd(&self, command: Command) -> Result<Reply, StoreError> {
        let mut pipeline = Pipeline::new();
        pipeline.push(command);
        let mut replies = self.run(pipeline).await?;
        replies
            .pop()
            .ok_or(StoreError::UnexpectedReply {
                expected: "one reply",
                got: "none".to_string(),
            })?
            .into_result()
    }

    /// Run a transaction.
    pub async fn transact(&self, tx: Transaction) -> Result<TxOutcome, StoreError> {
        self.bounded(self.backend.transact(tx)).await
    }

    /// Collect every key matching `pattern` by iterating the scan cursor.
    pub async fn scan_all(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let reply = self
                .cmd(Command::Scan {
                    cursor,
                    pattern: pattern.to_string(),
                    count: 1_000,
                })
                .await?;
            let (next, page) = reply.into_scan()?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let per_call = Instant::now() + self.op_timeout;
        let deadline = self.deadline.map_or(per_call, |d| d.min(per_call));

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            result = tokio::time::timeout_at(deadline, fut) => {
                result.map_err(|_| StoreError::Timeout)?
            }
        }
    }
}
