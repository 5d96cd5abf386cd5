//! Embedded in-process store.
//!
//! Keys are distributed over a fixed number of shards by hash slot, so keys
//! sharing a hash tag always share a shard and a transaction over them only
//! takes one lock. Expired keys are dropped lazily on access and in bulk by
//! [`MemoryStore::purge_expired`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};

use super::{Command, Guard, KvBackend, Pipeline, Reply, Transaction, TxOutcome};
use crate::error::StoreError;
use crate::keys::hash_slot;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(SortedSet),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn is_empty(&self) -> bool {
        match &self.value {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

/// Total-ordered score wrapper.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// Members ordered by `(score, member)`, ties broken lexicographically.
#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Insert or rescore; returns `true` if the member is new.
    fn insert(&mut self, member: String, score: f64) -> bool {
        let is_new = match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.order.remove(&(Score(old), member.clone()));
                false
            }
            None => true,
        };
        self.order.insert((Score(score), member));
        is_new
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    fn range(&self, start: i64, stop: i64, reverse: bool) -> Vec<String> {
        let Some((from, to)) = normalize_range(start, stop, self.len()) else {
            return Vec::new();
        };
        let take = to - from + 1;
        if reverse {
            self.order
                .iter()
                .rev()
                .skip(from)
                .take(take)
                .map(|(_, m)| m.clone())
                .collect()
        } else {
            self.order
                .iter()
                .skip(from)
                .take(take)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }
}

/// Resolve possibly negative, inclusive rank bounds against `len`.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, Entry>,
}

impl Shard {
    /// Drop `key` if it has expired.
    fn expire_if_due(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        self.expire_if_due(key, now);
        self.entries.get_mut(key)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty) {
            self.entries.remove(key);
        }
    }

    fn hash_mut(
        &mut self,
        key: &str,
        now: Instant,
    ) -> Result<&mut HashMap<String, String>, StoreError> {
        self.expire_if_due(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str, now: Instant) -> Result<&mut HashSet<String>, StoreError> {
        self.expire_if_due(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset_mut(&mut self, key: &str, now: Instant) -> Result<&mut SortedSet, StoreError> {
        self.expire_if_due(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(SortedSet::default())));
        match &mut entry.value {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn read_hash(&mut self, key: &str, now: Instant) -> Result<Option<&HashMap<String, String>>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(&*h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn read_set(&mut self, key: &str, now: Instant) -> Result<Option<&HashSet<String>>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(&*s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn read_zset(&mut self, key: &str, now: Instant) -> Result<Option<&SortedSet>, StoreError> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(&*z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Replace `key` with `members`, deleting it when empty.
    fn store_set(&mut self, key: &str, members: HashSet<String>) -> usize {
        let len = members.len();
        if members.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Set(members)));
        }
        len
    }

    fn check_guard(&mut self, guard: &Guard, now: Instant) -> Result<bool, StoreError> {
        match guard {
            Guard::FieldEquals {
                key,
                field,
                expected,
            } => {
                let current = self.read_hash(key, now)?.and_then(|h| h.get(field));
                Ok(current == expected.as_ref())
            }
        }
    }

    /// Apply a command whose keys all live in this shard.
    fn apply(&mut self, command: Command, now: Instant) -> Result<Reply, StoreError> {
        match command {
            Command::Get { key } => match self.live(&key, now) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Ok(Reply::Str(s.clone())),
                Some(_) => Err(wrong_type(&key)),
            },
            Command::IncrBy { key, delta } => {
                self.expire_if_due(&key, now);
                let entry = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::new(Value::Str("0".to_string())));
                let Value::Str(current) = &mut entry.value else {
                    return Err(wrong_type(&key));
                };
                let next = parse_int(&key, current)? + delta;
                *current = next.to_string();
                Ok(Reply::Int(next))
            }
            Command::HSet { key, fields } => {
                let hash = self.hash_mut(&key, now)?;
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                self.drop_if_empty(&key);
                Ok(Reply::Int(added))
            }
            Command::HGet { key, field } => Ok(self
                .read_hash(&key, now)?
                .and_then(|h| h.get(&field).cloned())
                .map_or(Reply::Nil, Reply::Str)),
            Command::HGetAll { key } => Ok(Reply::Hash(
                self.read_hash(&key, now)?.cloned().unwrap_or_default(),
            )),
            Command::HIncrBy { key, field, delta } => {
                let hash = self.hash_mut(&key, now)?;
                let current = match hash.get(&field) {
                    Some(v) => parse_int(&key, v)?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field, next.to_string());
                Ok(Reply::Int(next))
            }
            Command::SAdd { key, members } => {
                let set = self.set_mut(&key, now)?;
                let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
                self.drop_if_empty(&key);
                Ok(Reply::Int(added as i64))
            }
            Command::SRem { key, members } => {
                let removed = match self.live(&key, now) {
                    None => 0,
                    Some(Entry {
                        value: Value::Set(set),
                        ..
                    }) => members.iter().filter(|m| set.remove(m.as_str())).count(),
                    Some(_) => return Err(wrong_type(&key)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(removed as i64))
            }
            Command::SMembers { key } => Ok(Reply::List(
                self.read_set(&key, now)?
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
            )),
            Command::SCard { key } => Ok(Reply::Int(
                self.read_set(&key, now)?.map_or(0, HashSet::len) as i64,
            )),
            Command::SPop { key, count } => {
                let popped: Vec<String> = match self.live(&key, now) {
                    None => Vec::new(),
                    Some(Entry {
                        value: Value::Set(set),
                        ..
                    }) => {
                        let picked: Vec<String> = set.iter().take(count).cloned().collect();
                        for m in &picked {
                            set.remove(m);
                        }
                        picked
                    }
                    Some(_) => return Err(wrong_type(&key)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::List(popped))
            }
            Command::SInter { keys } => {
                let sets = self.collect_sets(&keys, now)?;
                Ok(Reply::List(intersect(sets).into_iter().collect()))
            }
            Command::SInterStore { dest, keys } => {
                let sets = self.collect_sets(&keys, now)?;
                let result = intersect(sets);
                Ok(Reply::Int(self.store_set(&dest, result) as i64))
            }
            Command::SUnionStore { dest, keys } => {
                let sets = self.collect_sets(&keys, now)?;
                let result = union(sets);
                Ok(Reply::Int(self.store_set(&dest, result) as i64))
            }
            Command::ZAdd { key, members } => {
                let zset = self.zset_mut(&key, now)?;
                let added = members
                    .into_iter()
                    .filter(|(score, member)| zset.insert(member.clone(), *score))
                    .count();
                self.drop_if_empty(&key);
                Ok(Reply::Int(added as i64))
            }
            Command::ZRem { key, members } => {
                let removed = match self.live(&key, now) {
                    None => 0,
                    Some(Entry {
                        value: Value::ZSet(zset),
                        ..
                    }) => members.iter().filter(|m| zset.remove(m.as_str())).count(),
                    Some(_) => return Err(wrong_type(&key)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(removed as i64))
            }
            Command::ZScore { key, member } => Ok(self
                .read_zset(&key, now)?
                .and_then(|z| z.score(&member))
                .map_or(Reply::Nil, Reply::Score)),
            Command::ZCard { key } => Ok(Reply::Int(
                self.read_zset(&key, now)?.map_or(0, SortedSet::len) as i64,
            )),
            Command::ZRange { key, start, stop } => Ok(Reply::List(
                self.read_zset(&key, now)?
                    .map(|z| z.range(start, stop, false))
                    .unwrap_or_default(),
            )),
            Command::ZRevRange { key, start, stop } => Ok(Reply::List(
                self.read_zset(&key, now)?
                    .map(|z| z.range(start, stop, true))
                    .unwrap_or_default(),
            )),
            Command::Del { key } => {
                let existed = self.live(&key, now).is_some();
                self.entries.remove(&key);
                Ok(Reply::Int(i64::from(existed)))
            }
            Command::Expire { key, ttl } => {
                if self.live(&key, now).is_none() {
                    return Ok(Reply::Int(0));
                }
                if ttl.is_zero() {
                    self.entries.remove(&key);
                } else if let Some(entry) = self.entries.get_mut(&key) {
                    // Past the clock's range the key never expires.
                    entry.expires_at = now.checked_add(ttl);
                }
                Ok(Reply::Int(1))
            }
            Command::PTtl { key } => Ok(Reply::Int(match self.live(&key, now) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => at.saturating_duration_since(now).as_millis() as i64,
            })),
            Command::Scan { .. } => Err(StoreError::Unavailable(
                "SCAN cannot run inside a single shard".to_string(),
            )),
        }
    }

    fn collect_sets(
        &mut self,
        keys: &[String],
        now: Instant,
    ) -> Result<Vec<HashSet<String>>, StoreError> {
        keys.iter()
            .map(|k| Ok(self.read_set(k, now)?.cloned().unwrap_or_default()))
            .collect()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn parse_int(key: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse().map_err(|_| StoreError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{raw}' is not an integer"),
    })
}

fn intersect(mut sets: Vec<HashSet<String>>) -> HashSet<String> {
    if sets.is_empty() {
        return HashSet::new();
    }
    // Start from the smallest set.
    sets.sort_by_key(HashSet::len);
    let mut iter = sets.into_iter();
    let mut acc = iter.next().unwrap_or_default();
    for set in iter {
        acc.retain(|m| set.contains(m));
        if acc.is_empty() {
            break;
        }
    }
    acc
}

fn union(sets: Vec<HashSet<String>>) -> HashSet<String> {
    sets.into_iter().flatten().collect()
}

/// Compile a key pattern: `*`, `?` and `[...]` are wildcards, braces are
/// literal.
fn key_matcher(pattern: &str) -> Result<GlobMatcher, StoreError> {
    let escaped = pattern.replace('{', "\\{").replace('}', "\\}");
    GlobBuilder::new(&escaped)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| StoreError::InvalidValue {
            key: pattern.to_string(),
            reason: format!("bad key pattern: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Sharded in-memory [`KvBackend`].
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<Mutex<Shard>>,
    round_trips: AtomicU64,
    commands: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(super::DEFAULT_SHARDS)
    }
}

impl MemoryStore {
    /// Create an empty store with `shards` shards (at least one).
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::default())).collect(),
            round_trips: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }

    /// Number of pipelines and transactions served so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Number of individual commands served so far.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Live keys matching `pattern`, sorted. A malformed pattern matches
    /// nothing.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let Ok(matcher) = key_matcher(pattern) else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut out: Vec<String> = Vec::new();
        for shard in &self.shards {
            if let Ok(guard) = shard.lock() {
                out.extend(
                    guard
                        .entries
                        .iter()
                        .filter(|(k, e)| !e.is_expired(now) && matcher.is_match(k))
                        .map(|(k, _)| k.clone()),
                );
            }
        }
        out.sort();
        out
    }

    /// Drop every expired key. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            if let Ok(mut guard) = shard.lock() {
                let before = guard.entries.len();
                guard.entries.retain(|_, e| !e.is_expired(now));
                removed += before - guard.entries.len();
            }
        }
        removed
    }

    fn shard_index(&self, key: &str) -> usize {
        usize::from(hash_slot(key)) % self.shards.len()
    }

    fn lock(&self, index: usize) -> Result<MutexGuard<'_, Shard>, StoreError> {
        self.shards[index]
            .lock()
            .map_err(|_| StoreError::Unavailable("shard lock poisoned".to_string()))
    }

    fn read_set_anywhere(&self, key: &str, now: Instant) -> Result<HashSet<String>, StoreError> {
        let mut shard = self.lock(self.shard_index(key))?;
        Ok(shard.read_set(key, now)?.cloned().unwrap_or_default())
    }

    /// Apply one pipelined command, spanning shards when needed.
    fn apply(&self, command: Command, now: Instant) -> Result<Reply, StoreError> {
        match command {
            Command::Scan {
                cursor, pattern, ..
            } => self.scan(cursor, &pattern, now),
            Command::SInter { ref keys }
            | Command::SInterStore { ref keys, .. }
            | Command::SUnionStore { ref keys, .. }
                if !self.single_shard(&command) =>
            {
                // Sources are read one shard at a time; no two locks are
                // ever held together.
                let sets = keys
                    .iter()
                    .map(|k| self.read_set_anywhere(k, now))
                    .collect::<Result<Vec<_>, _>>()?;
                match command {
                    Command::SInter { .. } => {
                        Ok(Reply::List(intersect(sets).into_iter().collect()))
                    }
                    Command::SInterStore { dest, .. } => {
                        let mut shard = self.lock(self.shard_index(&dest))?;
                        Ok(Reply::Int(shard.store_set(&dest, intersect(sets)) as i64))
                    }
                    Command::SUnionStore { dest, .. } => {
                        let mut shard = self.lock(self.shard_index(&dest))?;
                        Ok(Reply::Int(shard.store_set(&dest, union(sets)) as i64))
                    }
                    _ => unreachable!("guarded by the outer match"),
                }
            }
            other => {
                let index = other
                    .keys()
                    .first()
                    .map_or(0, |k| self.shard_index(k));
                let mut shard = self.lock(index)?;
                shard.apply(other, now)
            }
        }
    }

    fn single_shard(&self, command: &Command) -> bool {
        let mut indexes = command.keys().into_iter().map(|k| self.shard_index(k));
        match indexes.next() {
            Some(first) => indexes.all(|i| i == first),
            None => true,
        }
    }

    /// One shard per cursor step; cursor `0` ends the iteration.
    fn scan(&self, cursor: u64, pattern: &str, now: Instant) -> Result<Reply, StoreError> {
        let index = cursor as usize;
        if index >= self.shards.len() {
            return Ok(Reply::Scan {
                cursor: 0,
                keys: Vec::new(),
            });
        }
        let matcher = key_matcher(pattern)?;
        let shard = self.lock(index)?;
        let mut keys: Vec<String> = shard
            .entries
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && matcher.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        let next = if index + 1 >= self.shards.len() {
            0
        } else {
            index as u64 + 1
        };
        Ok(Reply::Scan { cursor: next, keys })
    }
}

#[async_trait]
impl KvBackend for MemoryStore {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.commands
            .fetch_add(pipeline.len() as u64, Ordering::Relaxed);
        let now = Instant::now();
        let mut replies = Vec::with_capacity(pipeline.len());
        for command in pipeline.into_commands() {
            match self.apply(command, now) {
                Ok(reply) => replies.push(reply),
                Err(e @ StoreError::Unavailable(_)) => return Err(e),
                Err(e) => replies.push(Reply::Error(e.to_string())),
            }
        }
        Ok(replies)
    }

    async fn transact(&self, tx: Transaction) -> Result<TxOutcome, StoreError> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.commands
            .fetch_add(tx.pipeline.len() as u64, Ordering::Relaxed);

        let keys: Vec<String> = tx.keys().into_iter().map(str::to_string).collect();
        if tx.pipeline.commands().iter().any(|c| matches!(c, Command::Scan { .. })) {
            return Err(StoreError::Unavailable(
                "SCAN is not allowed in a transaction".to_string(),
            ));
        }
        let Some(first) = keys.first() else {
            return Ok(TxOutcome::Committed(Vec::new()));
        };
        let slot = hash_slot(first);
        if keys.iter().any(|k| hash_slot(k) != slot) {
            return Err(StoreError::CrossSlot(keys));
        }

        let now = Instant::now();
        let mut shard = self.lock(self.shard_index(first))?;
        if let Some(guard) = &tx.guard {
            if !shard.check_guard(guard, now)? {
                return Ok(TxOutcome::Aborted);
            }
        }
        let replies = tx
            .pipeline
            .into_commands()
            .into_iter()
            .map(|command| shard.apply(command, now))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TxOutcome::Committed(replies))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
