//! Uniquely named, query-scoped temporary keys.
//!
//! Every key handed out by [`TempKeys::allocate`] is deleted by
//! [`TempKeys::release`]. If the owning future is dropped before release
//! (caller cancellation), `Drop` schedules the deletion on the runtime.
//! Callers also put a short TTL on each key so a crashed process cannot
//! leak them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::Utc;

use super::{Pipeline, Store};
use crate::keys::TEMP_KEY_PREFIX;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Distinguishes processes sharing one store.
fn process_token() -> &'static str {
    static TOKEN: OnceLock<String> = OnceLock::new();
    TOKEN.get_or_init(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string())
}

/// Tracks temporary keys for one query execution.
#[derive(Debug)]
pub struct TempKeys {
    store: Store,
    scope: String,
    keys: Vec<String>,
}

impl TempKeys {
    /// Start a scope. Cleanup runs on a detached handle so it still happens
    /// after the caller's context is cancelled.
    pub fn new(store: &Store, scope: &str) -> Self {
        Self {
            store: store.detached(),
            scope: scope.to_string(),
            keys: Vec::new(),
        }
    }

    /// Name a new temporary key and register it for cleanup.
    pub fn allocate(&mut self, label: &str) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let key = format!(
            "{TEMP_KEY_PREFIX}:{}:{label}:{}:{nanos}:{seq}",
            self.scope,
            process_token()
        );
        self.keys.push(key.clone());
        key
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Delete every allocated key. Failures are logged; the keys' TTL
    /// removes them eventually.
    pub async fn release(mut self) {
        let keys = std::mem::take(&mut self.keys);
        delete_keys(&self.store, keys).await;
    }
}

impl Drop for TempKeys {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move { delete_keys(&store, keys).await });
            }
            Err(_) => {
                tracing::warn!(count = keys.len(), "Temporary keys left to expire");
            }
        }
    }
}

async fn delete_keys(store: &Store, keys: Vec<String>) {
    if keys.is_empty() {
        return;
    }
    let count = keys.len();
    let mut pipe = Pipeline::new();
    for key in keys {
        pipe.del(key);
    }
    if let Err(e) = store.run_checked(pipe).await {
        tracing::warn!(error = %e, count, "Failed to delete temporary keys");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    #[tokio::test]
    async fn allocated_keys_are_unique() {
        let (store, _memory) = Store::embedded(&StoreConfig::default());
        let mut a = TempKeys::new(&store, "owner");
        let mut b = TempKeys::new(&store, "owner");
        let k1 = a.allocate("owner");
        let k2 = a.allocate("owner");
        let k3 = b.allocate("owner");
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert!(k1.starts_with("widgets:tmp:owner:owner:"));
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn release_deletes_keys_even_after_cancellation() {
        let (store, memory) = Store::embedded(&StoreConfig::default());
        let ctx = crate::store::RequestContext::new();
        let scoped = store.with_context(&ctx);

        let mut temp = TempKeys::new(&scoped, "u1");
        let key = temp.allocate("owner");
        let mut pipe = Pipeline::new();
        pipe.sadd(key.clone(), vec!["a".into()]);
        scoped.run(pipe).await.unwrap();
        assert_eq!(memory.keys("widgets:tmp:*"), vec![key]);

        ctx.cancel_token().cancel();
        temp.release().await;
        assert!(memory.keys("widgets:tmp:*").is_empty());
    }

    #[tokio::test]
    async fn drop_without_release_schedules_cleanup() {
        let (store, memory) = Store::embedded(&StoreConfig::default());
        {
            let mut temp = TempKeys::new(&store, "u2");
            let key = temp.allocate("types");
            let mut pipe = Pipeline::new();
            pipe.sadd(key, vec!["a".into()]);
            store.run(pipe).await.unwrap();
        }
        for _ in 0..50 {
            if memory.keys("widgets:tmp:*").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(memory.keys("widgets:tmp:*").is_empty());
    }
}
