use std::time::Duration;

use anyhow::{bail, Context};
use widgetry_db::store::{StoreConfig, DEFAULT_OP_TIMEOUT, DEFAULT_SHARDS};

/// Default interval between outbox drains.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5;

/// Default outbox entries reconciled per drain.
pub const DEFAULT_RECONCILE_BATCH: usize = 100;

/// Default interval between expired-key sweeps of the embedded store.
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    /// How often the reconciliation outbox is drained.
    pub reconcile_interval: Duration,
    /// Outbox entries reconciled per drain.
    pub reconcile_batch: usize,
    /// Full index rebuild cadence; `None` disables periodic rebuilds.
    pub rebuild_interval: Option<Duration>,
    /// How often expired keys are swept from the embedded store.
    pub purge_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            reconcile_batch: DEFAULT_RECONCILE_BATCH,
            rebuild_interval: None,
            purge_interval: Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default |
    /// |---------------------------|---------|
    /// | `STORE_SHARDS`            | `16`    |
    /// | `STORE_OP_TIMEOUT_MS`     | `2000`  |
    /// | `RECONCILE_INTERVAL_SECS` | `5`     |
    /// | `RECONCILE_BATCH`         | `100`   |
    /// | `REBUILD_INTERVAL_SECS`   | `0` (disabled) |
    /// | `PURGE_INTERVAL_SECS`     | `60`    |
    ///
    /// A `.env` file in the working directory is loaded first, if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if set.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let shards: usize = parse_or(&lookup, "STORE_SHARDS", DEFAULT_SHARDS)?;
        if shards == 0 {
            bail!("STORE_SHARDS must be at least 1");
        }
        let op_timeout_ms: u64 = parse_or(
            &lookup,
            "STORE_OP_TIMEOUT_MS",
            DEFAULT_OP_TIMEOUT.as_millis() as u64,
        )?;
        if op_timeout_ms == 0 {
            bail!("STORE_OP_TIMEOUT_MS must be at least 1");
        }

        let reconcile_secs: u64 =
            parse_or(&lookup, "RECONCILE_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL_SECS)?;
        let reconcile_batch: usize = parse_or(&lookup, "RECONCILE_BATCH", DEFAULT_RECONCILE_BATCH)?;
        let rebuild_secs: u64 = parse_or(&lookup, "REBUILD_INTERVAL_SECS", 0)?;
        let purge_secs: u64 = parse_or(&lookup, "PURGE_INTERVAL_SECS", DEFAULT_PURGE_INTERVAL_SECS)?;

        if reconcile_secs == 0 || purge_secs == 0 {
            bail!("RECONCILE_INTERVAL_SECS and PURGE_INTERVAL_SECS must be at least 1");
        }
        if reconcile_batch == 0 {
            bail!("RECONCILE_BATCH must be at least 1");
        }

        Ok(Self {
            store: StoreConfig {
                shards,
                op_timeout: Duration::from_millis(op_timeout_ms),
            },
            reconcile_interval: Duration::from_secs(reconcile_secs),
            reconcile_batch,
            rebuild_interval: (rebuild_secs > 0).then(|| Duration::from_secs(rebuild_secs)),
            purge_interval: Duration::from_secs(purge_secs),
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<WorkerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.store.shards, DEFAULT_SHARDS);
        assert_eq!(config.store.op_timeout, DEFAULT_OP_TIMEOUT);
        assert_eq!(config.reconcile_batch, DEFAULT_RECONCILE_BATCH);
        assert_eq!(config.rebuild_interval, None);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("STORE_SHARDS", "4"),
            ("STORE_OP_TIMEOUT_MS", "250"),
            ("REBUILD_INTERVAL_SECS", "3600"),
            ("RECONCILE_BATCH", " 10 "),
        ])
        .unwrap();
        assert_eq!(config.store.shards, 4);
        assert_eq!(config.store.op_timeout, Duration::from_millis(250));
        assert_eq!(config.rebuild_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.reconcile_batch, 10);
    }

    #[test]
    fn invalid_values_fail() {
        let err = load(&[("STORE_SHARDS", "many")]).unwrap_err();
        assert!(err.to_string().contains("STORE_SHARDS"));
        assert!(load(&[("STORE_SHARDS", "0")]).is_err());
        assert!(load(&[("PURGE_INTERVAL_SECS", "0")]).is_err());
    }
}
