use std::str::FromStr;
use std::time::Duration;

/// Worker lifecycle policy for the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehousePolicy {
    /// Most workers online at once; the least recently used is evicted past this.
    pub max_vats_online: usize,
    /// Replace the worker with one loaded from the fresh snapshot after saving.
    pub restart_worker_on_snapshot: bool,
    /// Span length that triggers the first snapshot of an incarnation.
    pub snapshot_initial: u64,
    /// Span length that triggers every later snapshot.
    pub snapshot_interval: u64,
    /// Deliver `bringOutYourDead` after this many deliveries, if set.
    pub reap_interval: Option<u64>,
    /// How long a worker gets to acknowledge shutdown before it is killed.
    pub shutdown_timeout: Duration,
}

impl Default for WarehousePolicy {
    fn default() -> Self {
        Self {
            max_vats_online: 50,
            restart_worker_on_snapshot: true,
            snapshot_initial: 3,
            snapshot_interval: 200,
            reap_interval: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl WarehousePolicy {
    /// Defaults overridden by `VATK_MAX_VATS_ONLINE`, `VATK_SNAPSHOT_INITIAL`,
    /// `VATK_SNAPSHOT_INTERVAL` and `VATK_REAP_INTERVAL`.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(n) = env_number("VATK_MAX_VATS_ONLINE") {
            policy.max_vats_online = n;
        }
        if let Some(n) = env_number("VATK_SNAPSHOT_INITIAL") {
            policy.snapshot_initial = n;
        }
        if let Some(n) = env_number("VATK_SNAPSHOT_INTERVAL") {
            policy.snapshot_interval = n;
        }
        if let Some(n) = env_number("VATK_REAP_INTERVAL") {
            policy.reap_interval = Some(n);
        }
        policy
    }

    /// How many vats `start` brings online ahead of their first delivery.
    pub fn preload_count(&self) -> usize {
        self.max_vats_online / 2
    }
}

fn env_number<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("ignoring {name}={raw:?}: not a number");
            None
        }
    }
}

/// Retention settings for the stores layered on kernel storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    /// Keep the items of sealed spans. Span metadata is always kept.
    pub keep_transcripts: bool,
    /// Keep snapshot blobs after they are superseded.
    pub keep_snapshots: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            keep_transcripts: true,
            keep_snapshots: false,
        }
    }
}
