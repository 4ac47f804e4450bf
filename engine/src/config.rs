use std::path::{Path, PathBuf};

/// Constructed programmatically by the embedding application and handed to
/// [`crate::engine::Engine::bootstrap`] — no config-file parser is in scope.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for `keys/`, `db/`, `mnemonic.enc`, `dht_identity.bin`
    /// and the `.identity_lock` file.
    pub data_dir: PathBuf,
    /// Lower/upper bound on the task-queue worker pool. Actual count is
    /// `min(max(cores + 4, min_workers), max_workers)`.
    pub min_workers: usize,
    pub max_workers: usize,
    /// Task queue ring capacity.
    pub task_queue_capacity: usize,
    /// Exponential backoff bounds for the Delivery Engine, in seconds.
    pub retry_base_backoff_secs: u64,
    pub retry_max_backoff_secs: u64,
    /// Age after which an undelivered outgoing message is marked `FAILED`.
    pub retry_staleness_secs: i64,
    /// Message Send Queue bound.
    pub send_queue_capacity: usize,
    /// Stabilization Coordinator's wait for `node_count() >= 2`.
    pub stabilization_timeout_secs: u64,
    /// Presence heartbeat period.
    pub heartbeat_period_secs: u64,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            min_workers: 4,
            max_workers: 16,
            task_queue_capacity: 256,
            retry_base_backoff_secs: 30,
            retry_max_backoff_secs: 3600,
            retry_staleness_secs: 30 * 24 * 3600,
            send_queue_capacity: 64,
            stabilization_timeout_secs: 15,
            heartbeat_period_secs: 240,
        }
    }

    pub fn worker_count(&self) -> usize {
        let cores = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        (cores + 4).clamp(self.min_workers, self.max_workers)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn mnemonic_path(&self) -> PathBuf {
        self.data_dir.join("mnemonic.enc")
    }

    pub fn dht_identity_path(&self) -> PathBuf {
        self.data_dir.join("dht_identity.bin")
    }

    pub fn identity_lock_path(&self) -> PathBuf {
        self.data_dir.join(".identity_lock")
    }

    pub fn db_path_for(&self, fingerprint: &str) -> PathBuf {
        self.db_dir().join(format!("{fingerprint}.sqlite"))
    }
}

/// Exponential backoff with base `base_secs` doubling each attempt, capped at
/// `max_secs` (spec §4.8).
pub fn backoff_secs(retry_count: u32, base_secs: u64, max_secs: u64) -> u64 {
    base_secs.saturating_mul(1u64 << retry_count.min(32)).min(max_secs)
}

pub fn is_valid_identity_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub fn path_exists(path: &Path) -> bool {
    path.exists()
}
