use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a database file
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path of the database file
    pub path: PathBuf,

    /// Size of each memory mapped chunk; the file grows by this much (default: 64MB)
    pub chunk_size: usize,

    /// Flush the mapping to disk on every commit (default: false)
    pub sync_on_commit: bool,

    /// Encoded size at which a btree node splits (default: 4KB)
    pub max_node_size: usize,

    /// Number of decoded btree nodes kept in memory (default: 4096)
    pub node_cache_size: usize,

    /// Open transactions allowed before the oldest are aborted (default: 200)
    pub max_outstanding_transactions: usize,

    /// Age after which an open transaction is aborted (default: 20s)
    pub max_transaction_age: Duration,

    /// Worker threads used by the consistency checker
    pub check_threads: usize,

    /// Bad tables after which the checker stops early (default: 20)
    pub max_bad_tables: usize,

    /// Background maintenance configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to enforce the transaction limits (default: 1s)
    pub limit_interval: Duration,

    /// How often to flush the mapping to disk (default: 5s)
    pub force_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limit_interval: Duration::from_secs(1),
            force_interval: Duration::from_secs(5),
        }
    }
}

fn default_check_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4)
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cinder.db"),
            chunk_size: 64 * 1024 * 1024, // 64MB
            sync_on_commit: false,
            max_node_size: 4 * 1024,
            node_cache_size: 4096,
            max_outstanding_transactions: 200,
            max_transaction_age: Duration::from_secs(20),
            check_threads: default_check_threads(),
            max_bad_tables: 20,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl DbConfig {
    /// Create a new config for the given database file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Same settings for a different file
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Set the mapping chunk size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Flush to disk on every commit
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Set the btree node split size
    pub fn max_node_size(mut self, size: usize) -> Self {
        self.max_node_size = size;
        self
    }

    /// Set the node cache capacity
    pub fn node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    /// Set the maximum number of open transactions
    pub fn max_outstanding_transactions(mut self, max: usize) -> Self {
        self.max_outstanding_transactions = max;
        self
    }

    /// Set the maximum transaction age
    pub fn max_transaction_age(mut self, age: Duration) -> Self {
        self.max_transaction_age = age;
        self
    }

    /// Set the checker pool size
    pub fn check_threads(mut self, threads: usize) -> Self {
        self.check_threads = threads.max(1);
        self
    }

    /// Set the checker early-stop threshold
    pub fn max_bad_tables(mut self, max: usize) -> Self {
        self.max_bad_tables = max;
        self
    }

    /// Configure background maintenance
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set the transaction limit interval
    pub fn limit_interval(mut self, interval: Duration) -> Self {
        self.limit_interval = interval;
        self
    }

    /// Set the force interval
    pub fn force_interval(mut self, interval: Duration) -> Self {
        self.force_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.path, PathBuf::from("./cinder.db"));
        assert_eq!(config.chunk_size, 64 * 1024 * 1024);
        assert!(!config.sync_on_commit);
        assert_eq!(config.max_node_size, 4096);
        assert_eq!(config.max_outstanding_transactions, 200);
        assert_eq!(config.max_transaction_age, Duration::from_secs(20));
        assert!(config.check_threads >= 1 && config.check_threads <= 8);
        assert_eq!(config.max_bad_tables, 20);

        assert_eq!(config.scheduler.limit_interval, Duration::from_secs(1));
        assert_eq!(config.scheduler.force_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .chunk_size(1024 * 1024)
            .sync_on_commit(true)
            .max_node_size(512)
            .node_cache_size(16)
            .max_outstanding_transactions(3)
            .max_transaction_age(Duration::from_millis(250))
            .check_threads(0)
            .max_bad_tables(2)
            .scheduler(
                SchedulerConfig::default()
                    .limit_interval(Duration::from_millis(10))
                    .force_interval(Duration::from_millis(20)),
            );

        assert_eq!(config.path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert!(config.sync_on_commit);
        assert_eq!(config.max_node_size, 512);
        assert_eq!(config.node_cache_size, 16);
        assert_eq!(config.max_outstanding_transactions, 3);
        assert_eq!(config.max_transaction_age, Duration::from_millis(250));
        // clamped to at least one worker
        assert_eq!(config.check_threads, 1);
        assert_eq!(config.max_bad_tables, 2);

        assert_eq!(config.scheduler.limit_interval, Duration::from_millis(10));
        assert_eq!(config.scheduler.force_interval, Duration::from_millis(20));
    }

    #[test]
    fn test_with_path_keeps_settings() {
        let config = DbConfig::new("/tmp/a.db").chunk_size(4096);
        let other = config.with_path("/tmp/b.db");
        assert_eq!(other.path, PathBuf::from("/tmp/b.db"));
        assert_eq!(other.chunk_size, 4096);
    }
}
