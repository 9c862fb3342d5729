//! Periodic maintenance of an open database on a tokio runtime.
//!
//! Nothing in the database needs a runtime; a [`Scheduler`] is opt-in. Each
//! registered task gets its own timer loop, and [`Scheduler::shutdown`] stops
//! them all and waits for any run in progress.

mod tasks;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use tasks::{ForceTask, TransactionLimitTask};

use crate::config::DbConfig;
use crate::database::Database;
use crate::error::{Error, Result};

/// Work run against a database on a fixed interval.
#[async_trait::async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Time between runs; the first run happens one interval after
    /// registration.
    fn interval(&self, config: &DbConfig) -> Duration;

    async fn execute(&self, db: &Database) -> Result<()>;
}

/// Run counters of one registered task.
#[derive(Debug, Default)]
pub struct TaskStats {
    runs: AtomicU64,
    failures: AtomicU64,
}

impl TaskStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct Running {
    name: &'static str,
    stats: Arc<TaskStats>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    db: Database,
    tasks: Mutex<Vec<Running>>,
    stop: watch::Sender<bool>,
}

impl Scheduler {
    /// An empty scheduler for `db`.
    pub fn new(db: &Database) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            db: db.clone(),
            tasks: Mutex::new(Vec::new()),
            stop,
        }
    }

    /// A scheduler running the transaction limit and force tasks for `db`
    /// at the intervals of its config. Must be called inside a runtime.
    pub fn for_database(db: &Database) -> Result<Self> {
        let scheduler = Self::new(db);
        scheduler.register(Arc::new(TransactionLimitTask))?;
        scheduler.register(Arc::new(ForceTask))?;
        tracing::info!(path = %db.path().display(), "maintenance tasks started");
        Ok(scheduler)
    }

    /// Starts running `task`, returning its counters.
    pub fn register<T: MaintenanceTask + 'static>(&self, task: Arc<T>) -> Result<Arc<TaskStats>> {
        let stats = Arc::new(TaskStats::default());
        let name = task.name();
        let handle = self.spawn_loop(task, stats.clone());
        self.tasks.lock()?.push(Running {
            name,
            stats: stats.clone(),
            handle,
        });
        Ok(stats)
    }

    /// Counters of the first task registered under `name`
    pub fn stats(&self, name: &str) -> Result<Option<Arc<TaskStats>>> {
        Ok(self
            .tasks
            .lock()?
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.stats.clone()))
    }

    fn spawn_loop<T: MaintenanceTask + 'static>(&self, task: Arc<T>, stats: Arc<TaskStats>) -> JoinHandle<()> {
        let db = self.db.clone();
        let period = task.interval(db.config());
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let run = stats.runs.fetch_add(1, Ordering::Relaxed) + 1;
                        if let Err(e) = task.execute(&db).await {
                            stats.failures.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(task = task.name(), run, error = %e, "maintenance task failed");
                        }
                    }
                    // a dropped scheduler also ends the loop
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!(task = task.name(), "maintenance task stopped");
        })
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock()?.drain(..).collect();
        for task in tasks {
            task.handle
                .await
                .map_err(|e| Error::InvalidState(format!("{} task failed to stop: {}", task.name, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        seen: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl MaintenanceTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self, _config: &DbConfig) -> Duration {
            Duration::from_millis(10)
        }

        async fn execute(&self, db: &Database) -> Result<()> {
            db.size();
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState("always fails".into()));
            }
            Ok(())
        }
    }

    fn counting(fail: bool) -> (Arc<Counting>, Arc<AtomicUsize>) {
        let seen = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(Counting {
            seen: seen.clone(),
            fail,
        });
        (task, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let scheduler = Scheduler::new(&db);
        let (task, seen) = counting(false);
        let stats = scheduler.register(task)?;

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!((4..=5).contains(&seen.load(Ordering::SeqCst)));
        assert_eq!(stats.runs(), seen.load(Ordering::SeqCst) as u64);
        assert_eq!(stats.failures(), 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let scheduler = Scheduler::new(&db);
        let (task, _) = counting(true);
        scheduler.register(task)?;

        tokio::time::sleep(Duration::from_millis(35)).await;
        let stats = scheduler.stats("counting")?;
        assert!(stats.is_some_and(|s| s.failures() >= 2 && s.failures() == s.runs()));
        assert!(scheduler.stats("missing")?.is_none());
        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_runs() -> Result<()> {
        let db = Database::memory(DbConfig::default())?;
        let scheduler = Scheduler::new(&db);
        let (task, seen) = counting(false);
        scheduler.register(task)?;

        tokio::time::sleep(Duration::from_millis(25)).await;
        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_millis(100));

        let before = seen.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(seen.load(Ordering::SeqCst), before);
        Ok(())
    }
}
