use std::time::Duration;

use super::MaintenanceTask;
use crate::config::DbConfig;
use crate::database::Database;
use crate::error::{Error, Result};

/// Aborts transactions past the configured count or age.
pub struct TransactionLimitTask;

#[async_trait::async_trait]
impl MaintenanceTask for TransactionLimitTask {
    fn name(&self) -> &'static str {
        "transaction-limit"
    }

    fn interval(&self, config: &DbConfig) -> Duration {
        config.scheduler.limit_interval
    }

    async fn execute(&self, db: &Database) -> Result<()> {
        db.limit_outstanding_transactions()?;
        Ok(())
    }
}

/// Flushes the mapped log to disk on the blocking pool.
pub struct ForceTask;

#[async_trait::async_trait]
impl MaintenanceTask for ForceTask {
    fn name(&self) -> &'static str {
        "force"
    }

    fn interval(&self, config: &DbConfig) -> Duration {
        config.scheduler.force_interval
    }

    async fn execute(&self, db: &Database) -> Result<()> {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.force())
            .await
            .map_err(|e| Error::InvalidState(format!("force panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use crate::tran::TranRead;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_limit_task_aborts_old_transactions() -> Result<()> {
        let config = DbConfig::default()
            .max_outstanding_transactions(10)
            .max_transaction_age(Duration::from_millis(1));
        let db = Database::memory(config)?;
        let tran = db.read_transaction()?;
        std::thread::sleep(Duration::from_millis(5));

        TransactionLimitTask.execute(&db).await?;
        assert_eq!(db.outstanding_transactions(), 0);
        assert!(matches!(tran.state(), Err(Error::TransactionAborted(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_force_task_on_file() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(DbConfig::new(dir.path().join("force.db")).chunk_size(64 * 1024))?;
        ForceTask.execute(&db).await?;
        db.close()?;

        // a closed database reports the failure back to the scheduler
        assert!(ForceTask.execute(&db).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_for_database() -> Result<()> {
        let mut config = DbConfig::default().max_transaction_age(Duration::from_millis(1));
        config.scheduler = SchedulerConfig {
            limit_interval: Duration::from_millis(5),
            force_interval: Duration::from_millis(5),
        };
        let db = Database::memory(config)?;
        let scheduler = Scheduler::for_database(&db)?;
        let _tran = db.read_transaction()?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.outstanding_transactions(), 0);
        let limit = scheduler.stats("transaction-limit")?;
        assert!(limit.is_some_and(|s| s.runs() > 0));
        scheduler.shutdown().await?;
        Ok(())
    }
}
