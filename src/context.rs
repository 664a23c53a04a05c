//! Process-wide state
//!
//! Built once per binary from `Config`, passed explicitly to the API and to
//! workers, and torn down with `shutdown`.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{Config, StorageBackendType};
use crate::core::{DispatchQueue, Intake, JobOutcome, JobStore, StagedIntake};
use crate::database::{
    init_pool, migrations, InMemoryJobStore, InMemoryQueue, PgDispatchQueue, PgIntake,
    PgJobStore, PostgresPool,
};
use crate::error::{Error, Result};
use crate::registry::LanguageRegistry;
use crate::worker::Heartbeat;

/// Worker id recorded on jobs failed by housekeeping
const HOUSEKEEPING_WRITER: &str = "housekeeping";

/// Shared handles to the registry, store and queue
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<LanguageRegistry>,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchQueue>,
    /// Records and enqueues new jobs
    pub intake: Arc<dyn Intake>,
    /// Liveness of workers running in this process
    pub heartbeat: Heartbeat,
    pool: Option<PostgresPool>,
}

impl AppContext {
    /// Connect the configured storage backend and build the registry
    pub async fn init(config: Config) -> Result<Self> {
        let registry = LanguageRegistry::from_config(&config.sandbox)?;

        let context = match config.storage.backend {
            StorageBackendType::Memory => Self::in_memory_with(config, registry),
            StorageBackendType::Postgres => {
                let pg = config.storage.postgres.as_ref().ok_or_else(|| {
                    Error::Config("storage.backend is postgres but no postgres section is set".into())
                })?;

                let pool = init_pool(pg).await?;
                migrations::run(&pool).await?;

                let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
                let queue: Arc<dyn DispatchQueue> = Arc::new(PgDispatchQueue::new(
                    pool.clone(),
                    config.queue.visibility_timeout,
                    config.queue.poll_interval,
                ));

                AppContext {
                    config: Arc::new(config),
                    registry: Arc::new(registry),
                    store,
                    queue,
                    intake: Arc::new(PgIntake::new(pool.clone())),
                    heartbeat: Heartbeat::default(),
                    pool: Some(pool),
                }
            }
        };

        info!(
            storage = context.store.name(),
            queue = context.queue.name(),
            intake = context.intake.name(),
            languages = %context.registry.supported().join(","),
            "Application context ready"
        );

        Ok(context)
    }

    /// Single-process context over in-memory backends
    pub fn in_memory(config: Config) -> Result<Self> {
        let registry = LanguageRegistry::from_config(&config.sandbox)?;
        Ok(Self::in_memory_with(config, registry))
    }

    fn in_memory_with(config: Config, registry: LanguageRegistry) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let queue: Arc<dyn DispatchQueue> =
            Arc::new(InMemoryQueue::new(config.queue.visibility_timeout));
        AppContext {
            config: Arc::new(config),
            registry: Arc::new(registry),
            intake: Arc::new(StagedIntake::new(store.clone(), queue.clone())),
            store,
            queue,
            heartbeat: Heartbeat::default(),
            pool: None,
        }
    }

    /// True when other processes can see the same store and queue
    pub fn is_shared(&self) -> bool {
        self.pool.is_some()
    }

    /// Delete jobs older than the retention window
    pub async fn purge_expired(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.storage.retention)
            .map_err(|e| Error::Config(format!("Invalid retention: {}", e)))?;
        let removed = self.store.purge_expired(Utc::now() - retention).await?;
        if removed > 0 {
            info!(removed, "Purged expired jobs");
        }
        Ok(removed)
    }

    /// Fail PENDING jobs older than `storage.orphan_grace` that have no
    /// queue message, so they cannot stay PENDING forever
    pub async fn fail_orphans(&self) -> Result<u64> {
        let grace = chrono::Duration::from_std(self.config.storage.orphan_grace)
            .map_err(|e| Error::Config(format!("Invalid orphan grace: {}", e)))?;

        let mut failed = 0;
        for id in self.store.pending_before(Utc::now() - grace).await? {
            if self.queue.contains(id).await? {
                continue;
            }
            let outcome = JobOutcome::infrastructure("job was never queued");
            if self.store.complete(id, HOUSEKEEPING_WRITER, &outcome).await? {
                warn!(job_id = %id, "Failed orphaned job");
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Purge and sweep orphans on `storage.purge_interval` until `shutdown`
    /// flips to true
    pub async fn run_housekeeping(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.storage.purge_interval);

        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        warn!("Purge failed: {}", e);
                    }
                    if let Err(e) = self.fail_orphans().await {
                        warn!("Orphan sweep failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Release storage connections
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("Database pool closed");
        }
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
