//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Task service (submission and user operations)
//! - Worker pool (queue consumer)
//! - Polling supervisor (resumed remote tasks)
//! - Accounting engine (charges and refunds)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Open backends (PostgreSQL/Redis when configured, memory otherwise)
//! 3. Register executors
//! 4. Start the polling supervisor and recover stuck tasks
//! 5. Start the worker pool
//! 6. Graceful shutdown on SIGINT

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use broker_accounting::AccountingEngine;
use broker_exec::{
    ExecutorRegistry, HookRegistry, LocalDirUploader, PollTiming, RemoteApiExecutor,
    SimulatedExecutor, Uploader, VendorExecutor, REMOTE_API, SIMULATED, VENDOR_API,
};
use broker_kv::{Cache, MemoryCache, MemoryQueue, TaskQueue};
use broker_ledger::LedgerSigner;
use broker_store::{MemoryStore, Store};

use crate::config::Config;
use crate::error::DaemonResult;
use crate::outcome::Outcomes;
use crate::poller::{PollerHandle, PollingSupervisor};
use crate::recovery::{recover_stuck_tasks, RecoveryReport};
use crate::submission::TaskService;
use crate::worker::WorkerPool;

// =============================================================================
// Daemon
// =============================================================================

/// The broker daemon, wired but not yet running.
pub struct Daemon {
    config: Config,
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    accounting: Arc<AccountingEngine>,
    executors: Arc<ExecutorRegistry>,
    hooks: Arc<HookRegistry>,
}

impl Daemon {
    /// Create a daemon on in-memory backends (for testing/development).
    pub fn in_memory(config: Config) -> Self {
        Self::with_backends(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    /// Open the backends named by the configuration.
    ///
    /// `DATABASE_URL` needs the `postgres` feature and `REDIS_URL` the
    /// `redis` feature; without them the in-memory backends are used.
    pub async fn connect(config: Config) -> DaemonResult<Self> {
        let store = open_store(&config).await?;
        let (queue, cache) = open_kv(&config).await?;
        Ok(Self::with_backends(config, store, queue, cache))
    }

    /// Create a daemon on the given backends and register the built-in
    /// executors.
    pub fn with_backends(
        config: Config,
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        let signer = LedgerSigner::from_secret(Some(&config.jwt_secret));
        let accounting = Arc::new(AccountingEngine::new(store.clone(), cache, signer));
        let uploader: Arc<dyn Uploader> = Arc::new(LocalDirUploader::new(
            config.storage.upload_dir.clone(),
            config.storage.public_base.clone(),
        ));
        let executors = Arc::new(ExecutorRegistry::new());
        register_builtin_executors(&executors, &config, &store, uploader);

        Self { config, store, queue, accounting, executors, hooks: Arc::new(HookRegistry::new()) }
    }

    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Task store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Task queue.
    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Accounting engine.
    pub fn accounting(&self) -> &Arc<AccountingEngine> {
        &self.accounting
    }

    /// Executor registry; register custom executors before [`start`](Self::start).
    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    /// After-execution hooks.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Start the supervisor, recover stuck tasks and start the worker pool.
    pub async fn start(&self) -> DaemonResult<RunningDaemon> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            executors = ?self.executors.names(),
            "Starting broker daemon"
        );

        let shutdown = CancellationToken::new();
        let outcomes = Arc::new(Outcomes::new(
            self.store.clone(),
            self.accounting.clone(),
            self.queue.clone(),
            self.hooks.clone(),
            self.config.storage.public_base.clone(),
        ));

        // 1. Polling supervisor
        let (supervisor, poller) = PollingSupervisor::new(
            self.store.clone(),
            self.executors.clone(),
            outcomes.clone(),
            self.config.worker.poll_interval,
            self.config.worker.poll_retry_budget,
        );
        let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

        // 2. Recovery
        let recovery =
            match recover_stuck_tasks(self.store.as_ref(), self.queue.as_ref(), &poller).await {
                Ok(report) => report,
                Err(e) => {
                    shutdown.cancel();
                    return Err(e);
                },
            };

        // 3. Worker pool
        let pool = Arc::new(WorkerPool::new(
            self.store.clone(),
            self.queue.clone(),
            self.executors.clone(),
            outcomes,
            self.config.worker.concurrency,
        ));
        let pool_task = tokio::spawn(pool.run(shutdown.clone()));

        let tasks = Arc::new(
            TaskService::new(
                self.store.clone(),
                self.accounting.clone(),
                self.queue.clone(),
                self.config.auto_audit,
            )
            .with_poller(poller.clone()),
        );

        Ok(RunningDaemon {
            tasks,
            poller,
            recovery,
            shutdown,
            background: vec![supervisor_task, pool_task],
        })
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT).
    pub async fn run(self) -> DaemonResult<()> {
        let running = self.start().await?;
        info!("Daemon running");

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Received shutdown signal");
            }
            _ = running.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        running.shutdown().await;
        Ok(())
    }
}

// =============================================================================
// Running daemon
// =============================================================================

/// Handle on a started daemon.
pub struct RunningDaemon {
    tasks: Arc<TaskService>,
    poller: PollerHandle,
    recovery: RecoveryReport,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl RunningDaemon {
    /// Submission and task operations.
    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.tasks
    }

    /// Polling supervisor.
    pub fn poller(&self) -> &PollerHandle {
        &self.poller
    }

    /// What startup recovery did.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop the worker pool and the supervisor and wait for them.
    pub async fn shutdown(self) {
        info!("Shutting down daemon");
        self.shutdown.cancel();
        for handle in self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Daemon shutdown complete");
    }
}

fn register_builtin_executors(
    executors: &ExecutorRegistry,
    config: &Config,
    store: &Arc<dyn Store>,
    uploader: Arc<dyn Uploader>,
) {
    let mut vendor = VendorExecutor::new(uploader.clone(), config.vendor.api_key.clone())
        .with_store(store.clone())
        .with_timing(PollTiming::vendor());
    if let Some(url) = &config.vendor.default_query_url {
        vendor = vendor.with_default_query_url(url.clone());
    }
    executors.register(VENDOR_API, Arc::new(vendor));

    let remote_api = RemoteApiExecutor::new(uploader, config.vendor.api_key.clone())
        .with_store(store.clone())
        .with_timing(PollTiming::remote_api());
    executors.register(REMOTE_API, Arc::new(remote_api));

    executors.register(SIMULATED, Arc::new(SimulatedExecutor::new(config.worker.simulated_delay)));
}

// =============================================================================
// Backends
// =============================================================================

#[cfg(feature = "postgres")]
async fn open_store(config: &Config) -> DaemonResult<Arc<dyn Store>> {
    match &config.backends.database_url {
        Some(url) => {
            use crate::error::DaemonError;

            let store = broker_store::PgStore::connect(url).await?;
            broker_db::migrate(store.pool())
                .await
                .map_err(|e| DaemonError::Config(format!("Failed to run migrations: {}", e)))?;
            broker_db::status(store.pool())
                .await
                .map_err(|e| DaemonError::Config(format!("Database not ready: {}", e)))?;
            if let Some(admin) = &config.backends.admin {
                broker_db::init_admin_account(store.pool(), &admin.username, &admin.password)
                    .await
                    .map_err(|e| DaemonError::Config(format!("Failed to seed administrator: {}", e)))?;
            }
            info!("Using PostgreSQL store");
            Ok(Arc::new(store))
        },
        None => {
            info!("DATABASE_URL not set, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        },
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(config: &Config) -> DaemonResult<Arc<dyn Store>> {
    if config.backends.database_url.is_some() {
        warn!("DATABASE_URL ignored: built without the postgres feature");
    }
    info!("Using in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}

#[cfg(feature = "redis")]
async fn open_kv(config: &Config) -> DaemonResult<(Arc<dyn TaskQueue>, Arc<dyn Cache>)> {
    match &config.backends.redis_url {
        Some(url) => {
            let queue = broker_kv::RedisQueue::connect(url).await?;
            let cache = broker_kv::RedisCache::connect(url).await?;
            info!("Using Redis queue and cache");
            Ok((Arc::new(queue), Arc::new(cache)))
        },
        None => {
            info!("REDIS_URL not set, using in-memory queue and cache");
            Ok((Arc::new(MemoryQueue::new()), Arc::new(MemoryCache::new())))
        },
    }
}

#[cfg(not(feature = "redis"))]
async fn open_kv(config: &Config) -> DaemonResult<(Arc<dyn TaskQueue>, Arc<dyn Cache>)> {
    if config.backends.redis_url.is_some() {
        warn!("REDIS_URL ignored: built without the redis feature");
    }
    info!("Using in-memory queue and cache");
    Ok((Arc::new(MemoryQueue::new()), Arc::new(MemoryCache::new())))
}

// =============================================================================
// Tests
// =============================================================================
