//! Broker Daemon
//!
//! Runs the worker pool and the polling supervisor.
//!
//! # Usage
//!
//! ```bash
//! # Start with in-memory backends
//! cargo run -p brokerd
//!
//! # Start against PostgreSQL and Redis
//! DATABASE_URL=postgres://... REDIS_URL=redis://... \
//!     cargo run -p brokerd --features postgres,redis
//! ```
//!
//! # Environment Variables
//!
//! - `BROKER_ENV`: Environment (test, development, production)
//! - `AUTO_AUDIT`: Skip moderation for new tasks (default: false)
//! - `JWT_SECRET`: Ledger HMAC key
//! - `JIEKOU_API`, `JIEKOU_QUERY_URL`: Provider token and default result endpoint
//! - `UPLOAD_DIR`, `UPLOAD_PUBLIC_BASE`: Local artifact storage
//! - `WORKER_CONCURRENCY`: Max concurrent tasks (default: 16)
//! - `POLL_INTERVAL_SECS`: Supervisor tick (default: 30)
//! - `POLL_RETRY_BUDGET`: Failed polls tolerated per task (default: 5)
//! - `SIMULATED_DELAY_MS`: Run time of the `simulated` executor (default: 2000)
//! - `DATABASE_URL`, `REDIS_URL`: Durable backends
//! - `ADMIN_USERNAME`, `ADMIN_PASSWORD`: Administrator seeded on an empty database
//! - `LOG_LEVEL`: Filter directive overriding `RUST_LOG`
//! - `LOG_FORMAT`: `json` for JSON lines

use brokerd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may carry LOG_LEVEL/LOG_FORMAT, so load it before tracing
    let _ = dotenvy::dotenv();

    // Initialize tracing
    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => EnvFilter::try_new(level.trim())?,
        _ => EnvFilter::from_default_env().add_directive("brokerd=info".parse()?),
    };
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        auto_audit = config.auto_audit,
        concurrency = config.worker.concurrency,
        "Broker daemon"
    );

    // Create and run daemon
    let daemon = Daemon::connect(config).await?;
    daemon.run().await?;

    Ok(())
}
