use std::net::SocketAddr;
use std::sync::Arc;

use cadence_core::config::{CacheKind, CadenceConfig, DatabaseBackend, PersistencePolicy};
use cadence_scheduler::{CacheOptions, JobCache, JobDb, MemoryJobDb, SqliteJobDb};
use clap::Parser;
use tracing::{error, info, warn};

mod app;
mod http;

/// Cadence job scheduler.
#[derive(Debug, Parser)]
#[command(name = "cadence", version, about = "ISO-8601 job scheduler with an HTTP admin API")]
struct Args {
    /// Config file (default: ~/.cadence/cadence.toml)
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Address to bind the admin API to
    #[arg(long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database file; ":memory:" keeps jobs in process memory only
    #[arg(long)]
    db: Option<String>,

    /// Job map implementation
    #[arg(long, value_parser = parse_cache_kind)]
    cache: Option<CacheKind>,

    /// Seconds between persistence sweeps
    #[arg(long)]
    persist_interval: Option<u64>,

    /// Write every change to the database before acknowledging it
    #[arg(long)]
    transactional: bool,
}

fn parse_cache_kind(s: &str) -> Result<CacheKind, String> {
    match s {
        "locked" => Ok(CacheKind::Locked),
        "lock-free" | "lockfree" => Ok(CacheKind::LockFree),
        other => Err(format!("unknown cache kind {other:?} (expected locked or lock-free)")),
    }
}

impl Args {
    fn apply(&self, config: &mut CadenceConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        match self.db.as_deref() {
            Some(":memory:") => config.database.backend = DatabaseBackend::Memory,
            Some(path) => {
                config.database.backend = DatabaseBackend::Sqlite;
                config.database.path = path.to_string();
            }
            None => {}
        }
        if let Some(kind) = self.cache {
            config.cache.kind = kind;
        }
        if let Some(secs) = self.persist_interval {
            config.cache.persist_interval_secs = secs;
        }
        if self.transactional {
            config.cache.persistence = PersistencePolicy::Transactional;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_gateway=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();

    // explicit path > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let mut config = CadenceConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });
    args.apply(&mut config);
    config.validate()?;

    let db: Arc<dyn JobDb> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!(path = %config.database.path, "opening SQLite job store");
            Arc::new(SqliteJobDb::open(&config.database.path)?)
        }
        DatabaseBackend::Memory => {
            warn!("using the in-memory job store; jobs are lost on exit");
            Arc::new(MemoryJobDb::new())
        }
    };

    let cache = JobCache::with_system_clock(db, CacheOptions::from_config(&config));
    cache.start()?;
    info!(
        jobs = cache.len(),
        kind = ?config.cache.kind,
        persistence = ?config.cache.persistence,
        "scheduler running"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, Arc::clone(&cache)));
    let router = app::build_router(state);

    info!("Cadence listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = cache.shutdown().await {
        error!(error = %e, "jobs could not all be saved on shutdown");
    }
    Ok(())
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
