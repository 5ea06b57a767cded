use anyhow::Context;
use clap::Parser;
use portalloc_daemon::{db, router, AppState, MemoryAllocator, PortAllocator, SqliteAllocator};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Port allocation daemon for game server sessions")]
struct Args {
    /// SQLite database file (default: ~/.portalloc/allocations.db)
    #[arg(long, env = "PORTALLOC_DB")]
    db: Option<PathBuf>,

    /// Address to serve the HTTP API on
    #[arg(long, env = "PORTALLOC_LISTEN", default_value = "127.0.0.1:3030")]
    listen: SocketAddr,

    /// How long a write waits for another process holding the database lock
    #[arg(long, env = "PORTALLOC_BUSY_TIMEOUT_MS", default_value_t = db::DEFAULT_BUSY_TIMEOUT.as_millis() as u64)]
    busy_timeout_ms: u64,

    /// Keep allocations in memory only; nothing survives a restart
    #[arg(long, conflicts_with = "db")]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let allocator: Arc<dyn PortAllocator> = if args.memory {
        warn!("Using in-memory allocations; run a single instance only");
        Arc::new(MemoryAllocator::new())
    } else {
        let db_path = args.db.unwrap_or_else(db::default_db_path);
        info!("Using database: {}", db_path.display());

        let allocator = SqliteAllocator::open(&db_path, Duration::from_millis(args.busy_timeout_ms))
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        Arc::new(allocator)
    };

    let app = router(AppState::new(allocator));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Listening on {}", args.listen);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
