use anyhow::{Context, Result};
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use site_guard::config::Config;
use site_guard::kv_store::{KeyValueStore, MemoryStore, RedisStore};
use site_guard::mcp_integrity::McpIntegrityVerifier;
use site_guard::rate_limiter::RateLimiter;
use site_guard::reputation::StaticReputationList;
use site_guard::server::{self, AppState};
use site_guard::session::SessionManager;

#[derive(Parser)]
#[command(name = "site-guard")]
#[command(version)]
#[command(about = "Rate limiting, encrypted sessions and MCP verification for the site API", long_about = None)]
struct Args {
    /// Path to TOML configuration (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    config.apply_env_overrides();
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,site_guard=debug")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let store: Option<Arc<dyn KeyValueStore>> = match &config.store.url {
        Some(url) => {
            let timeout = Duration::from_millis(config.store.command_timeout_ms);
            let redis = RedisStore::connect(url, timeout)
                .await
                .context("Failed to connect to the key-value store")?;
            info!("Connected to Redis store");
            Some(Arc::new(redis) as Arc<dyn KeyValueStore>)
        }
        None => {
            warn!("No store configured: rate limits and sessions are local to this process");
            None
        }
    };

    let oracle = StaticReputationList::new(
        config.reputation.blocked.clone(),
        config.reputation.suspicious.clone(),
    );
    info!(
        "Reputation lists loaded ({} blocked, {} suspicious)",
        oracle.blocked_len(),
        oracle.suspicious_len()
    );

    let mut rate_limiter = RateLimiter::new(&config.rate_limit).with_oracle(Arc::new(oracle));
    if let Some(store) = &store {
        rate_limiter = rate_limiter.with_store(store.clone());
    }
    rate_limiter.start_cleanup_task();

    let session_store = match store {
        Some(store) => store,
        None => {
            warn!("Sessions are held in memory and lost on restart");
            Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>
        }
    };
    let sessions = Arc::new(
        SessionManager::from_settings(session_store, &config.session)
            .context("Session manager cannot start")?,
    );
    let cleanup_task = sessions
        .clone()
        .spawn_cleanup_task(Duration::from_secs(config.session.cleanup_interval_secs));

    let mcp = McpIntegrityVerifier::from_config(&config.mcp)
        .context("Failed to load MCP server registry")?;

    let state = Arc::new(AppState::new(&config, rate_limiter, sessions, mcp));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    info!("Starting site-guard on http://{}", addr);
    info!("Endpoints:");
    info!("  - GET    /health          - Health check (JSON)");
    info!("  - POST   /api/session     - Create session");
    info!("  - GET    /api/session     - Validate session");
    info!("  - DELETE /api/session     - Destroy session (CSRF)");
    info!("  - POST   /api/mcp/verify  - Verify MCP response");

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                server::handle_request(state.clone(), req)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        });

    server.await.context("Server error")?;

    cleanup_task.abort();
    info!("site-guard stopped");
    Ok(())
}
