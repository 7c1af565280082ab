mod api;
mod bus;
mod chat;
mod config;
mod contacts;
mod error;
mod identity;
mod mesh;
mod permissions;
mod presence;
mod rate_limit;
mod session;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_store::Database;

use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::identity::TokenVerifier;
use crate::permissions::PermissionEngine;
use crate::presence::Presence;
use crate::rate_limit::RateLimiter;
use crate::state::{AppState, SessionRegistry};

/// How often the mesh re-syncs full presence with its peers.
const PRESENCE_HEARTBEAT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins; LOG_LEVEL is the documented knob for deployments
    // that only set simple levels.
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| std::env::var("LOG_LEVEL").ok().map(EnvFilter::new))
        .unwrap_or_else(|| EnvFilter::new("info,causerie_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Causerie v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env()?;
    info!(
        addr = %config.listen_addr(),
        store = %config.store_dsn.display(),
        bus_peers = config.bus_peers.len(),
        node = %config.node_id,
        "Loaded configuration"
    );

    let db = Database::open_at(&config.store_dsn)?;
    let seeded = db.seed_default_rules()?;
    if seeded > 0 {
        info!(rules = seeded, "Rule table was empty, defaults installed");
    }
    let db = Arc::new(tokio::sync::Mutex::new(db));

    let verifier = Arc::new(
        TokenVerifier::new(&config.identity_verifier_key).map_err(anyhow::Error::msg)?,
    );

    let bus = Arc::new(Bus::new(config.node_id.clone()));
    mesh::start(bus.clone(), config.bus_peers.clone(), PRESENCE_HEARTBEAT_SECS);

    let presence = Presence::new(bus.clone());
    let rate_limiter = RateLimiter::new(
        config.rate_limit_max,
        Duration::from_millis(config.rate_limit_window_ms),
    );

    let app_state = AppState {
        db: db.clone(),
        bus,
        presence: presence.clone(),
        sessions: Arc::new(SessionRegistry::new()),
        verifier,
        engine: PermissionEngine::new(config.rule_window),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // Typing keys expire after 10 s without a keystroke.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let purged = presence.purge_typing();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired typing keys");
            }
        }
    });

    // Rate limiter cleanup every 5 min, evict addresses idle >10 min.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(Duration::from_secs(600)).await;
        }
    });

    // Stale PENDING contact requests become EXPIRED hourly; reads already
    // treat them as expired, the sweep makes it durable.
    let sweep_db = db.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match sweep_db.lock().await.expire_stale_requests(chrono::Utc::now()) {
                Ok(expired) if expired > 0 => {
                    tracing::info!(expired, "Expired stale contact requests")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Contact request sweep failed"),
            }
        }
    });

    let addr = app_state.config.listen_addr();

    tokio::select! {
        result = api::serve(app_state, addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
