use std::{io::Write as _, net::SocketAddr, net::TcpStream, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{info, warn};

mod api;
mod bandit;
mod canary;
mod classifier;
mod clock;
mod config;
mod domain;
mod error;
mod escalation;
mod executor;
mod features;
mod kv;
mod metrics;
mod queue;
mod router;
mod session;
mod traffic;

pub use config::Config;
pub use error::AppError;
pub use traffic::TrafficLog;

use bandit::Bandit;
use canary::CanaryManager;
use clock::{Clock, SystemClock};
use executor::{MockTierExecutor, TierExecutor};
use features::FeatureExtractor;
use kv::{InMemoryKvStore, KvStore};
use metrics::MetricsRegistry;
use queue::OutboundQueueManager;
use router::RouterOrchestrator;
use session::SessionManager;

/// Shared application state handed to every HTTP handler and middleware.
///
/// Owns the Router Orchestrator and Session Manager (themselves composed of
/// the Feature Extractor, Classifier, Bandit, Escalation Policy, Canary
/// Manager, and Outbound Queue Manager) plus the ambient HTTP-layer concerns:
/// the live config, the traffic log, the rate limiter, and the admin token.
pub struct AppState {
    pub config: RwLock<Arc<Config>>,
    pub config_path: PathBuf,
    pub orchestrator: Arc<RouterOrchestrator>,
    pub sessions: Arc<SessionManager>,
    pub traffic: Arc<TrafficLog>,
    pub tier_executor: Arc<dyn TierExecutor>,
    pub admin_token: Option<String>,
    pub rate_limiter: Option<api::rate_limit::RateLimiter>,
}

impl AppState {
    async fn apply_tenant_overlays(&self, config: &Config) {
        if let Some(floor) = config.bandit.exploration_floor_override {
            self.orchestrator.bandit().set_exploration_floor(floor);
        }
        for tenant_id in config.tenants.keys() {
            self.orchestrator
                .set_tenant_policy(tenant_id, config.escalation_policy_for(tenant_id));
            self.sessions
                .set_tenant_policy(tenant_id, config.backpressure_policy_for(tenant_id));
            if let Some(canary) = config.canary_config_for(tenant_id) {
                self.orchestrator.canary().set_config(tenant_id, canary);
            }
        }
    }

    async fn replace_config(&self, new_config: Arc<Config>) {
        self.sessions.set_session_config(new_config.session).await;
        self.apply_tenant_overlays(&new_config).await;
        *self.config.write().await = new_config;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /healthz and exit immediately.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_router=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("TENANT_ROUTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/tenant-router/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        "tenant-router starting"
    );

    let admin_token = config
        .gateway
        .admin_token_env
        .as_ref()
        .and_then(|var| std::env::var(var).ok());

    let rate_limiter = config.gateway.rate_limit_rpm.map(api::rate_limit::RateLimiter::new);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let metrics = MetricsRegistry::install().context("failed to install metrics recorder")?;

    let orchestrator = Arc::new(RouterOrchestrator::new(
        FeatureExtractor::new(kv.clone(), clock.clone()),
        Bandit::new(kv.clone(), clock.clone()),
        CanaryManager::new(clock.clone()),
        metrics.clone(),
        clock.clone(),
    ));

    let queues = Arc::new(OutboundQueueManager::new(kv.clone(), clock.clone(), metrics.clone()));
    let (sessions, mut app_frames) = SessionManager::new(queues, clock.clone(), metrics.clone());
    let sessions = Arc::new(sessions);
    tokio::spawn(async move {
        // Application-level inbound frames have nowhere to go until a real
        // tier-execution integration is wired in; drain so the channel never
        // backs up.
        while let Some(frame) = app_frames.recv().await {
            tracing::debug!(connection_id = %frame.connection_id, tenant_id = %frame.tenant_id, "received app frame");
        }
    });

    let traffic_log = Arc::new(TrafficLog::new(config.gateway.traffic_log_capacity));
    let tier_executor: Arc<dyn TierExecutor> = Arc::new(MockTierExecutor::always_succeeds());

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        config: RwLock::new(config.clone()),
        config_path: config_path.clone(),
        orchestrator,
        sessions,
        traffic: traffic_log,
        tier_executor,
        admin_token,
        rate_limiter,
    });
    state.sessions.set_session_config(config.session).await;
    state.apply_tenant_overlays(&config).await;

    tokio::spawn(config_watcher(Arc::clone(&state)));

    let client_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.client_port).parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.admin_port).parse()?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::admin_auth::admin_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz over a raw socket, exit 0 on 200,
/// 1 otherwise. Invoked via `tenant-router --healthcheck` from a container
/// HEALTHCHECK directive. Uses a plain TCP socket rather than an HTTP client
/// crate, since this is the only place in the binary that would need one.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("TENANT_ROUTER_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let ok = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).context("connecting to client port")?;
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        stream.write_all(
            format!("GET /healthz HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n").as_bytes(),
        )?;

        let mut response = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut response)?;
        let status_line = String::from_utf8_lossy(&response);
        Ok(status_line.starts_with("HTTP/1.1 200") || status_line.starts_with("HTTP/1.0 200"))
    })
    .await??;

    if ok {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` for change detection. Parse/validation
/// failures are logged and ignored; the running config is unchanged.
async fn config_watcher(state: Arc<AppState>) {
    let path = &state.config_path;

    let mut last_mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(path) {
            Ok(new_config) => {
                state.replace_config(Arc::new(new_config)).await;
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed, keeping previous config");
            }
        }
    }
}
