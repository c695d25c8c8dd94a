//! Parklane server entry point.
//!
//! Bootstraps Postgres (with migrations), the coordination store, the
//! spool, and the LNS client, then starts the Axum HTTP server with
//! graceful shutdown. The downlink dispatcher and the periodic jobs run
//! alongside the server and are cancelled on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use parklane_coord::{CoordStore, MemoryStore};
use parklane_core::spool::Spool;

use parklane_server::auth::auth_middleware;
use parklane_server::config::ServerConfig;
use parklane_server::lns::HttpLnsClient;
use parklane_server::metrics::Metrics;
use parklane_server::state::AppState;
use parklane_server::{dispatch, jobs, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(addr = %config.bind_addr, "parklane starting");

    let state = build_app_state(config).await?;

    // Shutdown signal channel shared by the server and all workers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = jobs::spawn_all(&state, &shutdown_rx);
    worker_handles.push(tokio::spawn(dispatch::run(
        Arc::clone(&state),
        shutdown_rx.clone(),
    )));

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", state.config.bind_addr))?;

    info!(addr = %state.config.bind_addr, "parklane listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for background workers to stop");
    for handle in worker_handles {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("parklane stopped");
    Ok(())
}

/// Build the shared application state.
async fn build_app_state(config: ServerConfig) -> anyhow::Result<Arc<AppState>> {
    // Pooled connections carry no per-request state: the repository
    // opens every statement inside a transaction that pins the RLS
    // scope (`parklane.tenant_id` / `parklane.bypass_rls`) via
    // transaction-local set_config. Run the app as a login role in
    // `parklane_app` (migration 0003) so it owns no tables.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("migrations applied");

    let coord: Arc<dyn CoordStore> = match &config.redis_url {
        #[cfg(feature = "redis-backend")]
        Some(url) => {
            info!("using Redis coordination store");
            Arc::new(
                parklane_coord::RedisStore::connect(url)
                    .await
                    .context("failed to connect to Redis")?,
            )
        }
        #[cfg(not(feature = "redis-backend"))]
        Some(_) => {
            anyhow::bail!("REDIS_URL set but feature 'redis-backend' is not enabled");
        }
        None => {
            info!("using in-memory coordination store");
            Arc::new(MemoryStore::new())
        }
    };

    let spool = Spool::open(&config.spool_dir)
        .await
        .context("failed to open spool directory")?;
    let recovered = spool.recover().await.context("spool recovery failed")?;
    if recovered > 0 {
        info!(recovered, "requeued spool envelopes from interrupted drain");
    }

    let lns = Arc::new(
        HttpLnsClient::new(&config.lns_base_url, &config.lns_api_token)
            .context("failed to build LNS client")?,
    );

    Ok(Arc::new(AppState {
        pool,
        coord,
        lns,
        spool,
        config,
        metrics: Metrics::default(),
    }))
}

/// Build the Axum router with all routes and middleware.
fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .merge(routes::auth::router())
        .merge(routes::spaces::router())
        .merge(routes::reservations::router())
        .merge(routes::orphans::router())
        .merge(routes::policy::router())
        .merge(routes::service_keys::router())
        .merge(routes::audit::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    // Login is brute-forceable; cap concurrent attempts.
    let public_auth = Router::new()
        .merge(routes::auth::public_router())
        .layer(tower::limit::ConcurrencyLimitLayer::new(16));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    Router::new()
        .merge(routes::webhook::router())
        .merge(routes::health::router())
        .merge(routes::metrics::router())
        .merge(public_auth)
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
