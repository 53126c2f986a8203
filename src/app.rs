//! Router assembly and server start-up.

use crate::config::ServerConfig;
use crate::db;
use crate::geo::DbIpClient;
use crate::handler::{self, AppState};
use crate::notifier::SmtpMailer;
use axum::http::HeaderValue;
use axum::{routing::post, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, warn};

/// Exact-match origin allow-list; any method and header, credentials allowed.
pub fn cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn build_router(state: AppState, origins: Vec<HeaderValue>) -> Router {
    Router::new()
        .route("/send-email", post(handler::send_email))
        .layer(cors(origins))
        .with_state(state)
}

pub async fn build_state(config: &ServerConfig) -> Result<AppState, Box<dyn std::error::Error + Send + Sync>> {
    let pool = db::connect(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    Ok(AppState {
        db: pool,
        mailer: Arc::new(SmtpMailer::new(Arc::new(config.mail.clone()))),
        geo: Arc::new(DbIpClient::new(&config.geo)?),
        template: config.mail.template.as_str().into(),
        utc_offset: config.utc_offset,
        tasks: TaskTracker::new(),
    })
}

pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = build_state(&config).await?;
    let tasks = state.tasks.clone();
    let app = build_router(state, config.origins.clone());

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Each delivery is bounded by the mail timeout already.
    drain_background_tasks(&tasks, config.mail.timeout + Duration::from_secs(5)).await;
    info!("Server stopped");
    Ok(())
}

/// Stops accepting background work and waits up to `limit` for what is left.
/// Returns false when some tasks were still running at the deadline.
pub async fn drain_background_tasks(tasks: &TaskTracker, limit: Duration) -> bool {
    tasks.close();
    if tasks.is_empty() {
        return true;
    }
    info!("Waiting for {} background task(s)", tasks.len());
    if tokio::time::timeout(limit, tasks.wait()).await.is_err() {
        warn!("{} background task(s) abandoned at shutdown", tasks.len());
        return false;
    }
    true
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
