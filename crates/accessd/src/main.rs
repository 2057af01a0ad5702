use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod enrollment;
mod protocol;
mod reconciler;
mod router;
mod session;
mod store;

use config::Config;
use enrollment::EnrollmentController;
use reconciler::Reconciler;
use session::SessionRegistry;
use store::{Repository, SqliteRepository};

/// Bounded window given to connected devices to receive the `cleanuser`/
/// `cleanlog` shutdown frames before the transport is torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shared state reachable by every WebSocket session handler.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Repository>,
    pub engine: engine::EngineHandle,
    pub sessions: Arc<SessionRegistry>,
    pub enrollment: Arc<EnrollmentController>,
}

#[derive(Parser)]
#[command(name = "accessd", about = "Biometric access-control daemon")]
struct Cli {
    /// Listen port; overrides ACCESSD_PORT when given.
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env(cli.port);
    tracing::info!(port = config.port, db_path = %config.db_path.display(), "accessd starting");

    let store: Arc<dyn Repository> = Arc::new(
        SqliteRepository::open(&config.db_path)
            .await
            .context("failed to open store")?,
    );

    let engine = engine::spawn_engine(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
        &config.antispoof_model_path(),
        config.liveness_threshold,
    )
    .context("failed to start recognition engine")?;

    load_gallery(&store, &engine).await.context("initial gallery load failed")?;

    let sessions = Arc::new(SessionRegistry::new());
    let enrollment = Arc::new(EnrollmentController::new(config.enrollment_timeout_secs));

    let reconciler = Arc::new(Reconciler::new(store.clone(), engine.clone()));
    let reconcile_interval = Duration::from_secs(config.reconcile_interval_secs);
    let reconciler_handle = reconciler.spawn(reconcile_interval);

    let state = Arc::new(AppState {
        config,
        store,
        engine,
        sessions: sessions.clone(),
        enrollment,
    });

    let app = axum::Router::new()
        .route("/ws", get(router::ws_handler))
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr, "accessd ready");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("accessd shutting down");

    let cleanuser = serde_json::json!({"cmd": "cleanuser"});
    let cleanlog = serde_json::json!({"cmd": "cleanlog"});
    sessions.broadcast_to_devices(&cleanuser);
    sessions.broadcast_to_devices(&cleanlog);

    // broadcast_to_devices only enqueues onto each session's outbox; give
    // the outbound tasks a bounded window to actually flush these frames
    // before the transport is torn down.
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    reconciler_handle.abort();
    server.abort();

    Ok(())
}

/// Populate the gallery from the store before accepting any connection,
/// mirroring the reconciler's addition step without the diff bookkeeping.
async fn load_gallery(store: &Arc<dyn Repository>, engine: &engine::EngineHandle) -> Result<()> {
    let snapshot = store.snapshot_active_face_users().await?;
    let mut entries = Vec::new();
    let mut users = std::collections::HashMap::new();

    for user in snapshot {
        let Some(row) = store.fetch_face_row(user.enroll_id).await? else {
            continue;
        };
        match engine.embed(&row.image, false).await {
            Ok(embedding) => {
                entries.push((user.enroll_id, embedding));
                users.insert(
                    user.enroll_id,
                    visage_core::UserInfo {
                        enroll_id: user.enroll_id,
                        name: row.name,
                        has_face: true,
                        is_active: row.is_active,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(enroll_id = user.enroll_id, error = %e, "initial gallery load: embed failed");
            }
        }
    }

    let loaded = entries.len();
    engine.gallery().load_all(entries, users);
    tracing::info!(loaded, "gallery loaded from store");
    Ok(())
}
