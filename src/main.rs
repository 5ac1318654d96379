// Intercessio — daemon entry point.
// Wires the singletons (vault, key store, session store, policy registry,
// activity log, approval manager, session manager, control listener),
// restores persisted state, then serves the control socket until a
// shutdown request or SIGINT arrives.
//
// Exit codes: 0 on clean shutdown (including the already-running case),
// 1 on fatal startup failure.

use intercessio::atoms::error::DaemonResult;
use intercessio::control::{self, Daemon};
use intercessio::engine::activity::ActivityLog;
use intercessio::engine::approval::ApprovalManager;
use intercessio::engine::keys::KeyStore;
use intercessio::engine::manager::SessionManager;
use intercessio::engine::notify::Notifier;
use intercessio::engine::paths;
use intercessio::engine::store::SessionStore;
use intercessio::engine::vault::SecretVault;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("[daemon] Fatal startup failure: {e}");
            std::process::exit(1);
        }
    }
}

async fn run() -> DaemonResult<i32> {
    let config_dir = paths::config_dir();
    info!("[daemon] Config directory: {:?}", config_dir);

    // Singleton guard: a live daemon on the socket means we bow out.
    let socket_path = paths::socket_path();
    let Some(listener) = control::bind_socket(&socket_path).await? else {
        info!("[daemon] Another instance is already running — exiting");
        return Ok(0);
    };

    // ── Singletons, leaves first ─────────────────────────────────────
    let vault = Arc::new(SecretVault::open(&config_dir)?);
    let keys = Arc::new(KeyStore::open(&config_dir, Arc::clone(&vault)));
    let store = Arc::new(SessionStore::open(&paths::db_path())?);
    let notifier = Arc::new(Notifier::new());
    let activity = Arc::new(ActivityLog::new());
    let approvals = Arc::new(ApprovalManager::new(Arc::clone(&store), notifier));
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&keys),
        Arc::clone(&activity),
        Arc::clone(&approvals),
    ));

    // ── Boot restore: rows are authoritative ─────────────────────────
    approvals.restore_timers_on_boot()?;
    manager.restore_on_boot().await;
    info!(
        "[daemon] Restored {} running session(s)",
        manager.running_session_ids().len()
    );

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    let daemon = Arc::new(Daemon {
        store,
        keys,
        activity,
        approvals,
        manager: Arc::clone(&manager),
        shutdown: shutdown_tx,
    });

    let server = tokio::spawn(control::serve(listener, daemon));
    info!("[daemon] Ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[daemon] SIGINT received — shutting down");
        }
        _ = shutdown_rx.recv() => {
            info!("[daemon] Shutdown request received");
        }
    }

    // ── Graceful drain ───────────────────────────────────────────────
    manager.shutdown_all().await;
    server.abort();
    std::fs::remove_file(&socket_path).ok();
    info!("[daemon] Goodbye");
    Ok(0)
}
