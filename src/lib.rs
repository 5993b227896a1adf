pub mod config;
pub mod core;
pub mod error;
pub mod ipc;
pub mod services;
pub mod tracker;

use std::sync::Arc;

use anyhow::Context;

use crate::config::HelperConfig;
use crate::core::secret::SecretStore;
use crate::ipc::HelperState;
use crate::services::BackgroundServices;

/// Run the helper until interrupted.
pub fn run() -> anyhow::Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in NetGuard helper: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netguard_helper=info".into()),
        )
        .init();

    let config = HelperConfig::from_env();
    let secret = SecretStore::load_or_create(&config.secret_file)?;

    // Connection tracking is best effort; the IPC surface still answers
    // with empty stats when the backend cannot start.
    let tracker = tracker::create_tracker();
    match tracker.start() {
        Ok(()) => tracing::info!("NetGuard helper monitoring started ({})", tracker.name()),
        Err(e) => tracing::warn!("Connection tracking unavailable: {e:#}. Serving empty stats."),
    }

    let state = Arc::new(HelperState::new(config, secret, Arc::clone(&tracker)));
    let services = BackgroundServices::start(&state)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netguard-ipc")
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(async {
        tokio::select! {
            res = ipc::serve(Arc::clone(&state)) => res,
            res = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, shutting down");
                res.context("failed to listen for ctrl-c")
            }
        }
    });

    services.stop();
    tracker.stop();
    state.sessions.clear();
    tracing::info!("NetGuard helper stopped");
    result
}
