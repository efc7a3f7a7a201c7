use crate::{config, server};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. Listen addresses fall back to the
/// configuration file (which itself honours the `PORT` environment
/// variable).
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Gateway lifecycle: init → connect → spawn loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration + state. State construction connects to the
    // store, acquires this node's id, and creates the stream group — all of
    // which must succeed before traffic is accepted.
    let config = config::GatewayConfig::load(&args.config_path)?;
    let listen = args
        .listen
        .unwrap_or_else(|| config.server.listen.clone());
    let admin_listen = args
        .admin_listen
        .unwrap_or_else(|| config.server.admin_listen.clone());

    let state = server::GatewayState::new(config).await?;
    tracing::info!("server: node initialized, node_id={}", state.pool.node_id());

    // Phase 2: background loops — worker-pool scaling and the admin server.
    let shutdown = Arc::new(Notify::new());
    start_worker_pool(&state, &shutdown);
    start_admin_server(&state, &admin_listen);

    // Phase 3: the proxy server.
    tracing::info!("server: starting gateway, listen={}", listen);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 4: block until signal, then clean up. The pool stops its
    // workers, removes their consumers, and returns the node id.
    wait_for_shutdown(&shutdown).await;

    state.pool.shutdown().await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_worker_pool(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    let pool = state.pool.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        pool.run(shutdown).await;
    });
}

fn start_admin_server(state: &server::GatewayState, admin_listen: &str) {
    let state = state.clone();
    let admin_addr = admin_listen.to_string();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
