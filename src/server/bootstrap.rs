use crate::config::GatewayConfig;
use crate::registry::RegistryEvent;
use crate::server::{self, GatewayState};
use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. Listener flags override the
/// config file and environment.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Gateway lifecycle: init → load → background loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = GatewayConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.server.admin_listen = admin_listen;
    }
    let listen = config.server.listen.clone();
    let admin_listen = config.server.admin_listen.clone();

    let state = GatewayState::new(config, Some(args.config_path))?;
    let shutdown = CancellationToken::new();

    start_lease_monitor(&state, &shutdown);
    start_registry_event_listener(&state, &shutdown);
    start_admin_server(&state, admin_listen, &shutdown);

    tracing::info!("server: starting gateway, listen={}", listen);

    let proxy_handle = tokio::spawn({
        let router = state.router.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, router, shutdown).await }
    });

    tokio::select! {
        _ = wait_for_shutdown() => shutdown.cancel(),
        _ = shutdown.cancelled() => {}
    }

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
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

    // The writer must outlive every log call.
    std::mem::forget(guard);
}

fn start_lease_monitor(state: &GatewayState, shutdown: &CancellationToken) {
    let monitor = state.lease_monitor();
    let shutdown = shutdown.clone();
    tokio::spawn(async move { monitor.run(shutdown).await });
}

/// Drop per-instance latency state once an instance leaves the ledger.
fn start_registry_event_listener(state: &GatewayState, shutdown: &CancellationToken) {
    let mut events = state.ledger.subscribe();
    let lb = state.lb.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.cancelled() => return,
            };
            match event {
                Ok(RegistryEvent::Deregistered { service, instance_id })
                | Ok(RegistryEvent::Evicted { service, instance_id }) => {
                    lb.response_time().forget(&service, &instance_id);
                }
                Ok(RegistryEvent::Registered { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("registry: event listener lagged, skipped={}", skipped);
                }
                Err(RecvError::Closed) => return,
            }
        }
    });
}

fn start_admin_server(state: &GatewayState, admin_listen: String, shutdown: &CancellationToken) {
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_listen, state, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
