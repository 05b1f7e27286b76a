mod admin;
pub mod bootstrap;
mod state;

pub use admin::handle_admin;
pub use state::GatewayState;

use crate::proxy::GatewayRouter;
use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const H2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Bind `listen` and run the proxy listener until `shutdown` is cancelled.
pub async fn run_proxy_server(
    listen: &str,
    router: Arc<GatewayRouter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);
    serve_proxy(listener, router, shutdown).await
}

/// Accept loop for the proxy listener.
///
/// Cancelling `shutdown` stops the accept loop; connections already open
/// get up to `DRAIN_TIMEOUT` to finish before the function returns.
pub async fn serve_proxy(
    listener: TcpListener,
    router: Arc<GatewayRouter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let connections = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => break,
        };
        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("waypoint_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        let guard = ConnectionGuard::open();
        let router = router.clone();
        connections.spawn(async move {
            let _guard = guard;
            let svc = service_fn(move |req: Request<Incoming>| {
                let router = router.clone();
                async move {
                    let req = req.map(|body| body.boxed());
                    Ok::<_, Infallible>(router.route(req, peer_addr).await)
                }
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().keep_alive(true);
            builder
                .http2()
                .keep_alive_interval(Some(H2_KEEPALIVE_INTERVAL));
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }
        });
    }

    drain(connections).await;
    Ok(())
}

async fn drain(connections: TaskTracker) {
    connections.close();
    if connections.is_empty() {
        return;
    }
    info!(
        "server: proxy: stopped accepting, draining {} connections",
        connections.len()
    );
    match tokio::time::timeout(DRAIN_TIMEOUT, connections.wait()).await {
        Ok(()) => info!("server: proxy: all connections drained"),
        Err(_) => info!(
            "server: proxy: drain timeout ({}s), {} connections still active",
            DRAIN_TIMEOUT.as_secs(),
            connections.len()
        ),
    }
}

/// Connection accounting for one accepted socket; the gauge drops with it.
struct ConnectionGuard;

impl ConnectionGuard {
    fn open() -> Self {
        metrics::counter!("waypoint_connections_total", "status" => "accepted").increment(1);
        metrics::gauge!("waypoint_connections_active").increment(1.0);
        ConnectionGuard
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::gauge!("waypoint_connections_active").decrement(1.0);
    }
}

/// Bind `listen` and serve the admin API until `shutdown` is cancelled.
pub async fn run_admin_server(
    listen: &str,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);
    serve_admin(listener, state, shutdown).await
}

pub async fn serve_admin(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: admin: stopped");
                return Ok(());
            }
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("server: admin: accept failed, error={}", e);
                continue;
            }
        };
        let state = state.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_admin(req, state).await) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
