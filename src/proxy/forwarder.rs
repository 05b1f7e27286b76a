use crate::config::ProxyConfig;
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Sends a fully-built request to a downstream instance.
///
/// The router owns routing, breaker and timeout decisions; a forwarder only
/// moves bytes. Tests substitute in-process implementations.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, req: Request<BoxBody>) -> Result<Response<BoxBody>, GatewayError>;
}

/// Plain-HTTP forwarder over a pooled hyper client.
pub struct HyperForwarder {
    client: Client<HttpConnector, BoxBody>,
}

impl HyperForwarder {
    pub fn new(config: &ProxyConfig) -> Self {
        let pool = &config.keepalive_pool;

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(Duration::from_secs(pool.idle_timeout)));
        http.set_connect_timeout(Some(Duration::from_secs_f64(config.connect_timeout_secs)));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(pool.idle_timeout))
            .pool_max_idle_per_host(pool.size)
            .build(http);

        Self { client }
    }
}

#[async_trait]
impl Forwarder for HyperForwarder {
    async fn forward(&self, req: Request<BoxBody>) -> Result<Response<BoxBody>, GatewayError> {
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| GatewayError::DownstreamError(e.to_string()))?;
        Ok(resp.map(|body| body.boxed()))
    }
}
