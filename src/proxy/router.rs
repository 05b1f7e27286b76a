use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::filter::{find_fallback, FilterResult};
use crate::proxy::forwarder::Forwarder;
use crate::registry::InstanceLedger;
use crate::routing::{CompiledRoute, RouteTable};
use crate::upstream::{BreakerBank, LoadBalancer};
use arc_swap::ArcSwap;
use futures_util::FutureExt;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Uri};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-request pipeline from inbound request to downstream response.
///
/// Phases:
///
/// 1. ROUTE_MATCH - first route whose predicates accept the request
/// 2. ON_REQUEST  - guard filters (rate limit), may short-circuit
/// 3. BREAKER     - per-target admission
/// 4. SELECT      - healthy instances from the ledger, then the LB policy
/// 5. FORWARD     - rewrite filters, forwarded headers, bounded call
/// 6. OUTCOME     - breaker and latency accounting, response filters
/// 7. LOG         - metrics and one access event
pub struct GatewayRouter {
    route_table: Arc<ArcSwap<RouteTable>>,
    ledger: Arc<InstanceLedger>,
    breakers: Arc<BreakerBank>,
    lb: Arc<LoadBalancer>,
    forwarder: Arc<dyn Forwarder>,
    timeout: Duration,
}

impl GatewayRouter {
    pub fn new(
        route_table: Arc<ArcSwap<RouteTable>>,
        ledger: Arc<InstanceLedger>,
        breakers: Arc<BreakerBank>,
        lb: Arc<LoadBalancer>,
        forwarder: Arc<dyn Forwarder>,
        timeout: Duration,
    ) -> Self {
        Self {
            route_table,
            ledger,
            breakers,
            lb,
            forwarder,
            timeout,
        }
    }

    /// Route one request. Always produces a response: gateway failures are
    /// rendered as JSON errors and a panic while handling the request
    /// becomes a 500 for this request only.
    pub async fn route(&self, req: Request<BoxBody>, peer_addr: SocketAddr) -> Response<BoxBody> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Trust the left-most X-Forwarded-For entry when present, otherwise
        // the TCP peer.
        let client_ip = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
            .unwrap_or_else(|| peer_addr.ip());

        let mut ctx = RequestContext::new(
            host,
            req.uri().path().to_string(),
            req.method().as_str().to_string(),
            client_ip,
        );

        metrics::gauge!("waypoint_http_requests_in_flight").increment(1.0);
        let outcome = AssertUnwindSafe(self.try_route(req, peer_addr, &mut ctx))
            .catch_unwind()
            .await;
        metrics::gauge!("waypoint_http_requests_in_flight").decrement(1.0);

        let resp = match outcome {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                match err {
                    GatewayError::NoRouteFound => debug!(
                        "proxy: no route matched, method={}, path={}",
                        ctx.method, ctx.uri_path
                    ),
                    ref other => warn!(
                        "proxy: request failed, route={}, target={}, kind={}, error={}",
                        ctx.route_id,
                        ctx.target_service,
                        other.kind(),
                        other
                    ),
                }
                ctx.error_response(&err)
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    "proxy: request handler panicked, route={}, path={}, panic={}",
                    ctx.route_id,
                    ctx.uri_path,
                    msg
                );
                ctx.error_response(&GatewayError::Internal("request handler panicked".into()))
            }
        };

        phase_log(&ctx, &resp);
        resp
    }

    /// The pipeline proper. `Err` carries the gateway failure that the
    /// caller renders; fallbacks are already applied.
    pub async fn try_route(
        &self,
        req: Request<BoxBody>,
        peer_addr: SocketAddr,
        ctx: &mut RequestContext,
    ) -> Result<Response<BoxBody>, GatewayError> {
        let table = self.route_table.load_full();
        let matched = table.match_route(req.method().as_str(), req.uri().path(), req.headers())?;
        let route = matched.route;

        ctx.route_id.clone_from(&route.id);
        ctx.target_service.clone_from(&route.target_service);
        ctx.path_params = matched.params;

        for filter in &route.filters {
            if let FilterResult::Reject(resp) = filter.on_request(ctx).await {
                return Ok(resp);
            }
        }

        let target = route.target_service.as_str();
        let Some(permit) = self.breakers.acquire(target) else {
            debug!(
                "proxy: circuit breaker open, route={}, target={}",
                route.id, target
            );
            return with_fallback(&route, GatewayError::BreakerOpen(target.to_string()));
        };

        let instances = self.ledger.healthy_instances(target);
        let Some(mut selection) = self.lb.select(route.load_balancer, target, instances) else {
            // Dropping the permit fails a trial that cannot be sent.
            drop(permit);
            return Err(GatewayError::NoHealthyInstance(target.to_string()));
        };

        ctx.instance_id.clone_from(&selection.instance.instance_id);
        ctx.upstream_addr.clone_from(&selection.instance.address);

        let downstream_req = match build_downstream_request(req, &route, ctx, peer_addr) {
            Ok(req) => req,
            Err(err) => {
                permit.record(false);
                return Err(err);
            }
        };

        let upstream_start = Instant::now();
        ctx.upstream_start = Some(upstream_start);
        let call = self.forwarder.forward(downstream_req);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::DownstreamTimeout),
        };

        match result {
            Ok(mut resp) => {
                let success = !is_server_error(resp.status().as_u16());
                permit.record(success);
                if !success {
                    selection.mark_failed();
                }
                drop(selection);

                for filter in &route.filters {
                    filter.on_response(ctx, &mut resp);
                }
                Ok(resp)
            }
            Err(err) => {
                permit.record(false);
                selection.mark_failed();
                warn!(
                    "proxy: downstream call failed, route={}, target={}, instance={}, upstream={}, elapsed_ms={}, error={}",
                    route.id,
                    target,
                    ctx.instance_id,
                    ctx.upstream_addr,
                    upstream_start.elapsed().as_millis(),
                    err
                );
                with_fallback(&route, err)
            }
        }
    }
}

fn with_fallback(
    route: &CompiledRoute,
    err: GatewayError,
) -> Result<Response<BoxBody>, GatewayError> {
    match find_fallback(&route.filters) {
        Some(fallback) if err.is_fallback_eligible() => {
            metrics::counter!(
                "waypoint_fallback_responses_total",
                "route" => route.id.clone(),
                "kind" => err.kind(),
            )
            .increment(1);
            Ok(fallback.respond(&err))
        }
        _ => Err(err),
    }
}

/// Rebuild the inbound request for the chosen instance:
/// `http://{address}{rewritten path}{?query}`.
fn build_downstream_request(
    req: Request<BoxBody>,
    route: &CompiledRoute,
    ctx: &RequestContext,
    peer_addr: SocketAddr,
) -> Result<Request<BoxBody>, GatewayError> {
    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    inject_forwarded_headers(&mut headers, peer_addr, &ctx.host);

    let mut path = parts.uri.path().to_string();
    for filter in &route.filters {
        filter.on_forward(ctx, &mut path, &mut headers);
    }
    remove_hop_headers(&mut headers);

    let query = parts.uri.query();
    let mut uri = String::with_capacity(
        "http://".len() + ctx.upstream_addr.len() + path.len() + query.map_or(0, |q| q.len() + 1),
    );
    uri.push_str("http://");
    uri.push_str(&ctx.upstream_addr);
    uri.push_str(&path);
    if let Some(q) = query {
        uri.push('?');
        uri.push_str(q);
    }
    let uri: Uri = uri.parse().map_err(|e| {
        GatewayError::Internal(format!("invalid downstream uri for '{}': {}", ctx.upstream_addr, e))
    })?;

    let mut downstream = Request::new(body);
    *downstream.method_mut() = parts.method;
    *downstream.uri_mut() = uri;
    *downstream.headers_mut() = headers;
    Ok(downstream)
}

fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

fn phase_log(ctx: &RequestContext, resp: &Response<BoxBody>) {
    let resp_status = resp.status().as_u16();
    ctx.finalize_metrics(resp_status);

    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = ctx.upstream_start.map(|s| s.elapsed().as_millis()).unwrap_or(0);

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.uri_path,
        status = resp_status,
        route = %ctx.route_id,
        target = %ctx.target_service,
        instance = %ctx.instance_id,
        upstream = %ctx.upstream_addr,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Append the peer to `X-Forwarded-For`, default `X-Forwarded-Proto` to
/// `http`, and set `X-Forwarded-Host` and `X-Real-IP`.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
