pub mod header;
pub mod rate_limit;

use crate::config::{FilterConfig, RouteConfig};
use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use bytes::Bytes;
use header::{HeaderOp, HeaderOpAction};
use http::{HeaderMap, HeaderValue, StatusCode};
use rate_limit::RateLimiter;
use std::sync::Arc;

/// Result of a filter's on_request phase.
pub enum FilterResult {
    /// Continue to the next filter / phase.
    Continue,
    /// Short-circuit: return this response immediately.
    Reject(hyper::Response<BoxBody>),
}

/// Enum-based filter with static dispatch.
///
/// Filters are pre-built once when the route table is compiled (at startup
/// and on reload), never per request. A route's filters run in three phases:
///
/// - `on_request`: guards, before any downstream work. May reject.
/// - `on_forward`: rewrites of the outbound path and headers.
/// - `on_response`: rewrites of the response headers.
///
/// Within each phase filters run in the order they are declared.
pub enum Filter {
    /// One limiter per route so counters never leak across routes.
    RateLimit(Arc<RateLimiter>),
    /// Drop the first `parts` path segments.
    StripPrefix { parts: usize },
    /// Prepend a fixed prefix to the path.
    PrefixPath { prefix: String },
    RequestHeader(HeaderOp),
    ResponseHeader(HeaderOp),
    /// Canned response served in place of breaker-open and downstream failures.
    Fallback(Fallback),
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::RateLimit(limiter) => f
                .debug_struct("RateLimit")
                .field("mode", &limiter.mode())
                .finish(),
            Filter::StripPrefix { parts } => {
                f.debug_struct("StripPrefix").field("parts", parts).finish()
            }
            Filter::PrefixPath { prefix } => {
                f.debug_struct("PrefixPath").field("prefix", prefix).finish()
            }
            Filter::RequestHeader(op) => f
                .debug_struct("RequestHeader")
                .field("action", &op.action)
                .field("name", &op.name)
                .finish(),
            Filter::ResponseHeader(op) => f
                .debug_struct("ResponseHeader")
                .field("action", &op.action)
                .field("name", &op.name)
                .finish(),
            Filter::Fallback(fb) => f
                .debug_struct("Fallback")
                .field("status", &fb.status)
                .finish(),
        }
    }
}

impl Filter {
    /// Request phase. Return `FilterResult::Reject` to short-circuit.
    pub async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        match self {
            Filter::RateLimit(limiter) => rate_limit::rate_limit_on_request(limiter, ctx).await,
            Filter::StripPrefix { .. }
            | Filter::PrefixPath { .. }
            | Filter::RequestHeader(_)
            | Filter::ResponseHeader(_)
            | Filter::Fallback(_) => FilterResult::Continue,
        }
    }

    /// Forward phase: rewrite the path (without query) and request headers
    /// sent downstream.
    pub fn on_forward(&self, ctx: &RequestContext, path: &mut String, headers: &mut HeaderMap) {
        match self {
            Filter::StripPrefix { parts } => *path = strip_prefix(path, *parts),
            Filter::PrefixPath { prefix } => *path = prefix_path(prefix, path),
            Filter::RequestHeader(op) => op.apply(headers, &ctx.path_params),
            Filter::RateLimit(_) | Filter::ResponseHeader(_) | Filter::Fallback(_) => {}
        }
    }

    /// Response phase: runs on downstream responses before they reach the
    /// client.
    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        if let Filter::ResponseHeader(op) = self {
            op.apply(resp.headers_mut(), &ctx.path_params);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fallback {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: HeaderValue,
}

impl Fallback {
    /// Build the fallback response for `err`. The failure kind is reported
    /// in `x-waypoint-fallback`.
    pub fn respond(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let mut resp = hyper::Response::new(full_body(self.body.clone()));
        *resp.status_mut() = self.status;
        let headers = resp.headers_mut();
        headers.insert(http::header::CONTENT_TYPE, self.content_type.clone());
        headers.insert(
            "x-waypoint-fallback",
            HeaderValue::from_static(err.kind()),
        );
        resp
    }
}

/// The route's fallback, if one is declared. The first declaration wins.
pub fn find_fallback(filters: &[Filter]) -> Option<&Fallback> {
    filters.iter().find_map(|f| match f {
        Filter::Fallback(fb) => Some(fb),
        _ => None,
    })
}

/// Build the filter chain for a route. Called once per route at table
/// compile time.
pub fn build_route_filters(route: &RouteConfig) -> Result<Vec<Filter>, String> {
    let mut filters = Vec::with_capacity(route.filters.len());

    for fc in &route.filters {
        let filter = match fc {
            FilterConfig::RateLimit(rl) => {
                let limiter = Arc::new(RateLimiter::from_config(rl)?);
                limiter.start_gc();
                Filter::RateLimit(limiter)
            }
            FilterConfig::StripPrefix { parts } => Filter::StripPrefix { parts: *parts },
            FilterConfig::PrefixPath { prefix } => {
                if !prefix.starts_with('/') {
                    return Err(format!("prefix_path '{}' must start with '/'", prefix));
                }
                Filter::PrefixPath {
                    prefix: prefix.trim_end_matches('/').to_string(),
                }
            }
            FilterConfig::SetRequestHeader { name, value } => {
                Filter::RequestHeader(HeaderOp::compile(HeaderOpAction::Set, name, value)?)
            }
            FilterConfig::AddRequestHeader { name, value } => {
                Filter::RequestHeader(HeaderOp::compile(HeaderOpAction::Add, name, value)?)
            }
            FilterConfig::RemoveRequestHeader { name } => {
                Filter::RequestHeader(HeaderOp::compile(HeaderOpAction::Remove, name, "")?)
            }
            FilterConfig::SetResponseHeader { name, value } => {
                Filter::ResponseHeader(HeaderOp::compile(HeaderOpAction::Set, name, value)?)
            }
            FilterConfig::AddResponseHeader { name, value } => {
                Filter::ResponseHeader(HeaderOp::compile(HeaderOpAction::Add, name, value)?)
            }
            FilterConfig::RemoveResponseHeader { name } => {
                Filter::ResponseHeader(HeaderOp::compile(HeaderOpAction::Remove, name, "")?)
            }
            FilterConfig::Fallback {
                status,
                body,
                content_type,
            } => {
                let status = StatusCode::from_u16(*status)
                    .map_err(|_| format!("fallback status {} is not a valid code", status))?;
                let content_type = HeaderValue::from_str(content_type)
                    .map_err(|e| format!("fallback content_type invalid: {}", e))?;
                Filter::Fallback(Fallback {
                    status,
                    body: Bytes::from(body.clone()),
                    content_type,
                })
            }
        };
        filters.push(filter);
    }

    Ok(filters)
}

/// "/api/orders/42" with parts=1 -> "/orders/42"
fn strip_prefix(path: &str, parts: usize) -> String {
    let rest = path
        .trim_start_matches('/')
        .splitn(parts + 1, '/')
        .nth(parts)
        .unwrap_or("");
    let mut out = String::with_capacity(rest.len() + 1);
    out.push('/');
    out.push_str(rest);
    out
}

/// prefix "/v2" on "/orders" -> "/v2/orders"
fn prefix_path(prefix: &str, path: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + path.len());
    out.push_str(prefix);
    out.push_str(path);
    out
}
