use super::GatewayState;
use crate::error::GatewayError;
use crate::proxy::context::{empty_body, full_body, json_error, BoxBody};
use crate::registry::{InstanceStatus, MAX_LEASE};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    instance_id: String,
    address: String,
    #[serde(default)]
    ttl_secs: Option<u64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: InstanceStatus,
}

/// Admin API: instance registration, dashboards, reload, health and metrics.
pub async fn handle_admin<B>(req: Request<B>, state: GatewayState) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health" | "healthz"]) => json_ok(&serde_json::json!({"status": "ok"})),

        (&Method::GET, ["ready" | "readyz"]) => json_ok(&serde_json::json!({
            "status": "ready",
            "routes": state.route_table.load().route_count(),
            "services": state.ledger.services().len(),
            "instances": state.ledger.instance_count(),
        })),

        (&Method::GET, ["metrics"]) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap_or_else(|_| internal_error()),

        (&Method::GET, ["registry", "services"]) => json_ok(&state.ledger.snapshot()),

        (&Method::GET, ["registry", "services", service]) => {
            let now = state.ledger.now();
            let healthy: Vec<_> = state
                .ledger
                .healthy_instances(service)
                .iter()
                .map(|i| i.view(now))
                .collect();
            json_ok(&healthy)
        }

        (&Method::POST, ["registry", "services", service, "instances"]) => {
            let service = service.to_string();
            let body: RegisterRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            register(&state, &service, body)
        }

        (&Method::PUT, ["registry", "services", service, "instances", id, "heartbeat"]) => {
            match state.ledger.heartbeat(service, id) {
                Ok(()) => json_ok(&serde_json::json!({"status": "ok"})),
                Err(e) => error(&e),
            }
        }

        (&Method::PUT, ["registry", "services", service, "instances", id, "status"]) => {
            let (service, id) = (service.to_string(), id.to_string());
            let body: StatusRequest = match read_json(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            match state.ledger.set_status(&service, &id, body.status) {
                Ok(()) => json_ok(&serde_json::json!({"status": body.status})),
                Err(e) => error(&e),
            }
        }

        (&Method::DELETE, ["registry", "services", service, "instances", id]) => {
            state.ledger.deregister(service, id);
            no_content()
        }

        (&Method::GET, ["breakers"]) => json_ok(&state.breakers.snapshot()),

        (&Method::POST, ["breakers", target, "reset"]) => {
            if state.breakers.reset(target) {
                json_ok(&serde_json::json!({"target": target, "state": "CLOSED"}))
            } else {
                json_error(StatusCode::NOT_FOUND, "not_found", "unknown breaker target")
            }
        }

        (&Method::GET, ["routes"]) => {
            let table = state.route_table.load();
            let routes: Vec<serde_json::Value> = table
                .routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "path": r.path.as_str(),
                        "methods": r.methods,
                        "headers": r.header_matchers.len(),
                        "target_service": r.target_service,
                        "load_balancer": r.load_balancer.as_str(),
                        "filters": r.filters.iter().map(|f| format!("{:?}", f)).collect::<Vec<_>>(),
                    })
                })
                .collect();
            json_ok(&routes)
        }

        (&Method::POST, ["routes", "reload"]) => match state.reload_routes().await {
            Ok(count) => json_ok(&serde_json::json!({"status": "reloaded", "routes": count})),
            Err(e) => {
                tracing::warn!("admin: route reload rejected, error={}", e);
                error(&e)
            }
        },

        _ => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

fn register(state: &GatewayState, service: &str, body: RegisterRequest) -> Response<BoxBody> {
    if body.instance_id.trim().is_empty() || body.address.trim().is_empty() {
        return error(&GatewayError::Config(
            "instance_id and address are required".into(),
        ));
    }
    let lease = match body.ttl_secs {
        Some(0) => {
            return error(&GatewayError::Config("ttl_secs must be > 0".into()));
        }
        Some(secs) if secs > MAX_LEASE.as_secs() => {
            return error(&GatewayError::Config(format!(
                "ttl_secs must be <= {}",
                MAX_LEASE.as_secs()
            )));
        }
        Some(secs) => Duration::from_secs(secs),
        None => state.default_lease(),
    };
    let instance = state.ledger.register_with_metadata(
        service,
        &body.instance_id,
        &body.address,
        lease,
        body.metadata,
    );
    json_ok(&instance.view(state.ledger.now()))
}

async fn read_json<B, T>(req: Request<B>) -> Result<T, Response<BoxBody>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
    T: DeserializeOwned,
{
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                &format!("failed to read body: {}", e),
            ))
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        json_error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            &format!("invalid json body: {}", e),
        )
    })
}

fn json_ok<T: Serialize + ?Sized>(value: &T) -> Response<BoxBody> {
    match serde_json::to_string_pretty(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap_or_else(|_| internal_error()),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            &format!("serialization failed: {}", e),
        ),
    }
}

fn error(err: &GatewayError) -> Response<BoxBody> {
    json_error(err.status_code(), err.kind(), &err.to_string())
}

fn no_content() -> Response<BoxBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    resp
}

fn internal_error() -> Response<BoxBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}
