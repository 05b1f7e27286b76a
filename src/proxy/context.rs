use crate::error::GatewayError;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// JSON error body: `{"error":"<message>","kind":"<kind>"}`.
pub fn json_error(status: StatusCode, kind: &str, msg: &str) -> hyper::Response<BoxBody> {
    let body = serde_json::json!({ "error": msg, "kind": kind }).to_string();
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

/// Per-request bookkeeping carried through the router phases.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub route_id: String,
    pub target_service: String,
    pub instance_id: String,
    pub upstream_addr: String,
    pub client_ip: IpAddr,
    /// `{name}` captures from the matched path pattern.
    pub path_params: Vec<(String, String)>,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(host: String, uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            host,
            uri_path,
            method,
            route_id: String::new(),
            target_service: String::new(),
            instance_id: String::new(),
            upstream_addr: String::new(),
            client_ip,
            path_params: Vec::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    #[cfg(test)]
    fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Response for a gateway-side failure. Counts the error by kind.
    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        metrics::counter!(
            "waypoint_gateway_errors_total",
            "kind" => err.kind(),
            "route" => self.route_id.clone(),
            "target" => self.target_service.clone(),
        )
        .increment(1);
        json_error(err.status_code(), err.kind(), &err.to_string())
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "waypoint_http_requests_total",
            "route" => self.route_id.clone(),
            "target" => self.target_service.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "waypoint_http_request_duration_seconds",
            "route" => self.route_id.clone(),
            "target" => self.target_service.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "waypoint_downstream_request_duration_seconds",
                "target" => self.target_service.clone(),
                "instance" => self.instance_id.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}
