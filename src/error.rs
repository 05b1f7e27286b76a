use http::StatusCode;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    NoRouteFound,
    NoHealthyInstance(String),
    BreakerOpen(String),
    DownstreamTimeout,
    DownstreamError(String),
    RateLimited,
    /// Reserved: registration is an upsert, so nothing raises this today.
    RegistrationConflict,
    InstanceNotFound { service: String, instance_id: String },
    Config(String),
    Internal(String),
}

impl GatewayError {
    /// HTTP status surfaced to the caller of the gateway.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteFound => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyInstance(_) | GatewayError::BreakerOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::DownstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DownstreamError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RegistrationConflict => StatusCode::CONFLICT,
            GatewayError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NoRouteFound => "no_route_found",
            GatewayError::NoHealthyInstance(_) => "no_healthy_instance",
            GatewayError::BreakerOpen(_) => "breaker_open",
            GatewayError::DownstreamTimeout => "downstream_timeout",
            GatewayError::DownstreamError(_) => "downstream_error",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::RegistrationConflict => "registration_conflict",
            GatewayError::InstanceNotFound { .. } => "instance_not_found",
            GatewayError::Config(_) => "config",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Failures a route's fallback filter may answer for.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            GatewayError::BreakerOpen(_)
                | GatewayError::DownstreamTimeout
                | GatewayError::DownstreamError(_)
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteFound => write!(f, "no route found"),
            GatewayError::NoHealthyInstance(service) => {
                write!(f, "no healthy instance of service '{}'", service)
            }
            GatewayError::BreakerOpen(service) => {
                write!(f, "circuit breaker open for service '{}'", service)
            }
            GatewayError::DownstreamTimeout => write!(f, "downstream timeout"),
            GatewayError::DownstreamError(msg) => write!(f, "downstream error: {}", msg),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::RegistrationConflict => write!(f, "registration conflict"),
            GatewayError::InstanceNotFound {
                service,
                instance_id,
            } => write!(f, "instance '{}' of service '{}' not found", instance_id, service),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_route_found() {
        assert_eq!(GatewayError::NoRouteFound.to_string(), "no route found");
    }

    #[test]
    fn display_breaker_open() {
        assert_eq!(
            GatewayError::BreakerOpen("order-service".to_string()).to_string(),
            "circuit breaker open for service 'order-service'"
        );
    }

    #[test]
    fn display_instance_not_found() {
        let err = GatewayError::InstanceNotFound {
            service: "order-service".to_string(),
            instance_id: "i1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "instance 'i1' of service 'order-service' not found"
        );
    }

    #[test]
    fn unavailable_kinds_stay_distinct() {
        let no_instance = GatewayError::NoHealthyInstance("a".into());
        let breaker = GatewayError::BreakerOpen("a".into());
        assert_eq!(no_instance.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(breaker.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_ne!(no_instance.kind(), breaker.kind());
        assert_ne!(no_instance, breaker);
    }

    #[test]
    fn status_codes() {
        assert_eq!(GatewayError::NoRouteFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::DownstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::DownstreamError("reset".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn fallback_eligibility() {
        assert!(GatewayError::BreakerOpen("a".into()).is_fallback_eligible());
        assert!(GatewayError::DownstreamTimeout.is_fallback_eligible());
        assert!(!GatewayError::NoHealthyInstance("a".into()).is_fallback_eligible());
        assert!(!GatewayError::NoRouteFound.is_fallback_eligible());
        assert!(!GatewayError::RateLimited.is_fallback_eligible());
    }
}
