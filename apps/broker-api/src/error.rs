//! Broker error type, stable error codes and the fault mapping used for error replies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
pub const ROUTING_ERROR: &str = "ROUTING_ERROR";
pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
pub const NOT_STARTED: &str = "NOT_STARTED";
pub const INVALIDATED: &str = "INVALIDATED";
pub const THROTTLED: &str = "THROTTLED";
pub const SERVICE_ERROR: &str = "SERVICE_ERROR";
pub const UNSUPPORTED: &str = "UNSUPPORTED";

/// Distinguishes failed logins from failed authorization checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityFault {
    NotAuthenticated,
    InvalidCredentials,
    AccessDenied,
}

impl SecurityFault {
    pub fn code(self) -> &'static str {
        match self {
            SecurityFault::NotAuthenticated => NOT_AUTHENTICATED,
            SecurityFault::InvalidCredentials => INVALID_CREDENTIALS,
            SecurityFault::AccessDenied => ACCESS_DENIED,
        }
    }
}

/// Error type shared by the router, services and entity lifecycles.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Duplicate id, missing required field or unknown reference.
    #[error("{0}")]
    Configuration(String),

    /// The request could not be routed (no message id, no service, bad header).
    #[error("{0}")]
    Routing(String),

    /// Authentication or authorization failure.
    #[error("{message}")]
    Security { fault: SecurityFault, message: String },

    /// The target service or destination is not running.
    #[error("{component} '{id}' cannot service message '{message_id}' in stopped state")]
    Stopped {
        component: &'static str,
        id: String,
        message_id: String,
    },

    /// Operation attempted on an invalidated session, client or subscription.
    #[error("{0} has been invalidated")]
    Invalidated(&'static str),

    /// Inbound message rejected by a throttle policy.
    #[error("{0}")]
    Throttled(String),

    /// Failure raised by a service while processing a message.
    #[error("service '{service_id}' failed: {message}")]
    Service {
        service_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The service does not implement the requested operation.
    #[error("{0}")]
    Unsupported(String),
}

impl BrokerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing(message.into())
    }

    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::Security {
            fault: SecurityFault::NotAuthenticated,
            message: message.into(),
        }
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::Security {
            fault: SecurityFault::InvalidCredentials,
            message: message.into(),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::Security {
            fault: SecurityFault::AccessDenied,
            message: message.into(),
        }
    }

    pub fn service(service_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            service_id: service_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Stable code for logs and error replies.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Configuration(_) => CONFIGURATION_ERROR,
            BrokerError::Routing(_) => ROUTING_ERROR,
            BrokerError::Security { fault, .. } => fault.code(),
            BrokerError::Stopped { .. } => NOT_STARTED,
            BrokerError::Invalidated(_) => INVALIDATED,
            BrokerError::Throttled(_) => THROTTLED,
            BrokerError::Service { .. } => SERVICE_ERROR,
            BrokerError::Unsupported(_) => UNSUPPORTED,
        }
    }

    /// Fault code carried by error replies, in the `Client.*` / `Server.*` form clients expect.
    pub fn fault_code(&self) -> &'static str {
        match self {
            BrokerError::Security {
                fault: SecurityFault::AccessDenied,
                ..
            } => "Client.Authorization",
            BrokerError::Security { .. } => "Client.Authentication",
            BrokerError::Routing(_) | BrokerError::Throttled(_) => "Client.Processing",
            BrokerError::Invalidated(_) => "Client.Invalidated",
            BrokerError::Configuration(_)
            | BrokerError::Stopped { .. }
            | BrokerError::Service { .. }
            | BrokerError::Unsupported(_) => "Server.Processing",
        }
    }

    pub fn is_security(&self) -> bool {
        matches!(self, BrokerError::Security { .. })
    }

    /// Render the full `source()` chain for logging.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }

    fn status(&self) -> StatusCode {
        match self {
            BrokerError::Routing(_) | BrokerError::Throttled(_) => StatusCode::BAD_REQUEST,
            BrokerError::Security {
                fault: SecurityFault::AccessDenied,
                ..
            } => StatusCode::FORBIDDEN,
            BrokerError::Security { .. } => StatusCode::UNAUTHORIZED,
            BrokerError::Invalidated(_) => StatusCode::GONE,
            BrokerError::Stopped { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            BrokerError::Configuration(_) | BrokerError::Service { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Structured error body returned by the HTTP transport.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        tracing::debug!(?err, "malformed json");
        Self::Routing(format!("malformed message: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_error_names_component() {
        let err = BrokerError::Stopped {
            component: "Destination",
            id: "chat".into(),
            message_id: "m1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Destination 'chat' cannot service message 'm1' in stopped state"
        );
        assert_eq!(err.code(), NOT_STARTED);
    }

    #[test]
    fn security_faults_map_to_client_codes() {
        assert_eq!(
            BrokerError::access_denied("no").fault_code(),
            "Client.Authorization"
        );
        assert_eq!(
            BrokerError::invalid_credentials("no").fault_code(),
            "Client.Authentication"
        );
    }

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = BrokerError::Service {
            service_id: "svc".into(),
            message: "write failed".into(),
            source: Some(Box::new(io)),
        };
        assert_eq!(err.chain(), "service 'svc' failed: write failed: disk gone");
    }
}
