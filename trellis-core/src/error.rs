// Error types for the Trellis framework

use crate::HttpStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Service registry
    #[error("Service not registered: {0}")]
    ServiceNotRegistered(String),

    #[error("Service '{key}' is not bound to {expected}")]
    ServiceTypeMismatch { key: String, expected: &'static str },

    #[error("Circular dependency while resolving service: {0}")]
    CircularDependency(String),

    #[error("Service failed to resolve: {0}")]
    ResolutionFailed(String),

    #[error("Service key '{key}' declared twice ({first} and {second})")]
    DuplicateServiceKey {
        key: String,
        first: &'static str,
        second: &'static str,
    },

    // Routing
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Alias chain for '{url}' exceeded {hops} rewrites")]
    AliasDepthExceeded { url: String, hops: usize },

    // Request processing
    #[error("Untrusted host: {0}")]
    UntrustedHost(String),

    #[error("Middleware error: {0}")]
    Middleware(String),

    #[error("Controller error: {0}")]
    Controller(String),

    #[error("Failed to send response: {0}")]
    Send(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    // Infrastructure
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP server error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl Error {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.http_status().code()
    }

    /// Get the HttpStatus enum for this error
    pub fn http_status(&self) -> HttpStatus {
        match self {
            Error::RouteNotFound(_) | Error::AliasDepthExceeded { .. } => HttpStatus::NotFound,
            Error::InvalidMethod(_) => HttpStatus::MethodNotAllowed,
            Error::BadRequest(_) | Error::Deserialization(_) => HttpStatus::BadRequest,
            Error::PayloadTooLarge(_) => HttpStatus::PayloadTooLarge,

            // Untrusted hosts are rejected with a generic server error so the
            // allowlist is not advertised to the caller.
            _ => HttpStatus::InternalServerError,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.http_status().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.http_status().is_server_error()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors_map_to_client_status() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::PayloadTooLarge("x".into()).status_code(), 413);
        assert_eq!(Error::RouteNotFound("/x".into()).status_code(), 404);
        assert!(Error::Deserialization("x".into()).is_client_error());
    }

    #[test]
    fn test_infrastructure_errors_map_to_500() {
        assert_eq!(Error::UntrustedHost("b.example".into()).status_code(), 500);
        assert_eq!(Error::CircularDependency("a".into()).status_code(), 500);
        assert!(Error::Send("closed".into()).is_server_error());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::DuplicateServiceKey {
            key: "app.users".into(),
            first: "dyn UserStore",
            second: "dyn Mailer",
        };
        assert_eq!(
            err.to_string(),
            "Service key 'app.users' declared twice (dyn UserStore and dyn Mailer)"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        assert!(matches!(Error::from(parse), Error::Deserialization(_)));
    }
}
