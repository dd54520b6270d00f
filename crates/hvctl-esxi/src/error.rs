//! Error types for the ESXi inventory crate.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsxiErrorKind {
    /// Network / transport failure, or the session expired under us
    ConnectionError,
    /// Bad credential (InvalidLogin fault / 401)
    AuthError,
    /// Referenced object absent (ManagedObjectNotFound)
    NotFound,
    /// Caller input rejected before (or by) the remote endpoint
    ValidationError,
    /// Remote capacity limit (InsufficientResourcesFault, NoDiskSpace)
    ResourceExhausted,
    /// Cached data too old for the caller and no fresher copy available
    StaleData,
    /// Request exceeded its deadline
    Timeout,
    /// Malformed response or an unexpected SOAP fault
    ProtocolError,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct EsxiError {
    pub kind: EsxiErrorKind,
    pub message: String,
}

impl EsxiError {
    pub fn new(kind: EsxiErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::AuthError, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::NotFound, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::ValidationError, msg)
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::ResourceExhausted, msg)
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::StaleData, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::Timeout, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(EsxiErrorKind::ProtocolError, msg)
    }

    /// Transport-level failure: the session that produced it can no longer
    /// be trusted.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self.kind,
            EsxiErrorKind::ConnectionError | EsxiErrorKind::Timeout
        )
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_failure() || self.kind == EsxiErrorKind::ResourceExhausted
    }
}

impl fmt::Display for EsxiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for EsxiError {}

impl From<reqwest::Error> for EsxiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() || e.is_request() {
            Self::connection(format!("Connection failed: {e}"))
        } else if e.is_decode() || e.is_body() {
            Self::protocol(format!("Malformed response: {e}"))
        } else {
            Self::connection(format!("HTTP error: {e}"))
        }
    }
}

impl From<quick_xml::Error> for EsxiError {
    fn from(e: quick_xml::Error) -> Self {
        Self::protocol(format!("XML parse error: {e}"))
    }
}

/// Convenience alias.
pub type EsxiResult<T> = Result<T, EsxiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = EsxiError::not_found("host ha-host");
        let s = err.to_string();
        assert!(s.contains("NotFound"));
        assert!(s.contains("ha-host"));
    }

    #[test]
    fn connection_class_is_retryable() {
        assert!(EsxiError::connection("refused").is_retryable());
        assert!(EsxiError::timeout("slow").is_retryable());
        assert!(EsxiError::timeout("slow").is_connection_failure());
    }

    #[test]
    fn resource_exhausted_retryable_but_not_a_connection_failure() {
        let err = EsxiError::exhausted("no disk space");
        assert!(err.is_retryable());
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn terminal_kinds_not_retryable() {
        for err in [
            EsxiError::auth("bad password"),
            EsxiError::not_found("gone"),
            EsxiError::validation("bad name"),
            EsxiError::stale("too old"),
            EsxiError::protocol("garbage"),
        ] {
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }
    }
}
