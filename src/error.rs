//! Unified error handling for slinkd.
//!
//! Three error families: fatal-per-connection protocol errors, dropped
//! outgoing calls, and configuration errors. Each carries a static
//! `error_code()` label for structured logging.

use thiserror::Error;

// ============================================================================
// Protocol Errors (fatal for one connection)
// ============================================================================

/// Errors that tear down a network connection.
///
/// The IO loop reacts to every variant the same way: log, fire the
/// `DISCONNECT` hook, and schedule a reconnect if autoconnect allows it.
/// `IdsExhausted` is the exception and aborts the whole process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("recvpass from uplink does not match configuration")]
    BadPassword,

    #[error("required capability {0} missing from uplink capability list")]
    MissingCapability(String),

    #[error("malformed handshake line: {0}")]
    MalformedHandshake(String),

    #[error("uplink sent ERROR: {0}")]
    UplinkError(String),

    #[error("ping timeout ({0} seconds without data)")]
    PingTimeout(u64),

    #[error("TLS fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("ran out of UIDs/SIDs to allocate")]
    IdsExhausted,
}

impl ProtocolError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadPassword => "bad_password",
            Self::MissingCapability(_) => "missing_capability",
            Self::MalformedHandshake(_) => "malformed_handshake",
            Self::UplinkError(_) => "uplink_error",
            Self::PingTimeout(_) => "ping_timeout",
            Self::FingerprintMismatch { .. } => "fingerprint_mismatch",
            Self::Io(_) => "io_error",
            Self::Tls(_) => "tls_error",
            Self::IdsExhausted => "ids_exhausted",
        }
    }

    /// Whether this error must abort the whole process rather than one link.
    #[inline]
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, Self::IdsExhausted)
    }
}

// ============================================================================
// Outgoing Errors (dropped calls, never propagated to the IO loop)
// ============================================================================

/// Failures of the outgoing protocol API.
///
/// `InvalidSource` and `NotImplemented` are programming errors on the
/// caller's side; `UnknownTarget` is logged and the call is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutgoingError {
    #[error("source {0} is not owned by an internal server")]
    InvalidSource(String),

    #[error("no such user or channel: {0}")]
    UnknownTarget(String),

    #[error("operation {0} is unsupported by this protocol")]
    NotImplemented(&'static str),
}

impl OutgoingError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidSource(_) => "invalid_source",
            Self::UnknownTarget(_) => "unknown_target",
            Self::NotImplemented(_) => "not_implemented",
        }
    }
}

/// Result type for outgoing protocol calls that produce no value.
pub type OutgoingResult = Result<(), OutgoingError>;

// ============================================================================
// Config Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::BadPassword.error_code(), "bad_password");
        assert_eq!(
            ProtocolError::MissingCapability("EUID".into()).error_code(),
            "missing_capability"
        );
        assert_eq!(ProtocolError::IdsExhausted.error_code(), "ids_exhausted");
    }

    #[test]
    fn test_only_id_exhaustion_is_process_fatal() {
        assert!(ProtocolError::IdsExhausted.is_process_fatal());
        assert!(!ProtocolError::PingTimeout(60).is_process_fatal());
        assert!(!ProtocolError::BadPassword.is_process_fatal());
    }

    #[test]
    fn test_outgoing_error_codes() {
        assert_eq!(
            OutgoingError::InvalidSource("42XAAAAAB".into()).error_code(),
            "invalid_source"
        );
        assert_eq!(
            OutgoingError::NotImplemented("update_client").error_code(),
            "not_implemented"
        );
    }
}
