//! Crate-wide error type.
//!
//! Mirrors the domain error taxonomy of the HTTP transport and texture
//! pipeline (transport, HTTP-status, protocol, cancellation, resource
//! exhaustion, blacklist-block) rather than leaking `reqwest`/`url` error
//! types past the module boundary that produced them.

use thiserror::Error;

use crate::accountant::ServiceKey;
use crate::engine::RunStateId;

/// Result type for this crate's operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Transport-level failure classes surfaced to `Responder::http_failure`.
///
/// Named per spec §4.4; each variant maps to a concrete libcurl-style error
/// class even though the underlying transport is `reqwest`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("couldn't resolve host")]
    CouldntResolveHost,
    #[error("couldn't connect")]
    CouldntConnect,
    #[error("SSL peer certificate error")]
    SslPeerCertificate,
    #[error("SSL CA certificate error")]
    SslCaCert,
    #[error("SSL connect error")]
    SslConnectError,
    #[error("operation timed out")]
    OperationTimedOut,
    #[error("average throughput below low-speed limit")]
    LowSpeed,
    #[error("curl lockup")]
    CurlLockup,
    #[error("bad socket")]
    BadSocket,
    #[error("request canceled")]
    Cancelled,
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("other transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// True for the two classes that the per-service accountant blacklists
    /// a host for (spec §4.3, §4.6: 60s backoff).
    pub fn triggers_blacklist(&self) -> bool {
        matches!(
            self,
            TransportError::OperationTimedOut | TransportError::LowSpeed
        )
    }
}

/// Errors that can occur anywhere in the transport/accountant/texture stack.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A header was added under `HeaderMergeMode::New` but already existed.
    #[error("duplicate header: {0}")]
    DuplicateHeader(String),

    /// An `EasyRequest` was mutated after `finalize()`.
    #[error("request already finalized")]
    AlreadyFinalized,

    /// An `EasyRequest` was run before `finalize()`.
    #[error("request not finalized")]
    NotFinalized,

    /// The named timeout policy was not registered in `CoreConfig`.
    #[error("unknown timeout policy: {0}")]
    UnknownTimeoutPolicy(String),

    /// Service is blacklisted; the request fails fast per spec §7
    /// ("Blacklist-block" -> synthetic BadSocket-equivalent).
    #[error("service {0} is blacklisted until the backoff window elapses")]
    Blacklisted(ServiceKey),

    /// Transport-level or HTTP-status failure.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// URL failed to parse (service-key extraction, texture URL construction).
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A run-state was reached that a `StateMachine` impl did not expect.
    #[error("unexpected run state {0:?}")]
    UnexpectedRunState(RunStateId),

    /// The requested image/request id is not tracked by the pipeline.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// Protocol-level failure: malformed response where a structured body
    /// was expected (bad Content-Range, invalid LLSD/XML-RPC/JSON).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying HTTP client error.
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// JSON (de)serialization failure at the LLSD/XML-RPC value boundary.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for conditions that don't deserve their own variant.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Serializes an error for storage in a terminal `Failed` worker/request
/// state, the way `fusillade::error::error_serialization` does.
pub mod error_serialization {
    use super::CoreError;

    pub fn serialize_error(err: &CoreError) -> String {
        err.to_string()
    }
}
