//! Error types for nodes and their transport

use blobcache::CacheError;
use http::StatusCode;
use transit::TransitError;

use crate::address::AddressError;
use crate::auth::AuthorizeError;
use crate::digest::DigestError;
use crate::state::StateError;
use crate::uri::ParseUriError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Error types for node operations
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The request scheme has no route
    #[error("protocol not implemented: {0}")]
    ProtocolNotImplemented(String),

    /// No stream is registered at the api path
    #[error("unknown api: {0}")]
    UnknownApi(String),

    /// A non-GET request against cached files
    #[error("node files are readonly")]
    ReadOnly,

    /// A cache request named a different cache
    #[error("incorrect host: {0}")]
    IncorrectHost(String),

    /// The request URI has no host
    #[error("request has no host")]
    MissingHost,

    /// A required header was absent
    #[error("missing header: {0}")]
    MissingHeader(http::HeaderName),

    /// A header could not be interpreted
    #[error("invalid header: {0}")]
    InvalidHeader(http::HeaderName),

    /// The operation only supports GET
    #[error("address does not have required method GET, found {0}")]
    MethodNotAllowed(http::Method),

    /// No real HTTP service is configured for the scheme
    #[error("no transport configured for {0}")]
    NoTransport(&'static str),

    /// A secure request was built without an authorizer
    #[error("node has no authorizer")]
    NoAuthorizer,

    /// The response status was not a success
    #[error("unexpected response status: {0}")]
    Status(StatusCode),

    /// The stream does not accept the content type
    #[error("unacceptable content type: {0}")]
    Unacceptable(String),

    /// Transition or stable descriptor error
    #[error(transparent)]
    Transit(#[from] TransitError),

    /// Cache error
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// State error
    #[error(transparent)]
    State(#[from] StateError),

    /// Address error
    #[error(transparent)]
    Address(#[from] AddressError),

    /// URI error
    #[error(transparent)]
    Uri(#[from] ParseUriError),

    /// Digest error
    #[error(transparent)]
    Digest(#[from] DigestError),

    /// Authorization error
    #[error(transparent)]
    Authorize(#[from] AuthorizeError),

    /// Building a request or response failed
    #[error(transparent)]
    Http(#[from] http::Error),

    /// The real HTTP client failed
    #[error(transparent)]
    Client(#[from] hyperdriver::client::Error),

    /// Reading a body failed
    #[error("error reading body: {0}")]
    Body(#[source] BoxError),
}

impl NodeError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NodeError::UnknownApi(_) => StatusCode::NOT_FOUND,
            NodeError::Cache(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            NodeError::Cache(err) if err.kind().is_client_fault() => StatusCode::BAD_REQUEST,
            NodeError::ReadOnly | NodeError::MethodNotAllowed(_) => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            NodeError::IncorrectHost(_)
            | NodeError::MissingHost
            | NodeError::MissingHeader(_)
            | NodeError::InvalidHeader(_)
            | NodeError::Address(_)
            | NodeError::Uri(_) => StatusCode::BAD_REQUEST,
            NodeError::Unacceptable(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            NodeError::NoAuthorizer | NodeError::Authorize(_) => StatusCode::UNAUTHORIZED,
            NodeError::State(StateError::HashMismatch) | NodeError::Digest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            NodeError::Transit(TransitError::AlreadyActive) => StatusCode::CONFLICT,
            NodeError::Transit(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::Status(status) => *status,
            NodeError::ProtocolNotImplemented(_) | NodeError::NoTransport(_) => {
                StatusCode::NOT_IMPLEMENTED
            }
            NodeError::Client(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
