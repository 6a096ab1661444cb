//! Error taxonomy for the request pipeline.
//!
//! Every failure that can surface on a connection funnels into [`ServerError`]
//! so the error-handling stage can map it to a response status, decide whether
//! the connection must be torn down afterwards, and feed circuit breakers.

use std::{io, time::Duration};

use http::{Method, StatusCode};
use thiserror::Error;

use crate::{breaker::CircuitOpen, AnyError};

/// Broad classification of a [`ServerError`], used for logging and for
/// circuit-breaker accounting (only infrastructure errors count as breaker
/// failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller sent something we refuse to process.
    Client,
    /// This process or a downstream dependency failed.
    Infra,
    /// A bug: invalid pipeline state, ambiguous routing, endpoint panic.
    Fatal,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("request body exceeds limit of {limit} bytes")]
    RequestTooBig { limit: usize },
    #[error("no endpoint matches path {path}")]
    PathNotFound { path: String },
    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: Method, path: String },
    #[error("request validation failed: {0}")]
    ValidationFailed(AnyError),
    #[error("content deserialization failed: {0}")]
    ContentDecode(AnyError),

    #[error("endpoint execution timed out after {after:?}")]
    EndpointTimeout {
        after: Duration,
        cause: Option<AnyError>,
    },
    #[error("request incomplete: no frame received within {after:?}")]
    IncompleteRequest { after: Duration },
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("proxy target resolution failed: {0}")]
    TargetResolution(AnyError),
    #[error("downstream connect failed: {0}")]
    DownstreamConnect(AnyError),
    #[error("downstream write failed: {0}")]
    DownstreamWrite(io::Error),
    #[error("downstream read failed: {0}")]
    DownstreamRead(io::Error),
    #[error("downstream closed before the response completed")]
    DownstreamClosed,
    #[error("too many open connections (limit {limit})")]
    OverCapacity { limit: usize },

    #[error("multiple endpoints match path {path}: {patterns:?}")]
    AmbiguousRoute { path: String, patterns: Vec<String> },
    #[error("endpoint execution panicked")]
    EndpointPanic,
    #[error("invalid pipeline state: {0}")]
    InvalidPipelineState(&'static str),
    #[error(transparent)]
    Unhandled(#[from] AnyError),
}

impl ServerError {
    pub fn class(&self) -> ErrorClass {
        use ServerError::*;
        match self {
            MalformedRequest(_) | RequestTooBig { .. } | PathNotFound { .. }
            | MethodNotAllowed { .. } | ValidationFailed(_) | ContentDecode(_) => {
                ErrorClass::Client
            }
            EndpointTimeout { .. } | IncompleteRequest { .. } | CircuitOpen(_)
            | TargetResolution(_) | DownstreamConnect(_) | DownstreamWrite(_)
            | DownstreamRead(_) | DownstreamClosed | OverCapacity { .. } => ErrorClass::Infra,
            AmbiguousRoute { .. } | EndpointPanic | InvalidPipelineState(_) | Unhandled(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Status code the error response carries.
    pub fn status(&self) -> StatusCode {
        use ServerError::*;
        match self {
            MalformedRequest(_) | ValidationFailed(_) | ContentDecode(_) => {
                StatusCode::BAD_REQUEST
            }
            RequestTooBig { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PathNotFound { .. } => StatusCode::NOT_FOUND,
            MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            IncompleteRequest { .. } => StatusCode::REQUEST_TIMEOUT,
            EndpointTimeout { .. } | CircuitOpen(_) | OverCapacity { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DownstreamConnect(_) | DownstreamWrite(_) | DownstreamRead(_) | DownstreamClosed => {
                StatusCode::BAD_GATEWAY
            }
            TargetResolution(_) | AmbiguousRoute { .. } | EndpointPanic
            | InvalidPipelineState(_) | Unhandled(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the connection must be closed once the error response has been
    /// sent. True for errors that leave the inbound stream unsynchronized or
    /// the process over capacity.
    pub fn force_close(&self) -> bool {
        use ServerError::*;
        matches!(
            self,
            MalformedRequest(_)
                | RequestTooBig { .. }
                | IncompleteRequest { .. }
                | OverCapacity { .. }
                | InvalidPipelineState(_)
        )
    }
}

/// Generates a new opaque error id, attached to error responses via the
/// `error_uid` header and echoed in logs so the two can be correlated.
pub fn new_error_uid() -> String {
    format!("{:032x}", rand::random::<u128>())
}
