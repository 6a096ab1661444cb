//! Core abstractions and data model for the gantry request-processing pipeline.
//!
//! This crate defines the pieces the pipeline in `gantry-services` is built
//! from: the frame-level message model, the per-cycle request/response state,
//! endpoint traits, and the pluggable interfaces for serialization, tracing,
//! lifecycle observation and circuit breaking. It contains no I/O of its own.

pub mod breaker;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod http;
pub mod observe;
pub mod serialize;
pub mod state;
pub mod trace;

/// Type alias for a boxed error that can be sent across threads.
pub type AnyError = anyhow::Error;

/// Type alias for a `Result` with a boxed error type.
pub type AnyResult<T, E = AnyError> = Result<T, E>;
