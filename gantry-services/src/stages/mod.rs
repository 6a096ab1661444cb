//! The standard stage set, in chain order: cycle setup, trace start,
//! routing, security validation, content deserialization, endpoint
//! execution, proxy streaming (see [`crate::proxy`]), error handling,
//! sending, finalization.

pub mod content;
pub mod cycle_setup;
pub mod error_handling;
pub mod execute;
pub mod finalize;
pub mod routing;
pub mod security;
pub mod send;
pub mod trace_start;
