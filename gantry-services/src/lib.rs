//! Pipeline implementation for gantry.
//!
//! The crate wires the abstractions from `gantry-core` into a working
//! per-connection processing pipeline: a staged event chain driven by a
//! single-threaded connection loop, a pattern router, endpoint execution with
//! timeouts, a streaming reverse proxy, response assembly, and cycle
//! finalization with deferred trace/metrics/access-log emission.
//!
//! Entry points:
//! - [`pipeline::PipelineBuilder`] assembles a [`pipeline::Pipeline`] from
//!   endpoints, listeners and config.
//! - [`frontend::PipelineCoreService`] runs the pipeline over a framed
//!   transport as a `service_async` service.
//! - [`serve::serve`] is a minimal accept loop for embedders without their
//!   own.

pub mod frontend;
pub mod observability;
pub mod pipeline;
pub mod proxy;
pub mod sender;
pub mod serve;
pub mod stages;
