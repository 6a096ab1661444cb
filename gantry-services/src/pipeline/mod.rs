//! The staged pipeline: events, stages, the chain, and shared server state.
//!
//! A connection is driven by a single-threaded event loop (see [`driver`]).
//! Each event walks an ordered chain of [`Stage`]s. Stages are synchronous
//! decision units; anything that needs to wait spawns a task which re-enters
//! the loop by posting a new event through the [`handle::DriverHandle`], so
//! no two stage invocations for a connection ever overlap.
//!
//! A stage returning `Err` aborts the walk: the error is wrapped into an
//! [`PipelineEvent::Error`] and re-dispatched at the fixed error entry point,
//! so stages before it never see error traffic and stages after it (sender,
//! finalizer) always do.

pub mod driver;
pub mod handle;

use std::{cell::Cell, collections::VecDeque, rc::Rc};

use gantry_core::{
    breaker::BreakerRegistry,
    config::PipelineConfig,
    endpoint::{EndpointEntry, EndpointRegistry},
    error::ServerError,
    frame::{BodyChunk, RequestHead, ResponseFrame},
    http::ResponseModel,
    observe::LifecycleListener,
    serialize::{JsonSerializer, Serializer},
    state::HttpCycleState,
    trace::Tracer,
    AnyResult,
};
use tracing::error;

use crate::{
    observability::LogTracer,
    proxy::{connect::DownstreamConnector, ProxyCycle, ProxyEvent, ProxyStreamingStage},
    sender::ResponseSender,
    stages::{
        content::ContentStage,
        cycle_setup::CycleSetupStage,
        error_handling::{DefaultErrorResponder, ErrorHandlingStage, ErrorResponder},
        execute::ExecuteStage,
        finalize::FinalizeStage,
        routing::RoutingStage,
        security::{RequestValidator, SecurityStage},
        send::SendStage,
        trace_start::TraceStartStage,
    },
};

pub use handle::DriverHandle;

/// What a stage tells the chain after seeing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the event to the next stage.
    Continue,
    /// Stop the walk; the stage owns the event now (usually because it
    /// spawned work that will post a follow-up event).
    Suspend,
}

/// Events flowing through the chain. Frame payloads sit in `Option`s so the
/// consuming stage can take ownership while the event keeps walking.
pub enum PipelineEvent {
    /// Request head arrived.
    Head(Option<RequestHead>),
    /// Request body chunk arrived.
    Content(Option<BodyChunk>),
    /// Final request frame arrived, possibly with trailing bytes.
    Last(Option<BodyChunk>),
    /// An endpoint execution task finished.
    ExecutionComplete(Option<Result<ResponseModel, ServerError>>),
    /// Proxy machinery progress.
    Proxy(ProxyEvent),
    /// A failure to be turned into an error response.
    Error(ServerError),
    /// A response frame write failed; the connection is going down.
    WriteFailed(std::io::Error),
    /// The connection is closing with a cycle still in flight.
    ConnectionTeardown,
    /// Frame source reached EOF (driver-internal).
    SourceClosed,
    /// Frame source failed (driver-internal).
    SourceError(std::io::Error),
}

impl PipelineEvent {
    pub fn is_frame(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Head(_) | PipelineEvent::Content(_) | PipelineEvent::Last(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Head(_) => "head",
            PipelineEvent::Content(_) => "content",
            PipelineEvent::Last(_) => "last",
            PipelineEvent::ExecutionComplete(_) => "execution-complete",
            PipelineEvent::Proxy(_) => "proxy",
            PipelineEvent::Error(_) => "error",
            PipelineEvent::WriteFailed(_) => "write-failed",
            PipelineEvent::ConnectionTeardown => "connection-teardown",
            PipelineEvent::SourceClosed => "source-closed",
            PipelineEvent::SourceError(_) => "source-error",
        }
    }

    /// Releases any tracked payload still riding in the event. Every path
    /// that drops an event without dispatching it goes through here.
    pub fn release_payload(self) {
        match self {
            PipelineEvent::Content(Some(c)) | PipelineEvent::Last(Some(c)) => {
                c.release();
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamContent(Some(c)))
            | PipelineEvent::Proxy(ProxyEvent::DownstreamLast(Some(c))) => {
                c.release();
            }
            _ => {}
        }
    }
}

/// Per-connection facts outside the request/response cycle.
#[derive(Debug, Default)]
pub struct ConnMeta {
    pub peer_addr: Option<String>,
    /// Set by the sender's keep-alive decision.
    pub close_after_response: bool,
    /// Set when the connection cannot be reused (half-sent response,
    /// unsynchronized inbound stream).
    pub force_close: bool,
    /// The frame source hit EOF; finish in-flight work, then stop.
    pub source_closed: bool,
}

/// Ordered outbound frames awaiting the driver's write pass.
#[derive(Default)]
pub struct OutboundQueue {
    frames: VecDeque<ResponseFrame>,
}

impl OutboundQueue {
    pub fn push(&mut self, frame: ResponseFrame) {
        self.frames.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<ResponseFrame> {
        self.frames.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Releases everything still queued. Used at teardown.
    pub fn clear(&mut self) {
        for frame in self.frames.drain(..) {
            frame.release_payload();
        }
    }
}

/// Everything a stage can reach while handling an event.
pub struct StageCx<'a> {
    pub state: &'a mut HttpCycleState,
    pub conn: &'a mut ConnMeta,
    pub out: &'a mut OutboundQueue,
    pub proxy: &'a mut Option<ProxyCycle>,
    pub handle: &'a DriverHandle,
    pub shared: &'a ServerShared,
}

pub trait Stage {
    fn name(&self) -> &'static str;

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError>;

    /// Observes each outbound frame just before it is written. Called in
    /// reverse chain order.
    fn on_outbound(&self, _frame: &ResponseFrame, _cx: &mut StageCx<'_>) {}
}

/// Immutable state shared by every connection of a server.
pub struct ServerShared {
    pub config: PipelineConfig,
    pub sender: ResponseSender,
    pub tracer: Rc<dyn Tracer>,
    pub metrics: Vec<Rc<dyn LifecycleListener>>,
    pub access_log: Vec<Rc<dyn LifecycleListener>>,
    pub breakers: BreakerRegistry,
    pub open_connections: Cell<usize>,
}

pub struct StageChain {
    stages: Vec<Box<dyn Stage>>,
    error_entry: usize,
}

impl StageChain {
    pub fn new(stages: Vec<Box<dyn Stage>>, error_entry: usize) -> Self {
        debug_assert!(error_entry < stages.len());
        StageChain {
            stages,
            error_entry,
        }
    }

    /// Walks the chain. Error and write-failure events enter at the fixed
    /// error entry; everything else starts at the top.
    pub fn dispatch(&self, mut ev: PipelineEvent, cx: &mut StageCx<'_>) {
        let mut error_pass = matches!(ev, PipelineEvent::Error(_));
        let mut idx = if error_pass || matches!(ev, PipelineEvent::WriteFailed(_)) {
            self.error_entry
        } else {
            0
        };
        while idx < self.stages.len() {
            let stage = &self.stages[idx];
            match stage.on_event(&mut ev, cx) {
                Ok(Verdict::Continue) => idx += 1,
                Ok(Verdict::Suspend) => break,
                Err(err) => {
                    if error_pass {
                        // an error while handling an error: log and drop it
                        error!(
                            stage = stage.name(),
                            error = %err,
                            "error raised during error handling; discarding"
                        );
                        cx.conn.force_close = true;
                        break;
                    }
                    error_pass = true;
                    ev = PipelineEvent::Error(err);
                    idx = self.error_entry;
                }
            }
        }
    }

    /// Outbound observation pass, reverse order.
    pub fn outbound(&self, frame: &ResponseFrame, cx: &mut StageCx<'_>) {
        for stage in self.stages.iter().rev() {
            stage.on_outbound(frame, cx);
        }
    }
}

/// A built pipeline, cheap to clone and share across connections of one
/// thread.
#[derive(Clone)]
pub struct Pipeline {
    pub shared: Rc<ServerShared>,
    pub chain: Rc<StageChain>,
}

/// Assembles a [`Pipeline`] from endpoints, interfaces and config.
pub struct PipelineBuilder {
    config: PipelineConfig,
    registry: EndpointRegistry,
    validators: Vec<Rc<dyn RequestValidator>>,
    serializer: Rc<dyn Serializer>,
    tracer: Rc<dyn Tracer>,
    metrics: Vec<Rc<dyn LifecycleListener>>,
    access_log: Vec<Rc<dyn LifecycleListener>>,
    breakers: BreakerRegistry,
    responder: Rc<dyn ErrorResponder>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        PipelineBuilder {
            config,
            registry: EndpointRegistry::new(),
            validators: Vec::new(),
            serializer: Rc::new(JsonSerializer),
            tracer: Rc::new(LogTracer),
            metrics: Vec::new(),
            access_log: Vec::new(),
            breakers: BreakerRegistry::default(),
            responder: Rc::new(DefaultErrorResponder),
        }
    }

    pub fn endpoint(mut self, entry: EndpointEntry) -> Self {
        self.registry.register(entry);
        self
    }

    pub fn validator(mut self, validator: Rc<dyn RequestValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn serializer(mut self, serializer: Rc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn tracer(mut self, tracer: Rc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn metrics_listener(mut self, listener: Rc<dyn LifecycleListener>) -> Self {
        self.metrics.push(listener);
        self
    }

    pub fn access_log_listener(mut self, listener: Rc<dyn LifecycleListener>) -> Self {
        self.access_log.push(listener);
        self
    }

    pub fn breakers(mut self, breakers: BreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn error_responder(mut self, responder: Rc<dyn ErrorResponder>) -> Self {
        self.responder = responder;
        self
    }

    /// Builds the stage chain. Fails if an endpoint's route pattern does not
    /// compile.
    pub fn build<C>(self, connector: C) -> AnyResult<Pipeline>
    where
        C: DownstreamConnector + 'static,
    {
        let routing = RoutingStage::new(&self.registry)?;
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(CycleSetupStage),
            Box::new(TraceStartStage),
            Box::new(routing),
            Box::new(SecurityStage::new(self.validators)),
            Box::new(ContentStage),
            Box::new(ExecuteStage),
            Box::new(ProxyStreamingStage::new(connector)),
            Box::new(ErrorHandlingStage::new(self.responder)),
            Box::new(SendStage),
            Box::new(FinalizeStage),
        ];
        // errors enter at the error-handling stage
        let error_entry = 7;
        let sender = ResponseSender::new(
            self.serializer,
            self.config.default_mime_type.clone(),
            self.config.default_charset.clone(),
        );
        Ok(Pipeline {
            shared: Rc::new(ServerShared {
                config: self.config,
                sender,
                tracer: self.tracer,
                metrics: self.metrics,
                access_log: self.access_log,
                breakers: self.breakers,
                open_connections: Cell::new(0),
            }),
            chain: Rc::new(StageChain::new(stages, error_entry)),
        })
    }

    /// Matched endpoints, for embedders that want to introspect.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }
}

/// Resolved endpoint binding stored on the cycle. Re-exported for stages.
pub type BoundEndpoint = Rc<EndpointEntry>;
