//! Per-cycle processing state.
//!
//! One [`HttpCycleState`] lives on each connection and is reset between
//! request/response cycles. The one-shot concerns that used to be easy to
//! double-fire (trace completion, access logging, metrics, finalization) are
//! guarded by explicit [`Completion`] machines, and everything keyed to "the
//! last response frame actually hit the wire" goes through the [`LastWrite`]
//! machine, which holds snapshot-carrying hooks until the write resolves.

use std::{rc::Rc, time::Instant};

use futures_util::future::LocalBoxFuture;
use tracing::warn;

use crate::{
    endpoint::EndpointEntry,
    error::ServerError,
    http::{RequestModel, ResponseModel},
    observe::CycleSnapshot,
    trace::Span,
};

/// Work that must run after the request is complete but before the endpoint
/// executes (validation, content decoding). Segments run in registration
/// order on the execution task.
pub type PreworkSegment =
    Box<dyn FnOnce(Rc<RequestModel>) -> LocalBoxFuture<'static, Result<(), ServerError>>>;

/// Outcome of the final response write, as seen by deferred hooks.
pub type WriteOutcome = Result<(), String>;

/// A hook waiting on the last response write.
pub type WriteHook = Box<dyn FnOnce(&WriteOutcome)>;

/// Where the connection is in its current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    /// No request in flight; the idle timeout applies.
    #[default]
    Between,
    /// Head seen, last frame not yet; the incomplete-request timeout applies.
    Receiving,
    /// Request complete, response not yet finished.
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    Done,
}

/// One-way completion flag for one-shot cycle concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    #[default]
    Pending,
    Completed,
}

impl Completion {
    /// Flips to completed. Returns whether this call did the flip; callers
    /// skip their work when it returns false.
    pub fn complete(&mut self) -> bool {
        match self {
            Completion::Pending => {
                *self = Completion::Completed;
                true
            }
            Completion::Completed => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Completion::Completed)
    }
}

/// How a hook registration was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRegistration {
    /// The last write is in flight; the hook will fire when it resolves.
    Deferred,
    /// The write already resolved; the hook ran inline.
    FiredNow,
    /// Sending never started. The hook ran inline with a success outcome;
    /// callers treat this as an anomaly worth logging.
    FiredEarly,
}

/// Tracks the final response frame from enqueue to write resolution.
pub enum LastWrite {
    NotStarted,
    /// The last frame has been handed to the transport; hooks accumulate
    /// until the write resolves.
    Armed { hooks: Vec<WriteHook> },
    Done { outcome: WriteOutcome },
}

impl Default for LastWrite {
    fn default() -> Self {
        LastWrite::NotStarted
    }
}

impl LastWrite {
    /// Marks the last frame as handed to the transport.
    pub fn arm(&mut self) {
        if matches!(self, LastWrite::NotStarted) {
            *self = LastWrite::Armed { hooks: Vec::new() };
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, LastWrite::Armed { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, LastWrite::Done { .. })
    }

    pub fn register(&mut self, hook: WriteHook) -> HookRegistration {
        match self {
            LastWrite::NotStarted => {
                hook(&Ok(()));
                HookRegistration::FiredEarly
            }
            LastWrite::Armed { hooks } => {
                hooks.push(hook);
                HookRegistration::Deferred
            }
            LastWrite::Done { outcome } => {
                hook(outcome);
                HookRegistration::FiredNow
            }
        }
    }

    /// Resolves the write, firing accumulated hooks in registration order.
    pub fn complete(&mut self, outcome: WriteOutcome) {
        let hooks = match std::mem::replace(self, LastWrite::Done { outcome: outcome.clone() }) {
            LastWrite::Armed { hooks } => hooks,
            LastWrite::NotStarted => Vec::new(),
            LastWrite::Done { outcome: prior } => {
                // keep the first outcome; a second completion is a bug upstream
                warn!("last write completed twice");
                *self = LastWrite::Done { outcome: prior };
                return;
            }
        };
        for hook in hooks {
            hook(&outcome);
        }
    }
}

impl std::fmt::Debug for LastWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LastWrite::NotStarted => write!(f, "LastWrite::NotStarted"),
            LastWrite::Armed { hooks } => write!(f, "LastWrite::Armed({} hooks)", hooks.len()),
            LastWrite::Done { outcome } => write!(f, "LastWrite::Done({outcome:?})"),
        }
    }
}

/// All mutable state for the connection's current request/response cycle.
#[derive(Default)]
pub struct HttpCycleState {
    pub phase: CyclePhase,
    pub request: Option<Rc<RequestModel>>,
    pub request_received_at: Option<Instant>,
    pub keep_alive_requested: bool,
    pub endpoint: Option<Rc<EndpointEntry>>,
    /// Body ceiling resolved at routing time; `None` disables the check.
    pub max_body_bytes: Option<usize>,
    pub prework: Vec<PreworkSegment>,
    pub execution: ExecutionState,
    pub response: Option<ResponseModel>,
    pub spans: Vec<Span>,
    pub error_uid: Option<String>,
    pub error_summary: Option<String>,
    pub trace_completion: Completion,
    pub access_log_completion: Completion,
    pub metrics_completion: Completion,
    pub finalized: Completion,
    pub last_write: LastWrite,
}

impl HttpCycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response_started(&self) -> bool {
        self.response
            .as_ref()
            .map(|r| r.progress.started())
            .unwrap_or(false)
    }

    pub fn response_finished(&self) -> bool {
        self.response
            .as_ref()
            .map(|r| r.progress.finished())
            .unwrap_or(false)
    }

    pub fn current_span(&self) -> Option<&Span> {
        self.spans.last()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.spans.first().map(|s| s.trace_id.as_str())
    }

    /// Captures the cycle for observation events. Taken before resources are
    /// released so deferred hooks report the real numbers.
    pub fn snapshot(&self, peer_addr: Option<String>) -> CycleSnapshot {
        CycleSnapshot {
            trace_id: self.trace_id().map(str::to_string),
            method: self
                .request
                .as_ref()
                .map(|r| r.method().as_str().to_string()),
            path: self.request.as_ref().map(|r| r.path().to_string()),
            matched_pattern: self.request.as_ref().and_then(|r| r.matched_pattern()),
            status: self
                .response
                .as_ref()
                .and_then(|r| r.status)
                .map(|s| s.as_u16()),
            request_bytes: self
                .request
                .as_ref()
                .map(|r| r.body_size() as u64)
                .unwrap_or(0),
            response_bytes: self
                .response
                .as_ref()
                .map(|r| r.uncompressed_bytes)
                .unwrap_or(0),
            error_uid: self.error_uid.clone(),
            peer_addr,
            elapsed: self.request_received_at.map(|t| t.elapsed()),
        }
    }

    /// Resets for the next cycle, releasing anything the previous one still
    /// holds. Safe to call on an already-clean state.
    pub fn clean(&mut self) {
        if let Some(req) = self.request.take() {
            req.release_resources();
        }
        self.phase = CyclePhase::Between;
        self.request_received_at = None;
        self.keep_alive_requested = false;
        self.endpoint = None;
        self.max_body_bytes = None;
        self.prework.clear();
        self.execution = ExecutionState::default();
        self.response = None;
        self.spans.clear();
        self.error_uid = None;
        self.error_summary = None;
        self.trace_completion = Completion::default();
        self.access_log_completion = Completion::default();
        self.metrics_completion = Completion::default();
        self.finalized = Completion::default();
        self.last_write = LastWrite::default();
    }
}
