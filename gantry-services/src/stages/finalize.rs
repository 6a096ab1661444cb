//! End-of-cycle accounting.
//!
//! Runs last in the chain. Once the response is fully enqueued it captures
//! the cycle snapshot, releases request resources, and registers a hook on
//! the last-write machine so tracing, access logging and metrics fire exactly
//! once, after the final frame has actually hit the wire (or failed to).
//! Connection teardown with a cycle still in flight goes through the same
//! path with a failed write outcome.

use std::rc::Rc;

use gantry_core::{
    error::ServerError,
    observe::{CycleSnapshot, LifecycleEvent, LifecycleListener},
    state::{CyclePhase, HookRegistration},
    trace::Span,
};
use tracing::{debug, warn};

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

pub struct FinalizeStage;

impl Stage for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        if matches!(ev, PipelineEvent::ConnectionTeardown) {
            let in_flight = cx.state.phase != CyclePhase::Between || cx.state.response.is_some();
            if in_flight && !cx.state.finalized.is_completed() {
                if !cx.state.last_write.is_done() {
                    cx.state
                        .last_write
                        .complete(Err("connection torn down mid-cycle".to_string()));
                }
                finalize(cx);
            }
            return Ok(Verdict::Continue);
        }

        // backstop: a completed cycle must have produced some response
        if matches!(
            ev,
            PipelineEvent::ExecutionComplete(_) | PipelineEvent::Error(_)
        ) && cx.state.phase == CyclePhase::Processing
            && cx.state.response.is_none()
        {
            return Err(ServerError::InvalidPipelineState(
                "cycle completed without a response",
            ));
        }

        // a started stream whose last write already resolved (normally with
        // a failure) is as done as it will ever get
        let abandoned = cx.state.response_started() && cx.state.last_write.is_done();
        if (cx.state.response_finished() || abandoned) && !cx.state.finalized.is_completed() {
            finalize(cx);
        }
        Ok(Verdict::Continue)
    }
}

/// Snapshot, release, and hand the one-shot observation work to the
/// last-write machine.
fn finalize(cx: &mut StageCx<'_>) {
    if !cx.state.finalized.complete() {
        return;
    }
    let snapshot = cx.state.snapshot(cx.conn.peer_addr.clone());
    if let Some(req) = &cx.state.request {
        req.release_resources();
    }
    debug!(
        status = snapshot.status.unwrap_or(0),
        trace_id = snapshot.trace_id.as_deref().unwrap_or("-"),
        "cycle finalized"
    );

    // each one-shot concern flips its machine now, at registration, so a
    // re-entrant finalization attempt cannot double-register
    let fire_trace = cx.state.trace_completion.complete();
    let fire_metrics = cx.state.metrics_completion.complete();
    let fire_access_log = cx.state.access_log_completion.complete();

    let spans: Vec<Span> = if fire_trace {
        std::mem::take(&mut cx.state.spans)
    } else {
        Vec::new()
    };
    let tracer = cx.shared.tracer.clone();
    let metrics: Vec<Rc<dyn LifecycleListener>> = if fire_metrics {
        cx.shared.metrics.clone()
    } else {
        Vec::new()
    };
    let access_log: Vec<Rc<dyn LifecycleListener>> = if fire_access_log {
        cx.shared.access_log.clone()
    } else {
        Vec::new()
    };

    let registration = cx.state.last_write.register(Box::new(move |outcome| {
        emit(&snapshot, outcome, &metrics, &access_log);
        // innermost span first
        for span in spans.iter().rev() {
            tracer.finish_span(span);
        }
    }));
    if registration == HookRegistration::FiredEarly {
        warn!("finalized before any response frame was sent");
    }
}

fn emit(
    snapshot: &CycleSnapshot,
    outcome: &Result<(), String>,
    metrics: &[Rc<dyn LifecycleListener>],
    access_log: &[Rc<dyn LifecycleListener>],
) {
    let event = match outcome {
        Ok(()) => LifecycleEvent::ResponseSent(snapshot),
        Err(error) => LifecycleEvent::ResponseWriteFailed { snapshot, error },
    };
    for listener in metrics.iter().chain(access_log.iter()) {
        listener.on_event(&event);
    }
}
