//! Starts the cycle's root span from inherited B3 headers and emits the
//! request-received event to metrics and access-log listeners.

use gantry_core::{error::ServerError, observe::LifecycleEvent, trace::B3Headers};

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

pub struct TraceStartStage;

impl Stage for TraceStartStage {
    fn name(&self) -> &'static str {
        "trace-start"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        if !matches!(ev, PipelineEvent::Head(_)) {
            return Ok(Verdict::Continue);
        }
        let Some(req) = cx.state.request.clone() else {
            return Err(ServerError::InvalidPipelineState("trace start before head"));
        };
        let inherited = B3Headers::parse(req.headers());
        let name = format!("{} {}", req.method(), req.path());
        let span = cx.shared.tracer.start_root_span(&name, inherited);
        cx.state.spans.push(span);

        let snapshot = cx.state.snapshot(cx.conn.peer_addr.clone());
        let event = LifecycleEvent::RequestReceived(&snapshot);
        for listener in cx.shared.metrics.iter().chain(cx.shared.access_log.iter()) {
            listener.on_event(&event);
        }
        Ok(Verdict::Continue)
    }
}
