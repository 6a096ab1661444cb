//! First stage: resets leftover cycle state on a new head, builds the
//! request model, and accumulates body chunks for standard endpoints (proxy
//! cycles stream instead; their payloads pass through untouched).

use std::time::Instant;

use gantry_core::{
    error::ServerError,
    http::RequestModel,
    state::CyclePhase,
};
use tracing::warn;

use crate::{
    pipeline::{PipelineEvent, Stage, StageCx, Verdict},
    sender::keep_alive_requested,
};

pub struct CycleSetupStage;

impl CycleSetupStage {
    fn proxy_bound(cx: &StageCx<'_>) -> bool {
        cx.state
            .endpoint
            .as_ref()
            .map(|e| e.is_proxy())
            .unwrap_or(false)
    }
}

impl Stage for CycleSetupStage {
    fn name(&self) -> &'static str {
        "cycle-setup"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        match ev {
            PipelineEvent::Head(slot) => {
                let head = slot
                    .take()
                    .ok_or(ServerError::InvalidPipelineState("head frame already consumed"))?;
                // leftover state from an abandoned cycle gets cleared here
                cx.state.clean();
                *cx.proxy = None;
                cx.state.keep_alive_requested = keep_alive_requested(head.version, &head.headers);
                cx.state.request = Some(RequestModel::new(head));
                cx.state.request_received_at = Some(Instant::now());
                cx.state.phase = CyclePhase::Receiving;
                Ok(Verdict::Continue)
            }
            PipelineEvent::Content(slot) => {
                if cx.state.phase != CyclePhase::Receiving {
                    warn!("content frame outside an open request; dropping");
                    if let Some(c) = slot.take() {
                        c.release();
                    }
                    return Ok(Verdict::Suspend);
                }
                if Self::proxy_bound(cx) {
                    // the proxy stage takes the payload
                    return Ok(Verdict::Continue);
                }
                let Some(req) = cx.state.request.clone() else {
                    return Err(ServerError::InvalidPipelineState("content before head"));
                };
                let Some(chunk) = slot.take() else {
                    return Err(ServerError::InvalidPipelineState(
                        "content frame already consumed",
                    ));
                };
                let size = req.append_chunk(chunk);
                if let Some(limit) = cx.state.max_body_bytes {
                    if size > limit {
                        return Err(ServerError::RequestTooBig { limit });
                    }
                }
                Ok(Verdict::Continue)
            }
            PipelineEvent::Last(slot) => {
                if cx.state.phase != CyclePhase::Receiving {
                    warn!("last frame outside an open request; dropping");
                    if let Some(c) = slot.take() {
                        c.release();
                    }
                    return Ok(Verdict::Suspend);
                }
                cx.state.phase = CyclePhase::Processing;
                if Self::proxy_bound(cx) {
                    return Ok(Verdict::Continue);
                }
                let Some(req) = cx.state.request.clone() else {
                    return Err(ServerError::InvalidPipelineState("last frame before head"));
                };
                if let (Some(limit), Some(c)) = (cx.state.max_body_bytes, slot.as_ref()) {
                    if req.body_size() + c.len() > limit {
                        if let Some(c) = slot.take() {
                            c.release();
                        }
                        return Err(ServerError::RequestTooBig { limit });
                    }
                }
                req.finish(slot.take());
                Ok(Verdict::Continue)
            }
            _ => Ok(Verdict::Continue),
        }
    }
}
