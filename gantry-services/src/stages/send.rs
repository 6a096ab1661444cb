//! Hands finished responses to the sender.
//!
//! Full responses (endpoint results and error renderings) go out in one shot
//! once they land on the cycle; proxied responses stream through as their
//! downstream frames arrive. Either way the frames end up on the outbound
//! queue for the driver's write pass.

use gantry_core::error::ServerError;
use tracing::trace;

use crate::{
    pipeline::{PipelineEvent, Stage, StageCx, Verdict},
    proxy::ProxyEvent,
};

pub struct SendStage;

impl Stage for SendStage {
    fn name(&self) -> &'static str {
        "send"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        match ev {
            PipelineEvent::ExecutionComplete(_) | PipelineEvent::Error(_) => {
                if cx.state.response.is_none() || cx.state.response_started() {
                    return Ok(Verdict::Continue);
                }
                cx.shared.sender.send_full(cx.state, cx.conn, cx.out)?;
                Ok(Verdict::Continue)
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamHead(_)) => {
                if cx.state.response.is_none() || cx.state.response_started() {
                    return Ok(Verdict::Continue);
                }
                cx.shared
                    .sender
                    .send_stream_head(cx.state, cx.conn, cx.out)?;
                Ok(Verdict::Continue)
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamContent(slot)) => {
                if let Some(chunk) = slot.take() {
                    cx.shared.sender.send_chunk(cx.state, cx.out, chunk);
                }
                Ok(Verdict::Continue)
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamLast(slot)) => {
                cx.shared.sender.send_last(cx.state, cx.out, slot.take())?;
                Ok(Verdict::Continue)
            }
            _ => Ok(Verdict::Continue),
        }
    }

    fn on_outbound(&self, frame: &gantry_core::frame::ResponseFrame, cx: &mut StageCx<'_>) {
        trace!(
            frame = frame.name(),
            bytes = frame.payload_len(),
            peer = cx.conn.peer_addr.as_deref().unwrap_or("-"),
            "writing response frame"
        );
    }
}
