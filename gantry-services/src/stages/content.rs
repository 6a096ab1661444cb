//! Schedules typed content deserialization for endpoints that want it.
//! Decoding runs on the execution task after validators, and only when the
//! request actually carries a body.

use gantry_core::{endpoint::EndpointKind, error::ServerError};

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

pub struct ContentStage;

impl Stage for ContentStage {
    fn name(&self) -> &'static str {
        "content-deserialization"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        if !matches!(ev, PipelineEvent::Head(_)) {
            return Ok(Verdict::Continue);
        }
        let Some(EndpointKind::Standard(ep)) = cx.state.endpoint.as_ref().map(|e| &e.kind) else {
            return Ok(Verdict::Continue);
        };
        let Some(decoder) = ep.content_decoder() else {
            return Ok(Verdict::Continue);
        };
        cx.state.prework.push(Box::new(move |req| {
            Box::pin(async move {
                if req.body().is_empty() {
                    return Ok(());
                }
                req.decode_content(&decoder)
                    .map_err(ServerError::ContentDecode)
            })
        }));
        Ok(Verdict::Continue)
    }
}
