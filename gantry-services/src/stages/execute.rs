//! Endpoint execution.
//!
//! When the last request frame arrives for a standard endpoint, the prework
//! segments and the endpoint future run on a spawned task, raced against a
//! timeout. Whichever side loses is dropped: a finished endpoint cancels the
//! timer, an expired timer cancels the endpoint and manufactures the timeout
//! failure. Exactly one completion event comes back to the loop either way;
//! panics are caught and surface as errors.

use futures::{
    future::{select, Either},
    FutureExt,
};
use gantry_core::{
    endpoint::EndpointKind,
    error::ServerError,
    state::ExecutionState,
};
use std::panic::AssertUnwindSafe;
use tracing::warn;

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

pub struct ExecuteStage;

impl Stage for ExecuteStage {
    fn name(&self) -> &'static str {
        "endpoint-execution"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        match ev {
            PipelineEvent::Last(_) => {
                let Some(entry) = cx.state.endpoint.clone() else {
                    return Ok(Verdict::Continue);
                };
                let EndpointKind::Standard(endpoint) = &entry.kind else {
                    // proxy endpoints stream; the proxy stage owns them
                    return Ok(Verdict::Continue);
                };
                if cx.state.execution != ExecutionState::Idle {
                    return Err(ServerError::InvalidPipelineState(
                        "duplicate execution trigger",
                    ));
                }
                let Some(req) = cx.state.request.clone() else {
                    return Err(ServerError::InvalidPipelineState("execution before head"));
                };
                cx.state.execution = ExecutionState::Running;
                let prework = std::mem::take(&mut cx.state.prework);
                let timeout = entry.timeout(cx.shared.config.endpoint_timeout());
                let endpoint = endpoint.clone();
                let handle = cx.handle.clone();

                handle.clone().spawn(async move {
                    let timeout_cause = endpoint.custom_timeout_cause();
                    let work = async move {
                        for segment in prework {
                            segment(req.clone()).await?;
                        }
                        endpoint.execute(req).await.map_err(ServerError::Unhandled)
                    };
                    let work = Box::pin(AssertUnwindSafe(work).catch_unwind());
                    let result = match timeout {
                        Some(limit) => {
                            let timer = Box::pin(monoio::time::sleep(limit));
                            match select(work, timer).await {
                                // endpoint finished; dropping the timer cancels it
                                Either::Left((Ok(result), _timer)) => result,
                                Either::Left((Err(_panic), _timer)) => {
                                    Err(ServerError::EndpointPanic)
                                }
                                // deadline hit; dropping the work cancels the endpoint
                                Either::Right(((), _work)) => Err(ServerError::EndpointTimeout {
                                    after: limit,
                                    cause: timeout_cause,
                                }),
                            }
                        }
                        // a zero timeout disables the deadline
                        None => match work.await {
                            Ok(result) => result,
                            Err(_panic) => Err(ServerError::EndpointPanic),
                        },
                    };
                    handle.post(PipelineEvent::ExecutionComplete(Some(result)));
                });
                Ok(Verdict::Suspend)
            }
            PipelineEvent::ExecutionComplete(slot) => {
                let Some(result) = slot.take() else {
                    return Ok(Verdict::Continue);
                };
                if cx.state.execution != ExecutionState::Running {
                    warn!("late or duplicate execution completion; discarding");
                    return Ok(Verdict::Suspend);
                }
                cx.state.execution = ExecutionState::Done;
                match result {
                    Ok(resp) => {
                        if cx.state.response.is_some() {
                            return Err(ServerError::InvalidPipelineState(
                                "endpoint produced a second response",
                            ));
                        }
                        cx.state.response = Some(resp);
                        Ok(Verdict::Continue)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(Verdict::Continue),
        }
    }
}
