//! Turns pipeline failures into error responses.
//!
//! This stage is the error entry point of the chain: any stage error is
//! re-dispatched here as an [`PipelineEvent::Error`]. It assigns the cycle's
//! error uid, logs with severity matched to the error class, and replaces the
//! cycle's response with one rendered by the [`ErrorResponder`]. When the
//! original response already has frames on the wire no substitute is
//! possible; the connection is abandoned instead.

use std::rc::Rc;

use gantry_core::{
    error::{new_error_uid, ErrorClass, ServerError},
    http::ResponseModel,
    serialize::error_payload,
};
use tracing::{error, info, warn};

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

/// Maps an error to the response the caller sees. Returning `None` falls back
/// to the built-in rendering.
pub trait ErrorResponder {
    fn render(&self, err: &ServerError, error_uid: &str) -> Option<ResponseModel>;
}

/// Client errors echo their message; everything else gets a generic body so
/// internals never leak. The error uid in both lets operators correlate.
pub struct DefaultErrorResponder;

impl ErrorResponder for DefaultErrorResponder {
    fn render(&self, err: &ServerError, error_uid: &str) -> Option<ResponseModel> {
        let message = match err.class() {
            ErrorClass::Client => err.to_string(),
            ErrorClass::Infra => "the service is temporarily unavailable".to_string(),
            ErrorClass::Fatal => "an internal error occurred".to_string(),
        };
        Some(ResponseModel::full_with_status(
            err.status(),
            error_payload(&message, error_uid),
        ))
    }
}

pub struct ErrorHandlingStage {
    responder: Rc<dyn ErrorResponder>,
}

impl ErrorHandlingStage {
    pub fn new(responder: Rc<dyn ErrorResponder>) -> Self {
        ErrorHandlingStage { responder }
    }
}

impl Stage for ErrorHandlingStage {
    fn name(&self) -> &'static str {
        "error-handling"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        match ev {
            PipelineEvent::Error(err) => {
                let uid = cx
                    .state
                    .error_uid
                    .get_or_insert_with(new_error_uid)
                    .clone();
                cx.state.error_summary = Some(err.to_string());
                match err.class() {
                    ErrorClass::Client => {
                        info!(error_uid = %uid, error = %err, "request rejected")
                    }
                    ErrorClass::Infra => {
                        warn!(error_uid = %uid, error = %err, "request failed")
                    }
                    ErrorClass::Fatal => {
                        error!(error_uid = %uid, error = %err, "request failed fatally")
                    }
                }
                if err.force_close() {
                    cx.conn.force_close = true;
                }

                if cx.state.response_started() {
                    // frames already went out; no substitute response is
                    // possible, so the stream ends where it is
                    error!(
                        error_uid = %uid,
                        "error after response started; abandoning connection"
                    );
                    cx.conn.force_close = true;
                    if !cx.state.response_finished() {
                        cx.state
                            .last_write
                            .complete(Err("response abandoned after error".to_string()));
                    }
                    return Ok(Verdict::Continue);
                }

                let resp = self
                    .responder
                    .render(err, &uid)
                    .unwrap_or_else(|| default_render(err, &uid));
                cx.state.response = Some(resp);
                Ok(Verdict::Continue)
            }
            PipelineEvent::WriteFailed(io_err) => {
                error!(error = %io_err, "response write failed; closing connection");
                cx.conn.force_close = true;
                Ok(Verdict::Continue)
            }
            _ => Ok(Verdict::Continue),
        }
    }
}

fn default_render(err: &ServerError, error_uid: &str) -> ResponseModel {
    ResponseModel::full_with_status(
        err.status(),
        error_payload("an internal error occurred", error_uid),
    )
}
