//! Security validation.
//!
//! Validators run before the endpoint, whatever kind routing selected: for
//! buffered endpoints on the execution task once the request is complete,
//! for proxied requests against the head before the downstream target is
//! resolved. This stage only schedules them; failures surface as 400s
//! through the normal error path.

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use gantry_core::{error::ServerError, http::RequestModel, AnyResult};

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

pub trait RequestValidator {
    fn name(&self) -> &'static str;

    fn validate(&self, req: &RequestModel) -> LocalBoxFuture<'_, AnyResult<()>>;
}

pub struct SecurityStage {
    validators: Vec<Rc<dyn RequestValidator>>,
}

impl SecurityStage {
    pub fn new(validators: Vec<Rc<dyn RequestValidator>>) -> Self {
        SecurityStage { validators }
    }
}

impl Stage for SecurityStage {
    fn name(&self) -> &'static str {
        "security"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        if !matches!(ev, PipelineEvent::Head(_)) || self.validators.is_empty() {
            return Ok(Verdict::Continue);
        }
        if cx.state.endpoint.is_none() {
            return Ok(Verdict::Continue);
        }
        for validator in &self.validators {
            let validator = validator.clone();
            cx.state.prework.push(Box::new(move |req| {
                Box::pin(async move {
                    validator
                        .validate(&req)
                        .await
                        .map_err(ServerError::ValidationFailed)
                })
            }));
        }
        Ok(Verdict::Continue)
    }
}
