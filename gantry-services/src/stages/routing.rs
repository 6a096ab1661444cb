//! Route matching.
//!
//! Each endpoint gets its own compiled matcher and every matcher is
//! evaluated per request, so the router can tell "no path matched" (404)
//! from "a path matched but not the method" (405) and can detect the fatal
//! case of several endpoints claiming the same path and method.

use std::rc::Rc;

use gantry_core::{
    endpoint::{EndpointEntry, EndpointRegistry},
    error::ServerError,
    AnyResult,
};
use tracing::debug;

use crate::pipeline::{PipelineEvent, Stage, StageCx, Verdict};

struct CompiledRoute {
    matcher: matchit::Router<()>,
    entry: Rc<EndpointEntry>,
}

pub struct RoutingStage {
    routes: Vec<CompiledRoute>,
}

impl RoutingStage {
    pub fn new(registry: &EndpointRegistry) -> AnyResult<Self> {
        let mut routes = Vec::with_capacity(registry.entries().len());
        for entry in registry.entries() {
            let mut matcher = matchit::Router::new();
            matcher.insert(entry.config.path.clone(), ())?;
            routes.push(CompiledRoute {
                matcher,
                entry: entry.clone(),
            });
        }
        Ok(RoutingStage { routes })
    }

    fn route(
        &self,
        method: &http::Method,
        path: &str,
    ) -> Result<(Rc<EndpointEntry>, Vec<(String, String)>), ServerError> {
        let mut path_matched = false;
        let mut hits: Vec<(&CompiledRoute, Vec<(String, String)>)> = Vec::new();
        for route in &self.routes {
            let Ok(m) = route.matcher.at(path) else {
                continue;
            };
            path_matched = true;
            if !route.entry.allows_method(method) {
                continue;
            }
            let params = m
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            hits.push((route, params));
        }
        match hits.len() {
            0 if path_matched => Err(ServerError::MethodNotAllowed {
                method: method.clone(),
                path: path.to_string(),
            }),
            0 => Err(ServerError::PathNotFound {
                path: path.to_string(),
            }),
            1 => {
                let (route, params) = hits.remove(0);
                Ok((route.entry.clone(), params))
            }
            _ => Err(ServerError::AmbiguousRoute {
                path: path.to_string(),
                patterns: hits
                    .iter()
                    .map(|(r, _)| r.entry.config.path.clone())
                    .collect(),
            }),
        }
    }
}

impl Stage for RoutingStage {
    fn name(&self) -> &'static str {
        "routing"
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
            return Err(ServerError::InvalidPipelineState("routing before head"));
        };
        let (entry, params) = self.route(req.method(), req.path())?;
        debug!(pattern = %entry.config.path, "route matched");
        req.set_route(entry.config.path.clone(), params);
        cx.state.max_body_bytes = entry.max_body(cx.shared.config.max_request_body_bytes);
        // reject early when the declared length already exceeds the ceiling
        if let (Some(limit), Some(declared)) =
            (cx.state.max_body_bytes, req.declared_content_length())
        {
            if declared > limit {
                cx.state.endpoint = Some(entry);
                return Err(ServerError::RequestTooBig { limit });
            }
        }
        cx.state.endpoint = Some(entry);
        Ok(Verdict::Continue)
    }
}
