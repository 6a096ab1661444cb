//! Endpoint traits and the registry the router matches against.

use std::{rc::Rc, time::Duration};

use futures_util::future::LocalBoxFuture;
use http::Method;

use crate::{
    breaker::BreakerChoice,
    frame::RequestHead,
    http::{ContentDecoder, RequestModel, ResponseModel},
    AnyError, AnyResult,
};

/// An endpoint that receives the fully accumulated request and produces a
/// complete response.
pub trait StandardEndpoint {
    fn execute(&self, req: Rc<RequestModel>) -> LocalBoxFuture<'_, AnyResult<ResponseModel>>;

    /// Decoder for the request body, run before execution when present.
    fn content_decoder(&self) -> Option<ContentDecoder> {
        None
    }

    /// Custom cause attached to the timeout error when this endpoint's
    /// execution is cut off.
    fn custom_timeout_cause(&self) -> Option<AnyError> {
        None
    }
}

/// Where a proxied request should go, decided per request. `head` is the
/// rewritten head the downstream receives; the original request frames'
/// payloads follow it unchanged.
#[derive(Debug)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Skip downstream certificate validation. Connector-level concern; the
    /// pipeline only carries it.
    pub relaxed_tls: bool,
    pub head: RequestHead,
    pub breaker: BreakerChoice,
}

/// An endpoint that names a downstream target instead of computing a
/// response. Body frames stream through without accumulation.
pub trait ProxyRouterEndpoint {
    fn target(&self, req: Rc<RequestModel>) -> LocalBoxFuture<'_, AnyResult<ProxyTarget>>;
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Route pattern, e.g. `/users/{id}`.
    pub path: String,
    /// Allowed methods; `None` matches any.
    pub methods: Option<Vec<Method>>,
    pub timeout_override: Option<Duration>,
    pub max_body_override: Option<usize>,
    pub breaker: BreakerChoice,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>) -> Self {
        EndpointConfig {
            path: path.into(),
            methods: None,
            timeout_override: None,
            max_body_override: None,
            breaker: BreakerChoice::Default,
        }
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = Some(methods);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body_override = Some(bytes);
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerChoice) -> Self {
        self.breaker = breaker;
        self
    }
}

pub enum EndpointKind {
    Standard(Rc<dyn StandardEndpoint>),
    Proxy(Rc<dyn ProxyRouterEndpoint>),
}

pub struct EndpointEntry {
    pub config: EndpointConfig,
    pub kind: EndpointKind,
}

impl EndpointEntry {
    pub fn standard(config: EndpointConfig, endpoint: Rc<dyn StandardEndpoint>) -> Self {
        EndpointEntry {
            config,
            kind: EndpointKind::Standard(endpoint),
        }
    }

    pub fn proxy(config: EndpointConfig, endpoint: Rc<dyn ProxyRouterEndpoint>) -> Self {
        EndpointEntry {
            config,
            kind: EndpointKind::Proxy(endpoint),
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        match &self.config.methods {
            None => true,
            Some(methods) => methods.contains(method),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, EndpointKind::Proxy(_))
    }

    /// Execution deadline for this endpoint. `None` means untimed.
    pub fn timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.config.timeout_override.or(default)
    }

    pub fn max_body(&self, global: usize) -> Option<usize> {
        match self.config.max_body_override {
            Some(limit) => Some(limit),
            None => (global != 0).then_some(global),
        }
    }
}

#[derive(Default)]
pub struct EndpointRegistry {
    entries: Vec<Rc<EndpointEntry>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: EndpointEntry) {
        self.entries.push(Rc::new(entry));
    }

    pub fn entries(&self) -> &[Rc<EndpointEntry>] {
        &self.entries
    }
}

/// Adapts an async closure into a [`StandardEndpoint`].
pub struct FnEndpoint<F>(pub F);

impl<F, Fut> StandardEndpoint for FnEndpoint<F>
where
    F: Fn(Rc<RequestModel>) -> Fut,
    Fut: std::future::Future<Output = AnyResult<ResponseModel>> + 'static,
{
    fn execute(&self, req: Rc<RequestModel>) -> LocalBoxFuture<'_, AnyResult<ResponseModel>> {
        Box::pin((self.0)(req))
    }
}

/// Adapts a synchronous closure into a [`StandardEndpoint`]. The closure runs
/// to completion on the connection's thread before the future resolves.
pub struct SyncEndpoint<F>(pub F);

impl<F> StandardEndpoint for SyncEndpoint<F>
where
    F: Fn(Rc<RequestModel>) -> AnyResult<ResponseModel>,
{
    fn execute(&self, req: Rc<RequestModel>) -> LocalBoxFuture<'_, AnyResult<ResponseModel>> {
        let result = (self.0)(req);
        Box::pin(async move { result })
    }
}
