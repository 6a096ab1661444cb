//! Streaming reverse proxy.
//!
//! A proxied cycle never accumulates the request: the endpoint resolves a
//! [`ProxyTarget`], the breaker is consulted, a connection is opened, and
//! request frames stream through in arrival order while response frames
//! stream back. Frames that arrive before the downstream is ready wait in a
//! FIFO so ordering survives the connect latency. All awaiting happens on
//! spawned writer/reader tasks; the stage itself only advances the machine
//! when their events come back through the loop.

pub mod connect;

use std::{collections::VecDeque, rc::Rc, time::Instant};

use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use gantry_core::{
    breaker::CircuitBreaker,
    endpoint::{EndpointKind, ProxyTarget},
    error::{ErrorClass, ServerError},
    frame::{BodyChunk, RequestFrame, ResponseFrame, ResponseHead},
    http::ResponseModel,
};
use http::StatusCode;
use tracing::{debug, warn};

use crate::pipeline::{DriverHandle, PipelineEvent, Stage, StageCx, Verdict};

use connect::{DownstreamConnector, DownstreamReader, DownstreamWriter};

/// Request attribute recording how long the downstream took, in milliseconds.
pub const DOWNSTREAM_ELAPSED_ATTR: &str = "proxy.downstream_elapsed_ms";

/// Progress reports from the proxy's spawned tasks, carried inside
/// [`PipelineEvent::Proxy`]. Payload-bearing variants use `Option` slots the
/// same way frame events do.
pub enum ProxyEvent {
    /// The endpoint resolved (or failed to resolve) the target.
    TargetReady(Option<Result<ProxyTarget, ServerError>>),
    /// The connect task finished.
    Connected(Option<Result<DownstreamHandle, ServerError>>),
    /// Downstream response head arrived.
    DownstreamHead(Option<ResponseHead>),
    /// Downstream response body chunk arrived.
    DownstreamContent(Option<BodyChunk>),
    /// Downstream response completed, possibly with final bytes.
    DownstreamLast(Option<BodyChunk>),
    /// The downstream connection failed.
    Failed(Option<ServerError>),
}

/// Sends request frames to the writer task.
pub struct DownstreamHandle {
    tx: UnboundedSender<RequestFrame>,
}

impl DownstreamHandle {
    /// Hands a frame to the writer. Releases the payload and reports false
    /// when the writer is gone.
    pub fn send(&self, frame: RequestFrame) -> bool {
        match self.tx.unbounded_send(frame) {
            Ok(()) => true,
            Err(e) => {
                e.into_inner().release_payload();
                false
            }
        }
    }

    pub fn close(&self) {
        self.tx.close_channel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyStep {
    Resolving,
    Connecting,
    Streaming,
    Done,
    Failed,
}

/// Per-cycle proxy machine, held on the connection while a proxied request
/// is in flight.
pub struct ProxyCycle {
    step: ProxyStep,
    started: Instant,
    /// Frames waiting for the downstream connection.
    pending: VecDeque<RequestFrame>,
    downstream: Option<DownstreamHandle>,
    request_complete: bool,
    status: Option<StatusCode>,
    breaker: Option<Rc<dyn CircuitBreaker>>,
    breaker_fed: bool,
}

impl ProxyCycle {
    fn new() -> Self {
        ProxyCycle {
            step: ProxyStep::Resolving,
            started: Instant::now(),
            pending: VecDeque::new(),
            downstream: None,
            request_complete: false,
            status: None,
            breaker: None,
            breaker_fed: false,
        }
    }

    /// Closes the downstream and releases anything still queued.
    fn shutdown(&mut self) {
        if let Some(handle) = self.downstream.take() {
            handle.close();
        }
        for frame in self.pending.drain(..) {
            frame.release_payload();
        }
    }

    fn forward(&mut self, frame: RequestFrame) {
        match (&self.step, &self.downstream) {
            (ProxyStep::Streaming, Some(handle)) => {
                if !handle.send(frame) {
                    // the writer task already posted the failure
                    warn!("downstream writer gone; dropping request frame");
                }
            }
            (ProxyStep::Failed | ProxyStep::Done, _) => frame.release_payload(),
            _ => self.pending.push_back(frame),
        }
    }
}

impl Drop for ProxyCycle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct ProxyStreamingStage<C> {
    connector: Rc<C>,
}

impl<C> ProxyStreamingStage<C> {
    pub fn new(connector: C) -> Self {
        ProxyStreamingStage {
            connector: Rc::new(connector),
        }
    }
}

impl<C> ProxyStreamingStage<C>
where
    C: DownstreamConnector + 'static,
{
    /// Marks the cycle failed, feeds the breaker once, and raises the error.
    /// Later failure reports for the same cycle are swallowed.
    fn fail(cycle: &mut ProxyCycle, err: ServerError) -> Result<Verdict, ServerError> {
        if matches!(cycle.step, ProxyStep::Failed | ProxyStep::Done) {
            debug!(error = %err, "late proxy failure report; already settled");
            return Ok(Verdict::Suspend);
        }
        cycle.step = ProxyStep::Failed;
        cycle.shutdown();
        if !cycle.breaker_fed {
            cycle.breaker_fed = true;
            // short-circuited calls never count against the breaker
            if !matches!(err, ServerError::CircuitOpen(_)) && err.class() == ErrorClass::Infra {
                if let Some(breaker) = &cycle.breaker {
                    breaker.on_failure(&err);
                }
            }
        }
        Err(err)
    }

    fn spawn_connect(&self, target: ProxyTarget, handle: DriverHandle) {
        let connector = self.connector.clone();
        handle.clone().spawn(async move {
            match connector.connect(&target).await {
                Ok((writer, reader)) => {
                    let (tx, rx) = unbounded();
                    monoio::spawn(writer_loop(writer, rx, handle.clone()));
                    monoio::spawn(reader_loop(reader, handle.clone()));
                    handle.post(PipelineEvent::Proxy(ProxyEvent::Connected(Some(Ok(
                        DownstreamHandle { tx },
                    )))));
                }
                Err(e) => {
                    handle.post(PipelineEvent::Proxy(ProxyEvent::Connected(Some(Err(e)))));
                }
            }
        });
    }
}

impl<C> Stage for ProxyStreamingStage<C>
where
    C: DownstreamConnector + 'static,
{
    fn name(&self) -> &'static str {
        "proxy-streaming"
    }

    fn on_event(
        &self,
        ev: &mut PipelineEvent,
        cx: &mut StageCx<'_>,
    ) -> Result<Verdict, ServerError> {
        match ev {
            PipelineEvent::Head(_) => {
                let Some(entry) = cx.state.endpoint.clone() else {
                    return Ok(Verdict::Continue);
                };
                let EndpointKind::Proxy(endpoint) = &entry.kind else {
                    return Ok(Verdict::Continue);
                };
                let Some(req) = cx.state.request.clone() else {
                    return Err(ServerError::InvalidPipelineState("proxy before head"));
                };
                *cx.proxy = Some(ProxyCycle::new());
                // head-only validators run before the target is resolved
                let prework = std::mem::take(&mut cx.state.prework);
                let endpoint = endpoint.clone();
                let handle = cx.handle.clone();
                handle.clone().spawn(async move {
                    let result = async {
                        for segment in prework {
                            segment(req.clone()).await?;
                        }
                        endpoint
                            .target(req)
                            .await
                            .map_err(ServerError::TargetResolution)
                    }
                    .await;
                    handle.post(PipelineEvent::Proxy(ProxyEvent::TargetReady(Some(result))));
                });
                Ok(Verdict::Continue)
            }
            PipelineEvent::Content(slot) => {
                let Some(cycle) = cx.proxy.as_mut() else {
                    return Ok(Verdict::Continue);
                };
                if let Some(chunk) = slot.take() {
                    cycle.forward(RequestFrame::Content(chunk));
                }
                Ok(Verdict::Continue)
            }
            PipelineEvent::Last(slot) => {
                let Some(cycle) = cx.proxy.as_mut() else {
                    return Ok(Verdict::Continue);
                };
                cycle.request_complete = true;
                cycle.forward(RequestFrame::Last(slot.take()));
                Ok(Verdict::Continue)
            }
            PipelineEvent::Proxy(ProxyEvent::TargetReady(slot)) => {
                let Some(result) = slot.take() else {
                    return Ok(Verdict::Continue);
                };
                let Some(cycle) = cx.proxy.as_mut() else {
                    return Ok(Verdict::Suspend);
                };
                let target = match result {
                    Ok(t) => t,
                    Err(e) => return Self::fail(cycle, e),
                };
                cycle.breaker = cx.shared.breakers.resolve(&target.breaker);
                if let Some(breaker) = &cycle.breaker {
                    if let Err(open) = breaker.check() {
                        return Self::fail(cycle, ServerError::CircuitOpen(open));
                    }
                }
                debug!(host = %target.host, port = target.port, "proxy target resolved");
                let child = cx
                    .state
                    .current_span()
                    .map(|p| cx.shared.tracer.start_child_span(p, "downstream-call"));
                if let Some(span) = child {
                    cx.state.spans.push(span);
                }
                // the rewritten head leads the downstream stream
                cycle.pending.push_front(RequestFrame::Head(target.head.clone()));
                cycle.step = ProxyStep::Connecting;
                self.spawn_connect(target, cx.handle.clone());
                Ok(Verdict::Suspend)
            }
            PipelineEvent::Proxy(ProxyEvent::Connected(slot)) => {
                let Some(result) = slot.take() else {
                    return Ok(Verdict::Continue);
                };
                let Some(cycle) = cx.proxy.as_mut() else {
                    if let Ok(handle) = result {
                        handle.close();
                    }
                    return Ok(Verdict::Suspend);
                };
                let handle = match result {
                    Ok(h) => h,
                    Err(e) => return Self::fail(cycle, e),
                };
                if cycle.step != ProxyStep::Connecting {
                    handle.close();
                    return Ok(Verdict::Suspend);
                }
                cycle.step = ProxyStep::Streaming;
                for frame in cycle.pending.drain(..) {
                    if !handle.send(frame) {
                        break;
                    }
                }
                cycle.downstream = Some(handle);
                Ok(Verdict::Suspend)
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamHead(slot)) => {
                let Some(cycle) = cx.proxy.as_mut() else {
                    slot.take();
                    return Ok(Verdict::Suspend);
                };
                if cycle.step != ProxyStep::Streaming {
                    slot.take();
                    return Ok(Verdict::Suspend);
                }
                let Some(head) = slot.take() else {
                    return Ok(Verdict::Continue);
                };
                cycle.status = Some(head.status);
                cx.state.response = Some(ResponseModel::chunked_from(&head));
                // the sender takes it from here
                Ok(Verdict::Continue)
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamContent(slot)) => {
                if cx
                    .proxy
                    .as_ref()
                    .map(|c| c.step == ProxyStep::Streaming)
                    .unwrap_or(false)
                {
                    Ok(Verdict::Continue)
                } else {
                    if let Some(c) = slot.take() {
                        c.release();
                    }
                    Ok(Verdict::Suspend)
                }
            }
            PipelineEvent::Proxy(ProxyEvent::DownstreamLast(slot)) => {
                let Some(cycle) = cx.proxy.as_mut() else {
                    if let Some(c) = slot.take() {
                        c.release();
                    }
                    return Ok(Verdict::Suspend);
                };
                if cycle.step != ProxyStep::Streaming {
                    if let Some(c) = slot.take() {
                        c.release();
                    }
                    return Ok(Verdict::Suspend);
                }
                cycle.step = ProxyStep::Done;
                if !cycle.breaker_fed {
                    cycle.breaker_fed = true;
                    if let (Some(breaker), Some(status)) = (&cycle.breaker, cycle.status) {
                        breaker.on_success(status);
                    }
                }
                if let Some(req) = &cx.state.request {
                    req.set_attr(
                        DOWNSTREAM_ELAPSED_ATTR,
                        cycle.started.elapsed().as_millis().to_string(),
                    );
                }
                if let Some(handle) = cycle.downstream.take() {
                    handle.close();
                }
                Ok(Verdict::Continue)
            }
            PipelineEvent::Proxy(ProxyEvent::Failed(slot)) => {
                let Some(err) = slot.take() else {
                    return Ok(Verdict::Continue);
                };
                let Some(cycle) = cx.proxy.as_mut() else {
                    debug!(error = %err, "proxy failure after cycle ended");
                    return Ok(Verdict::Suspend);
                };
                Self::fail(cycle, err)
            }
            PipelineEvent::ConnectionTeardown => {
                if let Some(cycle) = cx.proxy.as_mut() {
                    cycle.shutdown();
                }
                Ok(Verdict::Continue)
            }
            _ => Ok(Verdict::Continue),
        }
    }
}

async fn writer_loop<W>(mut writer: W, mut rx: UnboundedReceiver<RequestFrame>, handle: DriverHandle)
where
    W: DownstreamWriter,
{
    while let Some(frame) = rx.next().await {
        let write = async {
            writer.write_frame(frame).await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            let _ = handle.post(PipelineEvent::Proxy(ProxyEvent::Failed(Some(
                ServerError::DownstreamWrite(e),
            ))));
            // drain what the loop will never write
            while let Ok(Some(frame)) = rx.try_next() {
                frame.release_payload();
            }
            return;
        }
    }
}

async fn reader_loop<R>(mut reader: R, handle: DriverHandle)
where
    R: DownstreamReader,
{
    loop {
        match reader.next_frame().await {
            Ok(Some(ResponseFrame::Headers(head))) => {
                if !handle.post(PipelineEvent::Proxy(ProxyEvent::DownstreamHead(Some(head)))) {
                    return;
                }
            }
            Ok(Some(ResponseFrame::Content(chunk))) => {
                if !handle.post(PipelineEvent::Proxy(ProxyEvent::DownstreamContent(Some(
                    chunk,
                )))) {
                    return;
                }
            }
            Ok(Some(ResponseFrame::Last(chunk))) => {
                let _ = handle.post(PipelineEvent::Proxy(ProxyEvent::DownstreamLast(chunk)));
                return;
            }
            Ok(None) => {
                let _ = handle.post(PipelineEvent::Proxy(ProxyEvent::Failed(Some(
                    ServerError::DownstreamClosed,
                ))));
                return;
            }
            Err(e) => {
                let _ = handle.post(PipelineEvent::Proxy(ProxyEvent::Failed(Some(
                    ServerError::DownstreamRead(e),
                ))));
                return;
            }
        }
    }
}
