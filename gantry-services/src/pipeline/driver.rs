//! Per-connection event loop.
//!
//! One task reads frames off the source and posts them as events; the loop
//! below is the only place those events (and everything posted by stage
//! tasks) get dispatched, and the only writer of the sink. Outbound frames
//! enqueued during a dispatch are written inline afterwards, in order, and
//! the last frame's write resolution feeds the cycle's [`LastWrite`] machine.
//!
//! [`LastWrite`]: gantry_core::state::LastWrite

use std::{collections::VecDeque, time::Duration};

use futures::StreamExt;
use gantry_core::{
    config::PipelineConfig,
    error::ServerError,
    frame::{FrameSink, FrameSource, RequestFrame},
    state::{CyclePhase, HttpCycleState},
};
use tracing::{debug, info, warn};

use super::{
    handle::DriverHandle, ConnMeta, OutboundQueue, Pipeline, PipelineEvent, StageCx, StageChain,
    ServerShared,
};
use crate::proxy::ProxyCycle;

enum NextEvent {
    Event(PipelineEvent),
    IdleTimeout,
    IncompleteTimeout(Duration),
}

/// Runs a connection to completion. Returns when the peer goes away, a
/// timeout fires, the pipeline decides to close, or a write fails.
pub async fn drive_connection<Src, Snk>(
    pipeline: Pipeline,
    src: Src,
    mut snk: Snk,
    peer_addr: Option<String>,
) where
    Src: FrameSource + 'static,
    Snk: FrameSink,
{
    let Pipeline { shared, chain } = pipeline;
    let (handle, mut rx) = DriverHandle::channel();
    spawn_reader(src, handle.clone());

    let mut state = HttpCycleState::new();
    let mut conn = ConnMeta {
        peer_addr,
        ..Default::default()
    };
    let mut out = OutboundQueue::default();
    let mut proxy: Option<ProxyCycle> = None;
    let mut backlog: VecDeque<PipelineEvent> = VecDeque::new();

    loop {
        let next = next_event(&mut rx, &mut backlog, &state, &shared.config).await;
        let ev = match next {
            NextEvent::Event(ev) => ev,
            NextEvent::IdleTimeout => {
                info!(peer = ?conn.peer_addr, "closing idle connection");
                break;
            }
            NextEvent::IncompleteTimeout(after) => {
                PipelineEvent::Error(ServerError::IncompleteRequest { after })
            }
        };

        match ev {
            PipelineEvent::SourceClosed => {
                conn.source_closed = true;
                match state.phase {
                    CyclePhase::Between => break,
                    CyclePhase::Receiving => {
                        warn!(peer = ?conn.peer_addr, "connection closed mid-request");
                        break;
                    }
                    // finish the in-flight response first
                    CyclePhase::Processing => {}
                }
            }
            PipelineEvent::SourceError(e) => {
                warn!(peer = ?conn.peer_addr, error = %e, "frame source failed");
                conn.source_closed = true;
                if state.phase != CyclePhase::Processing {
                    break;
                }
            }
            // frames of a pipelined next request wait for the current cycle
            ev if ev.is_frame() && state.phase == CyclePhase::Processing => {
                backlog.push_back(ev);
            }
            ev => {
                debug!(event = ev.name(), "dispatching");
                let mut cx = StageCx {
                    state: &mut state,
                    conn: &mut conn,
                    out: &mut out,
                    proxy: &mut proxy,
                    handle: &handle,
                    shared: &shared,
                };
                chain.dispatch(ev, &mut cx);
            }
        }

        if !flush_outbound(
            &chain, &shared, &handle, &mut state, &mut conn, &mut out, &mut proxy, &mut snk,
        )
        .await
        {
            break;
        }

        if state.finalized.is_completed() {
            if conn.force_close || conn.close_after_response || conn.source_closed {
                break;
            }
            state.clean();
            proxy = None;
        }
    }

    // a cycle still in flight gets its observation events before we vanish
    if state.phase != CyclePhase::Between && !state.finalized.is_completed() {
        let mut cx = StageCx {
            state: &mut state,
            conn: &mut conn,
            out: &mut out,
            proxy: &mut proxy,
            handle: &handle,
            shared: &shared,
        };
        chain.dispatch(PipelineEvent::ConnectionTeardown, &mut cx);
    }

    out.clear();
    for ev in backlog.drain(..) {
        ev.release_payload();
    }
    while let Ok(Some(ev)) = rx.try_next() {
        ev.release_payload();
    }
    state.clean();
    drop(proxy);
}

async fn next_event(
    rx: &mut futures::channel::mpsc::UnboundedReceiver<PipelineEvent>,
    backlog: &mut VecDeque<PipelineEvent>,
    state: &HttpCycleState,
    config: &PipelineConfig,
) -> NextEvent {
    if state.phase != CyclePhase::Processing {
        if let Some(ev) = backlog.pop_front() {
            return NextEvent::Event(ev);
        }
    }
    match frame_timeout(state, config) {
        Some(d) => match monoio::time::timeout(d, rx.next()).await {
            Ok(Some(ev)) => NextEvent::Event(ev),
            Ok(None) => NextEvent::Event(PipelineEvent::SourceClosed),
            Err(_) => match state.phase {
                CyclePhase::Between => NextEvent::IdleTimeout,
                _ => NextEvent::IncompleteTimeout(d),
            },
        },
        None => match rx.next().await {
            Some(ev) => NextEvent::Event(ev),
            None => NextEvent::Event(PipelineEvent::SourceClosed),
        },
    }
}

fn frame_timeout(state: &HttpCycleState, config: &PipelineConfig) -> Option<Duration> {
    match state.phase {
        CyclePhase::Between => config.idle_timeout(),
        CyclePhase::Receiving => config.incomplete_request_timeout(),
        // the endpoint timeout governs this phase
        CyclePhase::Processing => None,
    }
}

fn spawn_reader<Src>(mut src: Src, handle: DriverHandle)
where
    Src: FrameSource + 'static,
{
    monoio::spawn(async move {
        loop {
            match src.next_frame().await {
                Ok(Some(frame)) => {
                    let ev = match frame {
                        RequestFrame::Head(h) => PipelineEvent::Head(Some(h)),
                        RequestFrame::Content(c) => PipelineEvent::Content(Some(c)),
                        RequestFrame::Last(c) => PipelineEvent::Last(c),
                    };
                    if !handle.post(ev) {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = handle.post(PipelineEvent::SourceClosed);
                    return;
                }
                Err(e) => {
                    let _ = handle.post(PipelineEvent::SourceError(e));
                    return;
                }
            }
        }
    });
}

/// Writes everything queued, in order. Returns false when the connection is
/// no longer usable.
#[allow(clippy::too_many_arguments)]
async fn flush_outbound<Snk: FrameSink>(
    chain: &StageChain,
    shared: &ServerShared,
    handle: &DriverHandle,
    state: &mut HttpCycleState,
    conn: &mut ConnMeta,
    out: &mut OutboundQueue,
    proxy: &mut Option<ProxyCycle>,
    snk: &mut Snk,
) -> bool {
    let mut wrote_any = false;
    let mut wrote_last = false;
    while let Some(frame) = out.pop() {
        {
            let mut cx = StageCx {
                state: &mut *state,
                conn: &mut *conn,
                out: &mut *out,
                proxy: &mut *proxy,
                handle,
                shared,
            };
            chain.outbound(&frame, &mut cx);
        }
        let is_last = frame.is_last();
        if let Err(e) = snk.write_frame(frame).await {
            return write_failed(chain, shared, handle, state, conn, out, proxy, e);
        }
        wrote_any = true;
        wrote_last |= is_last;
    }
    if wrote_any {
        if let Err(e) = snk.flush().await {
            return write_failed(chain, shared, handle, state, conn, out, proxy, e);
        }
    }
    if wrote_last {
        state.last_write.complete(Ok(()));
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn write_failed(
    chain: &StageChain,
    shared: &ServerShared,
    handle: &DriverHandle,
    state: &mut HttpCycleState,
    conn: &mut ConnMeta,
    out: &mut OutboundQueue,
    proxy: &mut Option<ProxyCycle>,
    error: std::io::Error,
) -> bool {
    warn!(peer = ?conn.peer_addr, error = %error, "response write failed");
    state.last_write.complete(Err(error.to_string()));
    let mut cx = StageCx {
        state: &mut *state,
        conn: &mut *conn,
        out: &mut *out,
        proxy: &mut *proxy,
        handle,
        shared,
    };
    chain.dispatch(PipelineEvent::WriteFailed(error), &mut cx);
    conn.force_close = true;
    out.clear();
    false
}

