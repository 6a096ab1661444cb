//! Stock observation interfaces: a tracer that reports through the logging
//! layer, an access-log listener, and an in-process metrics counter.

use std::cell::Cell;

use gantry_core::{
    observe::{LifecycleEvent, LifecycleListener},
    trace::{new_span_id, B3Headers, Span, Tracer},
};
use tracing::{debug, info, warn};

/// Tracer that emits spans as log lines instead of shipping them to a
/// collector. Inherited B3 identifiers are continued, so the ids line up
/// with whatever the caller's own tracing records.
#[derive(Debug, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn start_root_span(&self, name: &str, inherited: Option<B3Headers>) -> Span {
        let span = match inherited {
            Some(b3) => Span {
                trace_id: b3.trace_id,
                span_id: new_span_id(),
                parent_span_id: Some(b3.span_id),
                name: name.to_string(),
                sampled: b3.sampled.unwrap_or(true),
            },
            None => Span {
                trace_id: new_span_id(),
                span_id: new_span_id(),
                parent_span_id: None,
                name: name.to_string(),
                sampled: true,
            },
        };
        debug!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent = span.parent_span_id.as_deref().unwrap_or("-"),
            name = %span.name,
            "span started"
        );
        span
    }

    fn start_child_span(&self, parent: &Span, name: &str) -> Span {
        let span = parent.child(name);
        debug!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent = parent.span_id.as_str(),
            name = %span.name,
            "span started"
        );
        span
    }

    fn finish_span(&self, span: &Span) {
        debug!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            name = %span.name,
            "span finished"
        );
    }
}

/// Writes one line per completed cycle.
#[derive(Debug, Default)]
pub struct AccessLogListener;

impl LifecycleListener for AccessLogListener {
    fn on_event(&self, event: &LifecycleEvent<'_>) {
        match event {
            LifecycleEvent::RequestReceived(_) => {}
            LifecycleEvent::ResponseSent(s) => {
                info!(
                    target: "access_log",
                    peer = s.peer_addr.as_deref().unwrap_or("-"),
                    method = s.method.as_deref().unwrap_or("-"),
                    path = s.path.as_deref().unwrap_or("-"),
                    status = s.status.unwrap_or(0),
                    request_bytes = s.request_bytes,
                    response_bytes = s.response_bytes,
                    elapsed_ms = s.elapsed.map(|d| d.as_millis() as u64).unwrap_or(0),
                    trace_id = s.trace_id.as_deref().unwrap_or("-"),
                    error_uid = s.error_uid.as_deref().unwrap_or("-"),
                    "request complete"
                );
            }
            LifecycleEvent::ResponseWriteFailed { snapshot: s, error } => {
                warn!(
                    target: "access_log",
                    peer = s.peer_addr.as_deref().unwrap_or("-"),
                    method = s.method.as_deref().unwrap_or("-"),
                    path = s.path.as_deref().unwrap_or("-"),
                    status = s.status.unwrap_or(0),
                    error = %error,
                    trace_id = s.trace_id.as_deref().unwrap_or("-"),
                    "response write failed"
                );
            }
        }
    }
}

/// Per-thread request counters. Connections on one thread share an instance;
/// embedders aggregate across threads themselves.
#[derive(Debug, Default)]
pub struct MetricsListener {
    requests_received: Cell<u64>,
    responses_sent: Cell<u64>,
    write_failures: Cell<u64>,
    request_bytes: Cell<u64>,
    response_bytes: Cell<u64>,
}

impl MetricsListener {
    pub fn requests_received(&self) -> u64 {
        self.requests_received.get()
    }

    pub fn responses_sent(&self) -> u64 {
        self.responses_sent.get()
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.get()
    }

    pub fn request_bytes(&self) -> u64 {
        self.request_bytes.get()
    }

    pub fn response_bytes(&self) -> u64 {
        self.response_bytes.get()
    }
}

impl LifecycleListener for MetricsListener {
    fn on_event(&self, event: &LifecycleEvent<'_>) {
        match event {
            LifecycleEvent::RequestReceived(_) => {
                self.requests_received.set(self.requests_received.get() + 1);
            }
            LifecycleEvent::ResponseSent(s) => {
                self.responses_sent.set(self.responses_sent.get() + 1);
                self.request_bytes.set(self.request_bytes.get() + s.request_bytes);
                self.response_bytes
                    .set(self.response_bytes.get() + s.response_bytes);
            }
            LifecycleEvent::ResponseWriteFailed { .. } => {
                self.write_failures.set(self.write_failures.get() + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use gantry_core::observe::CycleSnapshot;

    use super::*;

    #[test]
    fn metrics_count_lifecycle_events() {
        let metrics = MetricsListener::default();
        let snapshot = CycleSnapshot {
            request_bytes: 10,
            response_bytes: 25,
            ..Default::default()
        };

        metrics.on_event(&LifecycleEvent::RequestReceived(&snapshot));
        metrics.on_event(&LifecycleEvent::ResponseSent(&snapshot));
        metrics.on_event(&LifecycleEvent::ResponseWriteFailed {
            snapshot: &snapshot,
            error: "broken pipe",
        });

        assert_eq!(metrics.requests_received(), 1);
        assert_eq!(metrics.responses_sent(), 1);
        assert_eq!(metrics.write_failures(), 1);
        assert_eq!(metrics.request_bytes(), 10);
        assert_eq!(metrics.response_bytes(), 25);
    }

    #[test]
    fn log_tracer_continues_inherited_trace() {
        let tracer = LogTracer;
        let span = tracer.start_root_span(
            "GET /users/{id}",
            Some(B3Headers {
                trace_id: "48485a3953bb6124".into(),
                span_id: "b7ad6b7169203331".into(),
                sampled: Some(true),
            }),
        );
        assert_eq!(span.trace_id, "48485a3953bb6124");
        assert_eq!(span.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
        tracer.finish_span(&span);
    }
}
