//! Distributed-trace plumbing: B3 header propagation, spans, and the tracer
//! interface the pipeline drives.

use http::HeaderMap;

/// B3 propagation header names (lowercase, as `http` normalizes them).
pub mod b3 {
    pub const TRACE_ID: &str = "x-b3-traceid";
    pub const SPAN_ID: &str = "x-b3-spanid";
    pub const PARENT_SPAN_ID: &str = "x-b3-parentspanid";
    pub const SAMPLED: &str = "x-b3-sampled";
}

#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub sampled: bool,
}

impl Span {
    /// A child span on the same trace, parented to this one.
    pub fn child(&self, name: &str) -> Span {
        Span {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            name: name.to_string(),
            sampled: self.sampled,
        }
    }
}

/// Trace identifiers inherited from the caller's B3 headers.
#[derive(Debug, Clone)]
pub struct B3Headers {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: Option<bool>,
}

impl B3Headers {
    /// Parses inherited trace identifiers. Both the trace id and span id
    /// must be present for the trace to be continued.
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let trace_id = get(b3::TRACE_ID)?;
        let span_id = get(b3::SPAN_ID)?;
        let sampled = get(b3::SAMPLED).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        Some(B3Headers {
            trace_id,
            span_id,
            sampled,
        })
    }
}

/// Generates a 64-bit lower-hex id, the format B3 expects.
pub fn new_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub trait Tracer {
    /// Starts the cycle's root span, continuing the caller's trace when
    /// `inherited` is present.
    fn start_root_span(&self, name: &str, inherited: Option<B3Headers>) -> Span;

    /// Starts a child of `parent` on the same trace.
    fn start_child_span(&self, parent: &Span, name: &str) -> Span {
        parent.child(name)
    }

    fn finish_span(&self, span: &Span);
}

/// Tracer that manufactures spans without reporting them anywhere.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_root_span(&self, name: &str, inherited: Option<B3Headers>) -> Span {
        match inherited {
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
        }
    }

    fn finish_span(&self, _span: &Span) {}
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn inherited_trace_is_continued() {
        let mut headers = HeaderMap::new();
        headers.insert(b3::TRACE_ID, HeaderValue::from_static("48485a3953bb6124"));
        headers.insert(b3::SPAN_ID, HeaderValue::from_static("b7ad6b7169203331"));
        headers.insert(b3::SAMPLED, HeaderValue::from_static("1"));

        let b3 = B3Headers::parse(&headers).unwrap();
        let span = NoopTracer.start_root_span("GET /users/{id}", Some(b3));
        assert_eq!(span.trace_id, "48485a3953bb6124");
        assert_eq!(span.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
        assert_ne!(span.span_id, "b7ad6b7169203331");
        assert!(span.sampled);
    }

    #[test]
    fn missing_span_id_means_fresh_trace() {
        let mut headers = HeaderMap::new();
        headers.insert(b3::TRACE_ID, HeaderValue::from_static("48485a3953bb6124"));
        assert!(B3Headers::parse(&headers).is_none());

        let span = NoopTracer.start_root_span("GET /", None);
        assert_eq!(span.span_id.len(), 16);
        assert!(span.parent_span_id.is_none());
    }

    #[test]
    fn child_spans_stay_on_the_trace() {
        let root = NoopTracer.start_root_span("GET /relay", None);
        let child = NoopTracer.start_child_span(&root, "downstream-call");
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.name, "downstream-call");
    }
}
