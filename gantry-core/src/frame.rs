//! Frame-level message model.
//!
//! The pipeline does not parse wire bytes itself. An embedder-supplied codec
//! turns the transport into [`RequestFrame`]s and accepts [`ResponseFrame`]s;
//! the pipeline only ever sees these. Every request is delivered as a head
//! frame, zero or more content frames, and exactly one last frame (which may
//! itself carry the final bytes).
//!
//! Body payloads travel as [`BodyChunk`]s. A chunk can be tracked by a
//! [`ChunkLedger`]; whichever pipeline component consumes the chunk must call
//! [`BodyChunk::release`], and a tracked chunk dropped without release counts
//! as a leak. Tests use the ledger to prove no payload is dropped on the
//! floor, mirroring refcount accounting in pooled-buffer runtimes.

use std::{cell::Cell, future::Future, io, rc::Rc};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};

/// Head of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        RequestHead {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Path component of the request target, without the query string.
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// Head of an outbound response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        ResponseHead {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

#[derive(Debug)]
pub enum RequestFrame {
    Head(RequestHead),
    Content(BodyChunk),
    /// End of the request. May carry trailing bytes.
    Last(Option<BodyChunk>),
}

impl RequestFrame {
    pub fn is_last(&self) -> bool {
        matches!(self, RequestFrame::Last(_))
    }

    /// Releases any tracked payload the frame carries. Used when a frame is
    /// discarded instead of forwarded.
    pub fn release_payload(self) {
        match self {
            RequestFrame::Content(c) | RequestFrame::Last(Some(c)) => {
                c.release();
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
pub enum ResponseFrame {
    Headers(ResponseHead),
    Content(BodyChunk),
    /// End of the response. May carry the final bytes.
    Last(Option<BodyChunk>),
}

impl ResponseFrame {
    pub fn is_last(&self) -> bool {
        matches!(self, ResponseFrame::Last(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResponseFrame::Headers(_) => "headers",
            ResponseFrame::Content(_) => "content",
            ResponseFrame::Last(_) => "last",
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            ResponseFrame::Content(c) | ResponseFrame::Last(Some(c)) => c.len(),
            _ => 0,
        }
    }

    pub fn release_payload(self) {
        match self {
            ResponseFrame::Content(c) | ResponseFrame::Last(Some(c)) => {
                c.release();
            }
            _ => {}
        }
    }
}

/// Pull side of the connection: yields inbound frames until EOF.
pub trait FrameSource {
    fn next_frame(&mut self) -> impl Future<Output = io::Result<Option<RequestFrame>>>;
}

/// Push side of the connection: accepts outbound frames in order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: ResponseFrame) -> impl Future<Output = io::Result<()>>;
    fn flush(&mut self) -> impl Future<Output = io::Result<()>>;
}

#[derive(Debug, Default)]
struct LedgerInner {
    live: Cell<usize>,
    released: Cell<usize>,
    leaked: Cell<usize>,
}

/// Accounting for tracked body chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkLedger {
    inner: Rc<LedgerInner>,
}

impl ChunkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks handed out and not yet released or leaked.
    pub fn live(&self) -> usize {
        self.inner.live.get()
    }

    pub fn released(&self) -> usize {
        self.inner.released.get()
    }

    /// Tracked chunks dropped without an explicit release.
    pub fn leaked(&self) -> usize {
        self.inner.leaked.get()
    }
}

#[derive(Debug)]
struct ChunkGuard {
    inner: Rc<LedgerInner>,
    released: bool,
}

impl Drop for ChunkGuard {
    fn drop(&mut self) {
        self.inner.live.set(self.inner.live.get() - 1);
        if self.released {
            self.inner.released.set(self.inner.released.get() + 1);
        } else {
            self.inner.leaked.set(self.inner.leaked.get() + 1);
        }
    }
}

/// A body payload with single-consumer ownership. Exactly one component may
/// release it; everything else sees it by reference.
#[derive(Debug)]
pub struct BodyChunk {
    data: Bytes,
    guard: Option<ChunkGuard>,
}

impl BodyChunk {
    /// An untracked chunk. Dropping it is not an accounting error.
    pub fn new(data: Bytes) -> Self {
        BodyChunk { data, guard: None }
    }

    /// A chunk tracked by `ledger`. Must be consumed via [`Self::release`].
    pub fn tracked(data: Bytes, ledger: &ChunkLedger) -> Self {
        ledger.inner.live.set(ledger.inner.live.get() + 1);
        BodyChunk {
            data,
            guard: Some(ChunkGuard {
                inner: ledger.inner.clone(),
                released: false,
            }),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the chunk, marking it released in its ledger.
    pub fn release(mut self) -> Bytes {
        if let Some(mut guard) = self.guard.take() {
            guard.released = true;
        }
        std::mem::take(&mut self.data)
    }
}
