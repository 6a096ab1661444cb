//! Accumulated request model.
//!
//! Built from the head frame and grown chunk by chunk until the last frame
//! arrives. Endpoints receive it behind an `Rc`; interior mutability covers
//! the fields the pipeline fills in after construction (route match, body,
//! decoded content). The pipeline is single-threaded per connection, so no
//! borrow is ever held across an await.

use std::{
    any::{type_name, Any},
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;

use crate::{
    frame::{BodyChunk, RequestHead},
    AnyError, AnyResult,
};

/// Decodes a completed request body into a typed value, stored on the request
/// for the endpoint to pick up. Decoding runs at most once per request.
#[derive(Clone)]
pub struct ContentDecoder {
    type_name: &'static str,
    decode: Rc<dyn Fn(&Bytes) -> AnyResult<Rc<dyn Any>>>,
}

impl ContentDecoder {
    pub fn json<T: DeserializeOwned + 'static>() -> Self {
        ContentDecoder {
            type_name: type_name::<T>(),
            decode: Rc::new(|body| {
                serde_json::from_slice::<T>(body)
                    .map(|v| Rc::new(v) as Rc<dyn Any>)
                    .map_err(AnyError::from)
            }),
        }
    }

    pub fn with_fn(
        type_name: &'static str,
        decode: impl Fn(&Bytes) -> AnyResult<Rc<dyn Any>> + 'static,
    ) -> Self {
        ContentDecoder {
            type_name,
            decode: Rc::new(decode),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for ContentDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDecoder")
            .field("type_name", &self.type_name)
            .finish()
    }
}

pub struct RequestModel {
    head: RequestHead,
    matched_pattern: RefCell<Option<String>>,
    path_params: RefCell<Vec<(String, String)>>,
    chunks: RefCell<Vec<BodyChunk>>,
    body_size: Cell<usize>,
    complete: Cell<bool>,
    body: RefCell<Option<Bytes>>,
    content: RefCell<Option<Rc<dyn Any>>>,
    attrs: RefCell<HashMap<String, String>>,
}

impl RequestModel {
    pub fn new(head: RequestHead) -> Rc<Self> {
        Rc::new(RequestModel {
            head,
            matched_pattern: RefCell::new(None),
            path_params: RefCell::new(Vec::new()),
            chunks: RefCell::new(Vec::new()),
            body_size: Cell::new(0),
            complete: Cell::new(false),
            body: RefCell::new(None),
            content: RefCell::new(None),
            attrs: RefCell::new(HashMap::new()),
        })
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Declared Content-Length, if present and parseable.
    pub fn declared_content_length(&self) -> Option<usize> {
        self.head
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// First value of a query parameter, if any.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.head.uri.query()?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }

    pub fn set_route(&self, pattern: String, params: Vec<(String, String)>) {
        *self.matched_pattern.borrow_mut() = Some(pattern);
        *self.path_params.borrow_mut() = params;
    }

    pub fn matched_pattern(&self) -> Option<String> {
        self.matched_pattern.borrow().clone()
    }

    pub fn path_param(&self, name: &str) -> Option<String> {
        self.path_params
            .borrow()
            .iter()
            .find_map(|(k, v)| (k == name).then(|| v.clone()))
    }

    /// Appends a body chunk, returning the accumulated size.
    pub fn append_chunk(&self, chunk: BodyChunk) -> usize {
        let size = self.body_size.get() + chunk.len();
        self.body_size.set(size);
        self.chunks.borrow_mut().push(chunk);
        size
    }

    pub fn body_size(&self) -> usize {
        self.body_size.get()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.get()
    }

    /// Marks the request complete and assembles the body from the buffered
    /// chunks, releasing each of them.
    pub fn finish(&self, trailing: Option<BodyChunk>) {
        if let Some(chunk) = trailing {
            self.body_size.set(self.body_size.get() + chunk.len());
            self.chunks.borrow_mut().push(chunk);
        }
        let chunks = std::mem::take(&mut *self.chunks.borrow_mut());
        let body = match chunks.len() {
            0 => Bytes::new(),
            1 => chunks.into_iter().next().map(BodyChunk::release).unwrap_or_default(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.body_size.get());
                for chunk in chunks {
                    buf.extend_from_slice(&chunk.release());
                }
                buf.freeze()
            }
        };
        *self.body.borrow_mut() = Some(body);
        self.complete.set(true);
    }

    /// Raw body bytes. Empty until [`Self::finish`] has run.
    pub fn body(&self) -> Bytes {
        self.body.borrow().clone().unwrap_or_default()
    }

    /// Runs the decoder over the completed body and stores the result.
    /// A second call with content already present is a no-op.
    pub fn decode_content(&self, decoder: &ContentDecoder) -> AnyResult<()> {
        if self.content.borrow().is_some() {
            return Ok(());
        }
        let body = self.body();
        let decoded = (decoder.decode)(&body)?;
        *self.content.borrow_mut() = Some(decoded);
        Ok(())
    }

    /// Decoded content, if a decoder ran and produced a `T`.
    pub fn content<T: 'static>(&self) -> Option<Rc<T>> {
        let content = self.content.borrow();
        content.as_ref().and_then(|c| c.clone().downcast::<T>().ok())
    }

    pub fn set_attr(&self, key: &str, value: String) {
        self.attrs.borrow_mut().insert(key.to_string(), value);
    }

    pub fn attr(&self, key: &str) -> Option<String> {
        self.attrs.borrow().get(key).cloned()
    }

    /// Releases buffered chunks and drops the assembled body and decoded
    /// content. Called when a cycle ends or is abandoned.
    pub fn release_resources(&self) {
        let chunks = std::mem::take(&mut *self.chunks.borrow_mut());
        for chunk in chunks {
            chunk.release();
        }
        *self.body.borrow_mut() = None;
        *self.content.borrow_mut() = None;
    }
}

impl std::fmt::Debug for RequestModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestModel")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("body_size", &self.body_size.get())
            .field("complete", &self.complete.get())
            .finish()
    }
}
