//! Response model and send-progress machine.

use http::{HeaderMap, StatusCode, Version};

use crate::{frame::ResponseHead, serialize::ResponsePayload};

/// How far response sending has progressed. Transitions are one-way; the
/// sender uses this to stay idempotent when a second response is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseProgress {
    #[default]
    NotStarted,
    HeadersSent,
    FullySent,
}

impl ResponseProgress {
    pub fn started(&self) -> bool {
        !matches!(self, ResponseProgress::NotStarted)
    }

    pub fn finished(&self) -> bool {
        matches!(self, ResponseProgress::FullySent)
    }

    /// Headers are going out. Returns false if they already did.
    pub fn begin(&mut self) -> bool {
        match self {
            ResponseProgress::NotStarted => {
                *self = ResponseProgress::HeadersSent;
                true
            }
            _ => false,
        }
    }

    /// The last frame is going out. Returns false if it already did.
    pub fn finish(&mut self) -> bool {
        match self {
            ResponseProgress::FullySent => false,
            _ => {
                *self = ResponseProgress::FullySent;
                true
            }
        }
    }
}

#[derive(Debug)]
pub enum ResponseBody {
    /// Complete in-memory payload, serialized and sent as one piece.
    Full(ResponsePayload),
    /// Streamed: the head is known, content arrives frame by frame.
    Chunked,
}

/// An endpoint's (or the proxy's) description of the response to send.
/// The sender sanitizes it exactly once before any frame goes out.
#[derive(Debug)]
pub struct ResponseModel {
    pub status: Option<StatusCode>,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Overrides the serializer/request-derived mime type when set.
    pub mime_type: Option<String>,
    pub charset: Option<String>,
    pub cookies: Vec<(String, String)>,
    /// Relayed proxy responses are never compressed; endpoint responses may
    /// be, subject to whatever compression layer sits below the pipeline.
    pub compressible: bool,
    /// Keeps a pre-set Content-Length instead of the measured one. Lets HEAD
    /// endpoints advertise the length a GET would have produced.
    pub preserve_content_length: bool,
    pub progress: ResponseProgress,
    /// Cumulative payload bytes handed to the transport, pre-compression.
    pub uncompressed_bytes: u64,
    pub(crate) sanitized: bool,
}

impl ResponseModel {
    pub fn full(payload: ResponsePayload) -> Self {
        ResponseModel {
            status: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: ResponseBody::Full(payload),
            mime_type: None,
            charset: None,
            cookies: Vec::new(),
            compressible: true,
            preserve_content_length: false,
            progress: ResponseProgress::default(),
            uncompressed_bytes: 0,
            sanitized: false,
        }
    }

    pub fn full_with_status(status: StatusCode, payload: ResponsePayload) -> Self {
        let mut resp = Self::full(payload);
        resp.status = Some(status);
        resp
    }

    /// A chunked response relaying a downstream head. Marked incompressible.
    pub fn chunked_from(head: &ResponseHead) -> Self {
        ResponseModel {
            status: Some(head.status),
            version: head.version,
            headers: head.headers.clone(),
            body: ResponseBody::Chunked,
            mime_type: None,
            charset: None,
            cookies: Vec::new(),
            compressible: false,
            preserve_content_length: false,
            progress: ResponseProgress::default(),
            uncompressed_bytes: 0,
            sanitized: false,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: &str) -> Self {
        if let Ok(v) = http::HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
        self
    }

    pub fn with_mime_type(mut self, mime: &str) -> Self {
        self.mime_type = Some(mime.to_string());
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.body, ResponseBody::Chunked)
    }

    pub fn is_sanitized(&self) -> bool {
        self.sanitized
    }

    /// Marks sanitization done. Only the sender should call this.
    pub fn mark_sanitized(&mut self) {
        self.sanitized = true;
    }
}
