//! Response assembly and sending.
//!
//! Every outbound response funnels through [`ResponseSender`]: it sanitizes
//! the response exactly once (status default, content-type resolution, trace
//! id header, cookies), serializes full payloads, applies the empty-body
//! status rules, sets Content-Length and the Connection header from the
//! keep-alive decision, and enqueues frames for the driver's write pass.
//! Progress is tracked on the response model, so duplicate send attempts are
//! logged and dropped instead of corrupting the stream.

use std::rc::Rc;

use bytes::Bytes;
use gantry_core::{
    error::{new_error_uid, ServerError},
    frame::{BodyChunk, ResponseFrame, ResponseHead},
    http::{ResponseBody, ResponseModel},
    serialize::{error_payload, ResponsePayload, Serializer},
    state::HttpCycleState,
    trace::{b3, new_span_id},
};
use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE,
        TRANSFER_ENCODING},
    Method, StatusCode, Version,
};
use tracing::{error, warn};

use crate::pipeline::{ConnMeta, OutboundQueue};

pub const CLOSE: &str = "close";
pub const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
pub const KEEPALIVE: &str = "keep-alive";
pub const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);
pub const CHUNKED_VALUE: HeaderValue = HeaderValue::from_static("chunked");

pub const ERROR_UID_HEADER: HeaderName = HeaderName::from_static("error_uid");

/// Whether the peer asked to keep the connection open, per its protocol
/// version's defaults.
pub fn keep_alive_requested(version: Version, headers: &http::HeaderMap) -> bool {
    let conn = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim());
    match version {
        Version::HTTP_10 => matches!(conn, Some(v) if v.eq_ignore_ascii_case(KEEPALIVE)),
        Version::HTTP_09 => false,
        _ => !matches!(conn, Some(v) if v.eq_ignore_ascii_case(CLOSE)),
    }
}

/// Statuses whose responses never carry a body. 101 is exempted so protocol
/// upgrades keep working.
pub fn content_always_empty(status: StatusCode) -> bool {
    (status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS)
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::RESET_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

pub struct ResponseSender {
    serializer: Rc<dyn Serializer>,
    default_mime: String,
    default_charset: String,
}

impl ResponseSender {
    pub fn new(serializer: Rc<dyn Serializer>, default_mime: String, default_charset: String) -> Self {
        ResponseSender {
            serializer,
            default_mime,
            default_charset,
        }
    }

    /// Sends a complete response: serialize, sanitize, enqueue headers plus
    /// the last frame, and arm the last-write machine. A second call for the
    /// same cycle is logged and ignored.
    pub fn send_full(
        &self,
        state: &mut HttpCycleState,
        conn: &mut ConnMeta,
        out: &mut OutboundQueue,
    ) -> Result<(), ServerError> {
        let Some(mut resp) = state.response.take() else {
            return Err(ServerError::InvalidPipelineState("send without a response"));
        };
        if resp.progress.started() {
            warn!("response already sent; dropping duplicate send attempt");
            state.response = Some(resp);
            return Ok(());
        }
        if resp.is_chunked() {
            state.response = Some(resp);
            return Err(ServerError::InvalidPipelineState(
                "chunked response in full send path",
            ));
        }

        let payload = match &resp.body {
            ResponseBody::Full(p) => p,
            ResponseBody::Chunked => unreachable!(),
        };
        let body = match self.serializer.serialize(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                // substitute a generic error payload; the original status is
                // kept and the failure is correlated via error_uid
                let uid = state
                    .error_uid
                    .get_or_insert_with(new_error_uid)
                    .clone();
                error!(error_uid = %uid, error = %e, "payload serialization failed; substituting generic error body");
                if let Ok(v) = HeaderValue::from_str(&uid) {
                    resp.headers.insert(ERROR_UID_HEADER, v);
                }
                let substitute = error_payload("an error occurred serializing the response", &uid);
                match &substitute {
                    ResponsePayload::Json(v) => {
                        Bytes::from(serde_json::to_vec(v).unwrap_or_default())
                    }
                    _ => Bytes::new(),
                }
            }
        };

        self.sanitize(&mut resp, state);
        let status = resp.status.unwrap_or(StatusCode::OK);
        let is_head = state
            .request
            .as_ref()
            .map(|r| r.method() == Method::HEAD)
            .unwrap_or(false);

        let drop_body = content_always_empty(status) || is_head;
        if drop_body {
            if is_head || status == StatusCode::NOT_MODIFIED {
                // HEAD and 304 may advertise the length the representation
                // would have had
                if !resp.headers.contains_key(CONTENT_LENGTH) {
                    insert_content_length(&mut resp, body.len());
                }
            } else {
                resp.headers.remove(CONTENT_LENGTH);
            }
        } else if !(resp.preserve_content_length && resp.headers.contains_key(CONTENT_LENGTH)) {
            insert_content_length(&mut resp, body.len());
        }
        // full responses are never chunk-framed on the wire
        resp.headers.remove(TRANSFER_ENCODING);

        self.apply_connection_header(&mut resp, state, conn);

        resp.progress.begin();
        resp.progress.finish();
        resp.uncompressed_bytes += if drop_body { 0 } else { body.len() as u64 };

        out.push(ResponseFrame::Headers(head_of(&resp)));
        if drop_body || body.is_empty() {
            out.push(ResponseFrame::Last(None));
        } else {
            out.push(ResponseFrame::Last(Some(BodyChunk::new(body))));
        }
        state.last_write.arm();
        state.response = Some(resp);
        Ok(())
    }

    /// Sends the head of a streamed response. Content and last frames follow
    /// via [`Self::send_chunk`] and [`Self::send_last`].
    pub fn send_stream_head(
        &self,
        state: &mut HttpCycleState,
        conn: &mut ConnMeta,
        out: &mut OutboundQueue,
    ) -> Result<(), ServerError> {
        let Some(mut resp) = state.response.take() else {
            return Err(ServerError::InvalidPipelineState("send without a response"));
        };
        if resp.progress.started() {
            warn!("stream head already sent; dropping duplicate");
            state.response = Some(resp);
            return Ok(());
        }
        self.sanitize(&mut resp, state);
        resp.headers.remove(CONTENT_LENGTH);
        resp.headers.insert(TRANSFER_ENCODING, CHUNKED_VALUE);
        self.apply_connection_header(&mut resp, state, conn);
        resp.progress.begin();
        out.push(ResponseFrame::Headers(head_of(&resp)));
        state.response = Some(resp);
        Ok(())
    }

    pub fn send_chunk(&self, state: &mut HttpCycleState, out: &mut OutboundQueue, chunk: BodyChunk) {
        let Some(resp) = state.response.as_mut() else {
            warn!("stream chunk with no response in flight; dropping");
            chunk.release();
            return;
        };
        if !resp.progress.started() || resp.progress.finished() {
            warn!("stream chunk outside the open stream window; dropping");
            chunk.release();
            return;
        }
        resp.uncompressed_bytes += chunk.len() as u64;
        out.push(ResponseFrame::Content(chunk));
    }

    pub fn send_last(
        &self,
        state: &mut HttpCycleState,
        out: &mut OutboundQueue,
        chunk: Option<BodyChunk>,
    ) -> Result<(), ServerError> {
        let Some(resp) = state.response.as_mut() else {
            if let Some(c) = chunk {
                c.release();
            }
            return Err(ServerError::InvalidPipelineState("send without a response"));
        };
        if !resp.progress.finish() {
            warn!("stream already completed; dropping duplicate last frame");
            if let Some(c) = chunk {
                c.release();
            }
            return Ok(());
        }
        if let Some(c) = &chunk {
            resp.uncompressed_bytes += c.len() as u64;
        }
        out.push(ResponseFrame::Last(chunk));
        state.last_write.arm();
        Ok(())
    }

    /// One-shot normalization before any frame goes out.
    fn sanitize(&self, resp: &mut ResponseModel, state: &HttpCycleState) {
        if resp.is_sanitized() {
            return;
        }
        if resp.status.is_none() {
            resp.status = Some(StatusCode::OK);
        }

        // content type: explicit on the model wins, then an existing header,
        // then the serializer/server default
        if resp.mime_type.is_some() || !resp.headers.contains_key(CONTENT_TYPE) {
            let mime = resp
                .mime_type
                .clone()
                .unwrap_or_else(|| self.default_mime_of());
            let charset = resp
                .charset
                .clone()
                .unwrap_or_else(|| self.default_charset.clone());
            let value = format!("{mime}; charset={charset}");
            if let Ok(v) = HeaderValue::from_str(&value) {
                resp.headers.insert(CONTENT_TYPE, v);
            }
        }

        for (name, value) in resp.cookies.drain(..) {
            let cookie = format!("{name}={value}");
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                resp.headers.append(SET_COOKIE, v);
            }
        }

        // every response carries the trace id; synthesize one if the cycle
        // somehow has no span
        let trace_id = match state.trace_id() {
            Some(id) => id.to_string(),
            None => {
                let id = new_span_id();
                warn!(trace_id = %id, "no span on cycle; synthesizing response trace id");
                id
            }
        };
        if let Ok(v) = HeaderValue::from_str(&trace_id) {
            resp.headers.insert(HeaderName::from_static(b3::TRACE_ID), v);
        }

        if let Some(uid) = &state.error_uid {
            if !resp.headers.contains_key(ERROR_UID_HEADER) {
                if let Ok(v) = HeaderValue::from_str(uid) {
                    resp.headers.insert(ERROR_UID_HEADER, v);
                }
            }
        }

        resp.mark_sanitized();
    }

    fn apply_connection_header(
        &self,
        resp: &mut ResponseModel,
        state: &HttpCycleState,
        conn: &mut ConnMeta,
    ) {
        let keep = state.keep_alive_requested && !conn.force_close && !conn.source_closed;
        resp.headers.insert(
            CONNECTION,
            if keep { KEEPALIVE_VALUE } else { CLOSE_VALUE },
        );
        conn.close_after_response = !keep;
    }

    fn default_mime_of(&self) -> String {
        if self.default_mime.is_empty() {
            self.serializer.mime_type().to_string()
        } else {
            self.default_mime.clone()
        }
    }
}

fn insert_content_length(resp: &mut ResponseModel, len: usize) {
    if let Ok(v) = HeaderValue::from_str(&len.to_string()) {
        resp.headers.insert(CONTENT_LENGTH, v);
    }
}

fn head_of(resp: &ResponseModel) -> ResponseHead {
    ResponseHead {
        status: resp.status.unwrap_or(StatusCode::OK),
        version: resp.version,
        headers: resp.headers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use gantry_core::{frame::RequestHead, http::RequestModel, serialize::JsonSerializer};
    use http::HeaderMap;

    use super::*;

    fn sender() -> ResponseSender {
        ResponseSender::new(
            Rc::new(JsonSerializer),
            "application/json".into(),
            "UTF-8".into(),
        )
    }

    fn drain(out: &mut OutboundQueue) -> Vec<ResponseFrame> {
        let mut frames = Vec::new();
        while let Some(f) = out.pop() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn keep_alive_version_defaults() {
        let empty = HeaderMap::new();
        assert!(keep_alive_requested(Version::HTTP_11, &empty));
        assert!(!keep_alive_requested(Version::HTTP_10, &empty));

        let mut close = HeaderMap::new();
        close.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!keep_alive_requested(Version::HTTP_11, &close));

        let mut keep = HeaderMap::new();
        keep.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(keep_alive_requested(Version::HTTP_10, &keep));
    }

    #[test]
    fn empty_body_statuses() {
        assert!(content_always_empty(StatusCode::NO_CONTENT));
        assert!(content_always_empty(StatusCode::NOT_MODIFIED));
        assert!(content_always_empty(StatusCode::CONTINUE));
        assert!(!content_always_empty(StatusCode::SWITCHING_PROTOCOLS));
        assert!(!content_always_empty(StatusCode::OK));
    }

    #[test]
    fn full_send_sets_length_and_keepalive() {
        let mut state = HttpCycleState::new();
        state.keep_alive_requested = true;
        state.response = Some(ResponseModel::full_with_status(
            StatusCode::OK,
            ResponsePayload::Json(serde_json::json!({"ok": true})),
        ));
        let mut conn = ConnMeta::default();
        let mut out = OutboundQueue::default();

        sender().send_full(&mut state, &mut conn, &mut out).unwrap();

        let frames = drain(&mut out);
        assert_eq!(frames.len(), 2);
        let ResponseFrame::Headers(head) = &frames[0] else {
            panic!("expected headers frame");
        };
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(
            head.headers.get(CONTENT_LENGTH).unwrap().to_str().unwrap(),
            "11"
        );
        assert_eq!(head.headers.get(CONNECTION).unwrap(), "keep-alive");
        assert!(head
            .headers
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/json"));
        assert!(head.headers.contains_key(b3::TRACE_ID));
        assert!(frames[1].is_last());
        assert!(!conn.close_after_response);
        assert!(state.last_write.is_armed());
        assert_eq!(state.response.as_ref().unwrap().uncompressed_bytes, 11);
    }

    #[test]
    fn no_content_drops_body_and_length() {
        let mut state = HttpCycleState::new();
        state.keep_alive_requested = true;
        state.response = Some(ResponseModel::full_with_status(
            StatusCode::NO_CONTENT,
            ResponsePayload::Json(serde_json::json!({"ignored": true})),
        ));
        let mut conn = ConnMeta::default();
        let mut out = OutboundQueue::default();

        sender().send_full(&mut state, &mut conn, &mut out).unwrap();

        let frames = drain(&mut out);
        let ResponseFrame::Headers(head) = &frames[0] else {
            panic!("expected headers frame");
        };
        assert!(!head.headers.contains_key(CONTENT_LENGTH));
        assert!(matches!(frames[1], ResponseFrame::Last(None)));
        assert_eq!(state.response.as_ref().unwrap().uncompressed_bytes, 0);
    }

    #[test]
    fn head_request_advertises_length_without_body() {
        let mut state = HttpCycleState::new();
        state.keep_alive_requested = true;
        state.request = Some(RequestModel::new(RequestHead::new(
            Method::HEAD,
            "/users/42".parse().unwrap(),
        )));
        state.response = Some(ResponseModel::full_with_status(
            StatusCode::OK,
            ResponsePayload::Json(serde_json::json!({"id": "42"})),
        ));
        let mut conn = ConnMeta::default();
        let mut out = OutboundQueue::default();

        sender().send_full(&mut state, &mut conn, &mut out).unwrap();

        let frames = drain(&mut out);
        let ResponseFrame::Headers(head) = &frames[0] else {
            panic!("expected headers frame");
        };
        assert_eq!(head.status, StatusCode::OK);
        // the length a GET would have produced, with no body on the wire
        assert_eq!(head.headers.get(CONTENT_LENGTH).unwrap(), "11");
        assert!(matches!(frames[1], ResponseFrame::Last(None)));
        assert_eq!(state.response.as_ref().unwrap().uncompressed_bytes, 0);
    }

    #[test]
    fn not_modified_may_keep_the_representation_length() {
        let mut state = HttpCycleState::new();
        state.keep_alive_requested = true;
        state.response = Some(ResponseModel::full_with_status(
            StatusCode::NOT_MODIFIED,
            ResponsePayload::Json(serde_json::json!({"id": "42"})),
        ));
        let mut conn = ConnMeta::default();
        let mut out = OutboundQueue::default();

        sender().send_full(&mut state, &mut conn, &mut out).unwrap();

        let frames = drain(&mut out);
        let ResponseFrame::Headers(head) = &frames[0] else {
            panic!("expected headers frame");
        };
        assert_eq!(head.headers.get(CONTENT_LENGTH).unwrap(), "11");
        assert!(matches!(frames[1], ResponseFrame::Last(None)));
        assert_eq!(state.response.as_ref().unwrap().uncompressed_bytes, 0);
    }

    #[test]
    fn duplicate_full_send_is_dropped() {
        let mut state = HttpCycleState::new();
        state.response = Some(ResponseModel::full_with_status(
            StatusCode::OK,
            ResponsePayload::Empty,
        ));
        let mut conn = ConnMeta::default();
        let mut out = OutboundQueue::default();

        let s = sender();
        s.send_full(&mut state, &mut conn, &mut out).unwrap();
        let first = drain(&mut out).len();
        s.send_full(&mut state, &mut conn, &mut out).unwrap();
        assert_eq!(first, 2);
        assert!(out.is_empty());
    }

    #[test]
    fn force_close_wins_over_keepalive_request() {
        let mut state = HttpCycleState::new();
        state.keep_alive_requested = true;
        state.response = Some(ResponseModel::full_with_status(
            StatusCode::PAYLOAD_TOO_LARGE,
            ResponsePayload::Empty,
        ));
        let mut conn = ConnMeta {
            force_close: true,
            ..Default::default()
        };
        let mut out = OutboundQueue::default();

        sender().send_full(&mut state, &mut conn, &mut out).unwrap();
        let frames = drain(&mut out);
        let ResponseFrame::Headers(head) = &frames[0] else {
            panic!("expected headers frame");
        };
        assert_eq!(head.headers.get(CONNECTION).unwrap(), "close");
        assert!(conn.close_after_response);
    }

    #[test]
    fn stream_send_uses_chunked_framing() {
        let mut state = HttpCycleState::new();
        state.keep_alive_requested = true;
        let head = ResponseHead::new(StatusCode::OK);
        state.response = Some(ResponseModel::chunked_from(&head));
        let mut conn = ConnMeta::default();
        let mut out = OutboundQueue::default();

        let s = sender();
        s.send_stream_head(&mut state, &mut conn, &mut out).unwrap();
        s.send_chunk(
            &mut state,
            &mut out,
            BodyChunk::new(Bytes::from_static(b"part1")),
        );
        s.send_last(
            &mut state,
            &mut out,
            Some(BodyChunk::new(Bytes::from_static(b"part2"))),
        )
        .unwrap();

        let frames = drain(&mut out);
        assert_eq!(frames.len(), 3);
        let ResponseFrame::Headers(head) = &frames[0] else {
            panic!("expected headers frame");
        };
        assert_eq!(head.headers.get(TRANSFER_ENCODING).unwrap(), "chunked");
        assert!(!head.headers.contains_key(CONTENT_LENGTH));
        assert_eq!(state.response.as_ref().unwrap().uncompressed_bytes, 10);
        assert!(state.response_finished());
    }
}
