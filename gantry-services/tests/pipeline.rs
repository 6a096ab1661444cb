//! End-to-end pipeline tests over in-memory transports.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use gantry_core::{
    breaker::{BreakerChoice, BreakerRegistry, CircuitBreaker, CircuitOpen},
    config::PipelineConfig,
    endpoint::{
        EndpointConfig, EndpointEntry, FnEndpoint, ProxyRouterEndpoint, ProxyTarget,
        StandardEndpoint,
    },
    error::ServerError,
    frame::{
        BodyChunk, ChunkLedger, FrameSink, FrameSource, RequestFrame, RequestHead, ResponseFrame,
        ResponseHead,
    },
    http::{ContentDecoder, RequestModel, ResponseModel},
    serialize::{ResponsePayload, SerializeError, Serializer},
    AnyError, AnyResult,
};
use gantry_services::{
    observability::MetricsListener,
    pipeline::{driver::drive_connection, Pipeline, PipelineBuilder},
    proxy::{
        connect::{DownstreamConnector, DownstreamReader, DownstreamWriter},
        DOWNSTREAM_ELAPSED_ATTR,
    },
    sender::ERROR_UID_HEADER,
    stages::security::RequestValidator,
};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
    Method, StatusCode,
};
use serde::Deserialize;

fn run<F>(f: F) -> F::Output
where
    F: std::future::Future,
{
    let mut rt = monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .enable_timer()
        .build()
        .unwrap();
    rt.block_on(f)
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        idle_timeout_ms: 60,
        incomplete_request_timeout_ms: 40,
        endpoint_timeout_ms: 25,
        ..Default::default()
    }
}

// ---- transports ----

enum SourceEnd {
    Eof,
    Hang,
}

struct MockSource {
    frames: VecDeque<RequestFrame>,
    end: SourceEnd,
}

impl MockSource {
    fn new(frames: Vec<RequestFrame>, end: SourceEnd) -> Self {
        MockSource {
            frames: frames.into(),
            end,
        }
    }
}

impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> io::Result<Option<RequestFrame>> {
        if let Some(f) = self.frames.pop_front() {
            return Ok(Some(f));
        }
        match self.end {
            SourceEnd::Eof => Ok(None),
            SourceEnd::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[derive(Default)]
struct SinkLog {
    frames: RefCell<Vec<ResponseFrame>>,
}

impl SinkLog {
    fn head(&self, nth: usize) -> ResponseHead {
        self.frames
            .borrow()
            .iter()
            .filter_map(|f| match f {
                ResponseFrame::Headers(h) => Some(h.clone()),
                _ => None,
            })
            .nth(nth)
            .expect("missing headers frame")
    }

    fn status(&self) -> StatusCode {
        self.head(0).status
    }

    fn body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for f in self.frames.borrow().iter() {
            match f {
                ResponseFrame::Content(c) => out.extend_from_slice(c.bytes()),
                ResponseFrame::Last(Some(c)) => out.extend_from_slice(c.bytes()),
                _ => {}
            }
        }
        out
    }

    fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body()).expect("body is not json")
    }

    fn len(&self) -> usize {
        self.frames.borrow().len()
    }
}

struct MockSink {
    log: Rc<SinkLog>,
    fail_at: Option<usize>,
    attempted: usize,
}

impl MockSink {
    fn new(log: Rc<SinkLog>) -> Self {
        MockSink {
            log,
            fail_at: None,
            attempted: 0,
        }
    }

    fn failing_at(log: Rc<SinkLog>, frame_index: usize) -> Self {
        MockSink {
            log,
            fail_at: Some(frame_index),
            attempted: 0,
        }
    }
}

impl FrameSink for MockSink {
    async fn write_frame(&mut self, frame: ResponseFrame) -> io::Result<()> {
        let index = self.attempted;
        self.attempted += 1;
        if self.fail_at == Some(index) {
            frame.release_payload();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        self.log.frames.borrow_mut().push(frame);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---- downstream mocks ----

enum SentFrame {
    Head(RequestHead),
    Content(Bytes),
    Last(Option<Bytes>),
}

#[derive(Clone, Default)]
struct MockConnector {
    attempts: Rc<Cell<usize>>,
    fail_connect: bool,
    sent: Rc<RefCell<Vec<SentFrame>>>,
    script: Rc<RefCell<VecDeque<ResponseFrame>>>,
}

impl MockConnector {
    fn scripted(frames: Vec<ResponseFrame>) -> Self {
        MockConnector {
            script: Rc::new(RefCell::new(frames.into())),
            ..Default::default()
        }
    }

    fn refusing() -> Self {
        MockConnector {
            fail_connect: true,
            ..Default::default()
        }
    }
}

impl DownstreamConnector for MockConnector {
    type Writer = MockWriter;
    type Reader = MockReader;

    async fn connect(
        &self,
        _target: &ProxyTarget,
    ) -> Result<(Self::Writer, Self::Reader), ServerError> {
        self.attempts.set(self.attempts.get() + 1);
        if self.fail_connect {
            return Err(ServerError::DownstreamConnect(anyhow::anyhow!(
                "connection refused"
            )));
        }
        let request_done = Rc::new(Cell::new(false));
        Ok((
            MockWriter {
                sent: self.sent.clone(),
                request_done: request_done.clone(),
            },
            MockReader {
                frames: std::mem::take(&mut *self.script.borrow_mut()),
                request_done,
            },
        ))
    }
}

struct MockWriter {
    sent: Rc<RefCell<Vec<SentFrame>>>,
    request_done: Rc<Cell<bool>>,
}

impl DownstreamWriter for MockWriter {
    async fn write_frame(&mut self, frame: RequestFrame) -> io::Result<()> {
        let rec = match frame {
            RequestFrame::Head(h) => SentFrame::Head(h),
            RequestFrame::Content(c) => SentFrame::Content(c.release()),
            RequestFrame::Last(c) => {
                self.request_done.set(true);
                SentFrame::Last(c.map(BodyChunk::release))
            }
        };
        self.sent.borrow_mut().push(rec);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Replies only after the whole request has been written, like a real
/// downstream would.
struct MockReader {
    frames: VecDeque<ResponseFrame>,
    request_done: Rc<Cell<bool>>,
}

impl DownstreamReader for MockReader {
    async fn next_frame(&mut self) -> io::Result<Option<ResponseFrame>> {
        while !self.request_done.get() {
            monoio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(self.frames.pop_front())
    }
}

// ---- fixtures ----

#[derive(Default)]
struct RecordingBreaker {
    open: bool,
    successes: RefCell<Vec<StatusCode>>,
    failures: Cell<usize>,
}

impl CircuitBreaker for RecordingBreaker {
    fn name(&self) -> &str {
        "recording"
    }

    fn check(&self) -> Result<(), CircuitOpen> {
        if self.open {
            Err(CircuitOpen {
                name: "recording".into(),
            })
        } else {
            Ok(())
        }
    }

    fn on_success(&self, status: StatusCode) {
        self.successes.borrow_mut().push(status);
    }

    fn on_failure(&self, _error: &ServerError) {
        self.failures.set(self.failures.get() + 1);
    }
}

struct DenyAll;

impl RequestValidator for DenyAll {
    fn name(&self) -> &'static str {
        "deny-all"
    }

    fn validate(&self, _req: &RequestModel) -> LocalBoxFuture<'_, AnyResult<()>> {
        Box::pin(async { Err(anyhow::anyhow!("credentials missing")) })
    }
}

struct FailingSerializer;

impl Serializer for FailingSerializer {
    fn serialize(&self, _payload: &ResponsePayload) -> Result<Bytes, SerializeError> {
        Err(SerializeError("encoder exploded".into()))
    }

    fn mime_type(&self) -> &str {
        "application/json"
    }
}

#[derive(Deserialize)]
struct NewItem {
    name: String,
}

struct ItemEndpoint;

impl StandardEndpoint for ItemEndpoint {
    fn execute(&self, req: Rc<RequestModel>) -> LocalBoxFuture<'_, AnyResult<ResponseModel>> {
        Box::pin(async move {
            let item = req
                .content::<NewItem>()
                .ok_or_else(|| anyhow::anyhow!("missing content"))?;
            Ok(ResponseModel::full_with_status(
                StatusCode::CREATED,
                ResponsePayload::Json(serde_json::json!({"created": item.name})),
            ))
        })
    }

    fn content_decoder(&self) -> Option<ContentDecoder> {
        Some(ContentDecoder::json::<NewItem>())
    }
}

struct RewritingProxyEndpoint {
    seen: Rc<RefCell<Option<Rc<RequestModel>>>>,
}

impl ProxyRouterEndpoint for RewritingProxyEndpoint {
    fn target(&self, req: Rc<RequestModel>) -> LocalBoxFuture<'_, AnyResult<ProxyTarget>> {
        *self.seen.borrow_mut() = Some(req.clone());
        let head = RequestHead::new(req.method().clone(), "/rewritten".parse().unwrap());
        Box::pin(async move {
            Ok(ProxyTarget {
                host: "downstream.test".into(),
                port: 9000,
                use_tls: false,
                relaxed_tls: false,
                head,
                breaker: BreakerChoice::Default,
            })
        })
    }
}

fn users_endpoint() -> EndpointEntry {
    EndpointEntry::standard(
        EndpointConfig::new("/users/{id}").with_methods(vec![Method::GET]),
        Rc::new(FnEndpoint(|req: Rc<RequestModel>| async move {
            let id = req.path_param("id").unwrap_or_default();
            Ok::<_, AnyError>(ResponseModel::full(ResponsePayload::Json(
                serde_json::json!({"id": id}),
            )))
        })),
    )
}

fn head(method: Method, uri: &str) -> RequestFrame {
    RequestFrame::Head(RequestHead::new(method, uri.parse().unwrap()))
}

fn last() -> RequestFrame {
    RequestFrame::Last(None)
}

async fn drive(pipeline: Pipeline, frames: Vec<RequestFrame>, end: SourceEnd) -> Rc<SinkLog> {
    let log = Rc::new(SinkLog::default());
    let snk = MockSink::new(log.clone());
    drive_connection(
        pipeline,
        MockSource::new(frames, end),
        snk,
        Some("127.0.0.1:4321".into()),
    )
    .await;
    log
}

// ---- tests ----

#[test]
fn full_cycle_keeps_connection_alive() {
    run(async {
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(users_endpoint())
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/users/42"), last()],
            SourceEnd::Hang,
        )
        .await;

        let h = log.head(0);
        assert_eq!(h.status, StatusCode::OK);
        assert_eq!(h.headers.get(CONNECTION).unwrap(), "keep-alive");
        assert_eq!(h.headers.get(CONTENT_LENGTH).unwrap(), "11");
        assert!(h
            .headers
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/json"));
        assert!(h.headers.contains_key("x-b3-traceid"));
        assert_eq!(log.body_json()["id"], "42");
    });
}

#[test]
fn typed_content_reaches_the_endpoint() {
    run(async {
        let ledger = ChunkLedger::new();
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::standard(
                EndpointConfig::new("/items").with_methods(vec![Method::POST]),
                Rc::new(ItemEndpoint),
            ))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![
                head(Method::POST, "/items"),
                RequestFrame::Content(BodyChunk::tracked(
                    Bytes::from_static(b"{\"name\":"),
                    &ledger,
                )),
                RequestFrame::Last(Some(BodyChunk::tracked(
                    Bytes::from_static(b"\"crate\"}"),
                    &ledger,
                ))),
            ],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::CREATED);
        assert_eq!(log.body_json()["created"], "crate");
        assert_eq!(ledger.leaked(), 0);
        assert_eq!(ledger.released(), 2);
    });
}

#[test]
fn undecodable_content_is_rejected() {
    run(async {
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::standard(
                EndpointConfig::new("/items").with_methods(vec![Method::POST]),
                Rc::new(ItemEndpoint),
            ))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![
                head(Method::POST, "/items"),
                RequestFrame::Last(Some(BodyChunk::new(Bytes::from_static(b"not json")))),
            ],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::BAD_REQUEST);
        let body = log.body_json();
        assert!(body["error_id"].is_string());
        assert_eq!(
            log.head(0).headers.get(ERROR_UID_HEADER).unwrap(),
            body["error_id"].as_str().unwrap()
        );
    });
}

#[test]
fn failed_validation_is_rejected_before_the_endpoint() {
    run(async {
        let executed = Rc::new(Cell::new(false));
        let flag = executed.clone();
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::standard(
                EndpointConfig::new("/secure"),
                Rc::new(FnEndpoint(move |_req: Rc<RequestModel>| {
                    let flag = flag.clone();
                    async move {
                        flag.set(true);
                        Ok::<_, AnyError>(ResponseModel::full(ResponsePayload::Empty))
                    }
                })),
            ))
            .validator(Rc::new(DenyAll))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/secure"), last()],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::BAD_REQUEST);
        assert!(!executed.get());
    });
}

#[test]
fn unknown_path_is_404_and_connection_survives() {
    run(async {
        let metrics = Rc::new(MetricsListener::default());
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(users_endpoint())
            .metrics_listener(metrics.clone())
            .build(MockConnector::default())
            .unwrap();

        // the second request proves the connection outlived the 404
        let log = drive(
            pipeline,
            vec![
                head(Method::GET, "/nothing"),
                last(),
                head(Method::GET, "/users/7"),
                last(),
            ],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.head(0).status, StatusCode::NOT_FOUND);
        assert_eq!(log.head(0).headers.get(CONNECTION).unwrap(), "keep-alive");
        assert_eq!(log.head(1).status, StatusCode::OK);
        assert_eq!(metrics.responses_sent(), 2);
    });
}

#[test]
fn slow_endpoint_times_out() {
    run(async {
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::standard(
                EndpointConfig::new("/slow"),
                Rc::new(FnEndpoint(|_req: Rc<RequestModel>| async move {
                    monoio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, AnyError>(ResponseModel::full(ResponsePayload::Empty))
                })),
            ))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/slow"), last()],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(log.body_json()["error_id"].is_string());
    });
}

#[test]
fn zero_timeout_lets_slow_endpoints_finish() {
    run(async {
        let mut config = test_config();
        config.endpoint_timeout_ms = 0;
        let pipeline = PipelineBuilder::new(config)
            .endpoint(EndpointEntry::standard(
                EndpointConfig::new("/slow"),
                Rc::new(FnEndpoint(|_req: Rc<RequestModel>| async move {
                    monoio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, AnyError>(ResponseModel::full(ResponsePayload::Json(
                        serde_json::json!({"ok": true}),
                    )))
                })),
            ))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/slow"), last()],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::OK);
        assert_eq!(log.body_json()["ok"], true);
    });
}

#[test]
fn oversized_body_closes_the_connection() {
    run(async {
        let ledger = ChunkLedger::new();
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::standard(
                EndpointConfig::new("/upload").with_max_body(8),
                Rc::new(FnEndpoint(|_req: Rc<RequestModel>| async move {
                    Ok::<_, AnyError>(ResponseModel::full(ResponsePayload::Empty))
                })),
            ))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![
                head(Method::POST, "/upload"),
                RequestFrame::Content(BodyChunk::tracked(
                    Bytes::from_static(b"way more than eight bytes"),
                    &ledger,
                )),
                RequestFrame::Last(Some(BodyChunk::tracked(
                    Bytes::from_static(b"tail"),
                    &ledger,
                ))),
            ],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(log.head(0).headers.get(CONNECTION).unwrap(), "close");
        // nothing buffered or in flight leaks when the cycle is cut short
        assert_eq!(ledger.leaked(), 0);
        assert_eq!(ledger.released(), 2);
    });
}

#[test]
fn stalled_request_times_out_with_408() {
    run(async {
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(users_endpoint())
            .build(MockConnector::default())
            .unwrap();

        // head arrives, the rest never does
        let log = drive(
            pipeline,
            vec![head(Method::GET, "/users/42")],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(log.head(0).headers.get(CONNECTION).unwrap(), "close");
    });
}

#[test]
fn serializer_failure_substitutes_an_error_body() {
    run(async {
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(users_endpoint())
            .serializer(Rc::new(FailingSerializer))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/users/42"), last()],
            SourceEnd::Hang,
        )
        .await;

        // original status survives; the body is the generic error payload
        assert_eq!(log.status(), StatusCode::OK);
        let body = log.body_json();
        let uid = body["error_id"].as_str().unwrap();
        assert_eq!(log.head(0).headers.get(ERROR_UID_HEADER).unwrap(), uid);
    });
}

#[test]
fn proxy_streams_frames_in_order() {
    run(async {
        let ledger = ChunkLedger::new();
        let mut downstream_head = ResponseHead::new(StatusCode::OK);
        downstream_head
            .headers
            .insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        let connector = MockConnector::scripted(vec![
            ResponseFrame::Headers(downstream_head),
            ResponseFrame::Content(BodyChunk::new(Bytes::from_static(b"first,"))),
            ResponseFrame::Last(Some(BodyChunk::new(Bytes::from_static(b"second")))),
        ]);
        let breaker = Rc::new(RecordingBreaker::default());
        let seen = Rc::new(RefCell::new(None));

        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::proxy(
                EndpointConfig::new("/relay"),
                Rc::new(RewritingProxyEndpoint { seen: seen.clone() }),
            ))
            .breakers(BreakerRegistry::new(breaker.clone()))
            .build(connector.clone())
            .unwrap();

        let log = drive(
            pipeline,
            vec![
                head(Method::POST, "/relay"),
                RequestFrame::Content(BodyChunk::tracked(Bytes::from_static(b"hello "), &ledger)),
                RequestFrame::Last(Some(BodyChunk::tracked(
                    Bytes::from_static(b"world"),
                    &ledger,
                ))),
            ],
            SourceEnd::Hang,
        )
        .await;

        // downstream got the rewritten head first, then the body in order
        let sent = connector.sent.borrow();
        assert_eq!(sent.len(), 3);
        match &sent[0] {
            SentFrame::Head(h) => assert_eq!(h.uri.path(), "/rewritten"),
            _ => panic!("expected head first"),
        }
        assert!(matches!(&sent[1], SentFrame::Content(b) if b.as_ref() == b"hello "));
        assert!(matches!(&sent[2], SentFrame::Last(Some(b)) if b.as_ref() == b"world"));

        // upstream saw a chunked relay of the downstream response
        let h = log.head(0);
        assert_eq!(h.status, StatusCode::OK);
        assert_eq!(h.headers.get(TRANSFER_ENCODING).unwrap(), "chunked");
        assert!(!h.headers.contains_key(CONTENT_LENGTH));
        assert_eq!(log.body(), b"first,second");

        assert_eq!(*breaker.successes.borrow(), vec![StatusCode::OK]);
        assert_eq!(breaker.failures.get(), 0);
        let req = seen.borrow().clone().unwrap();
        assert!(req.attr(DOWNSTREAM_ELAPSED_ATTR).is_some());
        assert_eq!(ledger.leaked(), 0);
        assert_eq!(ledger.released(), 2);
    });
}

#[test]
fn proxy_connect_failure_is_502() {
    run(async {
        let connector = MockConnector::refusing();
        let breaker = Rc::new(RecordingBreaker::default());
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::proxy(
                EndpointConfig::new("/relay"),
                Rc::new(RewritingProxyEndpoint {
                    seen: Rc::new(RefCell::new(None)),
                }),
            ))
            .breakers(BreakerRegistry::new(breaker.clone()))
            .build(connector.clone())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/relay"), last()],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(connector.attempts.get(), 1);
        assert_eq!(breaker.failures.get(), 1);
        assert!(breaker.successes.borrow().is_empty());
    });
}

#[test]
fn open_circuit_short_circuits_without_connecting() {
    run(async {
        let connector = MockConnector::default();
        let breaker = Rc::new(RecordingBreaker {
            open: true,
            ..Default::default()
        });
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::proxy(
                EndpointConfig::new("/relay"),
                Rc::new(RewritingProxyEndpoint {
                    seen: Rc::new(RefCell::new(None)),
                }),
            ))
            .breakers(BreakerRegistry::new(breaker.clone()))
            .build(connector.clone())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/relay"), last()],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(connector.attempts.get(), 0);
        // a short-circuited call is not a breaker failure
        assert_eq!(breaker.failures.get(), 0);
    });
}

#[test]
fn proxied_requests_are_validated_too() {
    run(async {
        let connector = MockConnector::default();
        let breaker = Rc::new(RecordingBreaker::default());
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(EndpointEntry::proxy(
                EndpointConfig::new("/relay"),
                Rc::new(RewritingProxyEndpoint {
                    seen: Rc::new(RefCell::new(None)),
                }),
            ))
            .validator(Rc::new(DenyAll))
            .breakers(BreakerRegistry::new(breaker.clone()))
            .build(connector.clone())
            .unwrap();

        let log = drive(
            pipeline,
            vec![head(Method::GET, "/relay"), last()],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.status(), StatusCode::BAD_REQUEST);
        assert!(log.body_json()["error_id"].is_string());
        assert_eq!(connector.attempts.get(), 0);
        // a rejected request never reaches the breaker
        assert_eq!(breaker.failures.get(), 0);
    });
}

#[test]
fn listeners_fire_exactly_once_per_cycle() {
    run(async {
        let metrics = Rc::new(MetricsListener::default());
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(users_endpoint())
            .metrics_listener(metrics.clone())
            .access_log_listener(Rc::new(
                gantry_services::observability::AccessLogListener,
            ))
            .build(MockConnector::default())
            .unwrap();

        let log = drive(
            pipeline,
            vec![
                head(Method::GET, "/users/1"),
                last(),
                head(Method::GET, "/users/2"),
                last(),
            ],
            SourceEnd::Hang,
        )
        .await;

        assert_eq!(log.len(), 4);
        assert_eq!(metrics.requests_received(), 2);
        assert_eq!(metrics.responses_sent(), 2);
        assert_eq!(metrics.write_failures(), 0);
        // 10 bytes of payload per response
        assert_eq!(metrics.response_bytes(), 20);
    });
}

#[test]
fn write_failure_reports_through_the_lifecycle() {
    run(async {
        let metrics = Rc::new(MetricsListener::default());
        let pipeline = PipelineBuilder::new(test_config())
            .endpoint(users_endpoint())
            .metrics_listener(metrics.clone())
            .build(MockConnector::default())
            .unwrap();

        let log = Rc::new(SinkLog::default());
        let snk = MockSink::failing_at(log.clone(), 0);
        drive_connection(
            pipeline,
            MockSource::new(vec![head(Method::GET, "/users/42"), last()], SourceEnd::Hang),
            snk,
            Some("127.0.0.1:4321".into()),
        )
        .await;

        assert_eq!(log.len(), 0);
        assert_eq!(metrics.requests_received(), 1);
        assert_eq!(metrics.responses_sent(), 0);
        assert_eq!(metrics.write_failures(), 1);
    });
}
