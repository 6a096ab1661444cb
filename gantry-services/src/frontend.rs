//! Connection-facing service.
//!
//! [`PipelineCoreService`] is the seam between the service stack and the
//! pipeline: it splits the accepted stream, wraps the halves in the
//! embedder's frame codec, and hands both to the connection driver. It also
//! enforces the open-connection ceiling, rejecting surplus connections with
//! a bare 503 before any pipeline state is built.

use std::{convert::Infallible, io, rc::Rc};

use gantry_core::{
    context::PeerAddr,
    error::ServerError,
    frame::{FrameSink, FrameSource, RequestFrame, ResponseFrame, ResponseHead},
};
use http::{
    header::{HeaderValue, CONNECTION, CONTENT_LENGTH},
    StatusCode,
};
use monoio::io::{sink::Sink, stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_codec::{Decoder, Encoder, FramedRead, FramedWrite};
use service_async::{AsyncMakeService, MakeService, ParamRef, Service};
use tracing::warn;

use crate::{
    pipeline::{driver::drive_connection, Pipeline, ServerShared},
    sender::CLOSE_VALUE,
};

/// Builds the per-connection codec halves that turn wire bytes into request
/// frames and response frames back into wire bytes.
pub trait FrontendCodecFactory {
    type Decoder: Decoder<Item = RequestFrame, Error = io::Error> + 'static;
    type Encoder: Encoder<ResponseFrame, Error = io::Error> + 'static;

    fn decoder(&self) -> Self::Decoder;
    fn encoder(&self) -> Self::Encoder;
}

pub struct FrontendSource<R, D> {
    inner: FramedRead<R, D>,
}

impl<R, D> FrameSource for FrontendSource<R, D>
where
    R: AsyncReadRent,
    D: Decoder<Item = RequestFrame, Error = io::Error>,
{
    async fn next_frame(&mut self) -> io::Result<Option<RequestFrame>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

pub struct FrontendSink<W, E> {
    inner: FramedWrite<W, E>,
}

impl<W, E> FrameSink for FrontendSink<W, E>
where
    W: AsyncWriteRent,
    E: Encoder<ResponseFrame, Error = io::Error>,
{
    async fn write_frame(&mut self, frame: ResponseFrame) -> io::Result<()> {
        self.inner.send(frame).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        Sink::flush(&mut self.inner).await
    }
}

/// Decrements the shared connection count when the connection ends.
struct ConnGuard {
    shared: Rc<ServerShared>,
}

impl ConnGuard {
    fn acquire(shared: Rc<ServerShared>) -> Result<Self, ServerError> {
        let limit = shared.config.max_open_connections;
        if limit != 0 && shared.open_connections.get() >= limit {
            return Err(ServerError::OverCapacity { limit });
        }
        shared.open_connections.set(shared.open_connections.get() + 1);
        Ok(ConnGuard { shared })
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.shared
            .open_connections
            .set(self.shared.open_connections.get() - 1);
    }
}

pub struct PipelineCoreService<F> {
    pipeline: Pipeline,
    codecs: Rc<F>,
}

impl<F> PipelineCoreService<F> {
    pub fn new(pipeline: Pipeline, codecs: F) -> Self {
        PipelineCoreService {
            pipeline,
            codecs: Rc::new(codecs),
        }
    }
}

impl<F> Clone for PipelineCoreService<F> {
    fn clone(&self) -> Self {
        PipelineCoreService {
            pipeline: self.pipeline.clone(),
            codecs: self.codecs.clone(),
        }
    }
}

impl<F, IO, CX> Service<(IO, CX)> for PipelineCoreService<F>
where
    F: FrontendCodecFactory,
    IO: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
    CX: ParamRef<PeerAddr>,
{
    type Response = ();
    type Error = Infallible;

    async fn call(&self, (io, ctx): (IO, CX)) -> Result<Self::Response, Self::Error> {
        let peer = ParamRef::<PeerAddr>::param_ref(&ctx).0;
        let (reader, writer) = io.into_split();
        let src = FrontendSource {
            inner: FramedRead::new(reader, self.codecs.decoder()),
        };
        let mut snk = FrontendSink {
            inner: FramedWrite::new(writer, self.codecs.encoder()),
        };

        let guard = match ConnGuard::acquire(self.pipeline.shared.clone()) {
            Ok(g) => g,
            Err(e) => {
                warn!(peer = %peer, error = %e, "rejecting connection");
                reject_over_capacity(&mut snk).await;
                return Ok(());
            }
        };
        drive_connection(self.pipeline.clone(), src, snk, Some(peer.to_string())).await;
        drop(guard);
        Ok(())
    }
}

/// Writes a bare 503 and lets the connection close. Best effort; a peer that
/// is already gone just gets dropped.
async fn reject_over_capacity<S: FrameSink>(snk: &mut S) {
    let mut head = ResponseHead::new(StatusCode::SERVICE_UNAVAILABLE);
    head.headers.insert(CONNECTION, CLOSE_VALUE);
    head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    let write = async {
        snk.write_frame(ResponseFrame::Headers(head)).await?;
        snk.write_frame(ResponseFrame::Last(None)).await?;
        snk.flush().await
    };
    if let Err(e) = write.await {
        warn!(error = %e, "failed to write over-capacity response");
    }
}

// PipelineCoreService is both the per-connection Service and its own factory;
// connections of one thread share the pipeline through it.
impl<F> MakeService for PipelineCoreService<F> {
    type Service = Self;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

impl<F> AsyncMakeService for PipelineCoreService<F> {
    type Service = Self;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}
