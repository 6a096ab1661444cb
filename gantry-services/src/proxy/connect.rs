//! Downstream connection plumbing for the proxy.
//!
//! The streaming stage talks to the downstream through three seams: a
//! connector that opens a connection to a [`ProxyTarget`], a writer that
//! accepts outbound request frames, and a reader that yields inbound
//! response frames. [`FramedTcpConnector`] is the stock implementation,
//! wiring an embedder-supplied frame codec over a split TCP stream; tests
//! plug in in-memory implementations instead.

use std::{future::Future, io, net::SocketAddr};

use anyhow::anyhow;
use gantry_core::{
    endpoint::ProxyTarget,
    error::ServerError,
    frame::{RequestFrame, ResponseFrame},
};
use monoio::{
    io::{sink::Sink, stream::Stream, OwnedReadHalf, OwnedWriteHalf, Splitable},
    net::TcpStream,
};
use monoio_codec::{Decoder, Encoder, FramedRead, FramedWrite};
use monoio_transports::connectors::{Connector, TcpConnector};

/// Push side of a downstream connection. Implementations consume the frame,
/// releasing any tracked payload it carries.
pub trait DownstreamWriter {
    fn write_frame(&mut self, frame: RequestFrame) -> impl Future<Output = io::Result<()>>;
    fn flush(&mut self) -> impl Future<Output = io::Result<()>>;
}

/// Pull side of a downstream connection. `None` means the downstream closed.
pub trait DownstreamReader {
    fn next_frame(&mut self) -> impl Future<Output = io::Result<Option<ResponseFrame>>>;
}

pub trait DownstreamConnector {
    type Writer: DownstreamWriter + 'static;
    type Reader: DownstreamReader + 'static;

    fn connect(
        &self,
        target: &ProxyTarget,
    ) -> impl Future<Output = Result<(Self::Writer, Self::Reader), ServerError>>;
}

/// Builds the per-connection codec halves the framed connector wraps around
/// a split stream.
pub trait ProxyCodecFactory {
    type Encoder: Encoder<RequestFrame, Error = io::Error> + 'static;
    type Decoder: Decoder<Item = ResponseFrame, Error = io::Error> + 'static;

    fn encoder(&self) -> Self::Encoder;
    fn decoder(&self) -> Self::Decoder;
}

pub struct FramedSinkWriter<E> {
    inner: FramedWrite<OwnedWriteHalf<TcpStream>, E>,
}

impl<E> DownstreamWriter for FramedSinkWriter<E>
where
    E: Encoder<RequestFrame, Error = io::Error> + 'static,
{
    async fn write_frame(&mut self, frame: RequestFrame) -> io::Result<()> {
        self.inner.send(frame).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        Sink::flush(&mut self.inner).await
    }
}

pub struct FramedStreamReader<D> {
    inner: FramedRead<OwnedReadHalf<TcpStream>, D>,
}

impl<D> DownstreamReader for FramedStreamReader<D>
where
    D: Decoder<Item = ResponseFrame, Error = io::Error> + 'static,
{
    async fn next_frame(&mut self) -> io::Result<Option<ResponseFrame>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Plain-TCP connector with an embedder-supplied frame codec.
pub struct FramedTcpConnector<F> {
    inner: TcpConnector,
    codecs: F,
}

impl<F> FramedTcpConnector<F> {
    pub fn new(codecs: F) -> Self {
        FramedTcpConnector {
            inner: TcpConnector::default(),
            codecs,
        }
    }
}

impl<F> DownstreamConnector for FramedTcpConnector<F>
where
    F: ProxyCodecFactory,
{
    type Writer = FramedSinkWriter<F::Encoder>;
    type Reader = FramedStreamReader<F::Decoder>;

    async fn connect(
        &self,
        target: &ProxyTarget,
    ) -> Result<(Self::Writer, Self::Reader), ServerError> {
        if target.use_tls {
            return Err(ServerError::DownstreamConnect(anyhow!(
                "tls targets are not supported by the plain tcp connector"
            )));
        }
        let addr = resolve(&target.host, target.port)?;
        let stream = self
            .inner
            .connect(addr)
            .await
            .map_err(|e| ServerError::DownstreamConnect(e.into()))?;
        let (read_half, write_half) = stream.into_split();
        Ok((
            FramedSinkWriter {
                inner: FramedWrite::new(write_half, self.codecs.encoder()),
            },
            FramedStreamReader {
                inner: FramedRead::new(read_half, self.codecs.decoder()),
            },
        ))
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ServerError::TargetResolution(e.into()))?
        .next()
        .ok_or_else(|| ServerError::TargetResolution(anyhow!("no address for {host}:{port}")))
}
