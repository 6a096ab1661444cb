//! Accept loop and the context-attaching service in front of the pipeline.

use std::{fmt::Debug, net::SocketAddr, rc::Rc};

use gantry_core::context::PeerAddr;
use monoio::net::TcpListener;
use service_async::{AsyncMakeService, MakeService, ParamSet, Service};
use tracing::{error, info, warn};

/// Forks a typed context per connection and records the peer address in it
/// before calling the inner service.
#[derive(Debug, Clone)]
pub struct ContextService<CX, T> {
    inner: T,
    ctx: CX,
}

impl<CX: Default, T> ContextService<CX, T> {
    pub fn new(inner: T) -> Self {
        ContextService {
            inner,
            ctx: CX::default(),
        }
    }
}

impl<IO, T, CX> Service<(IO, SocketAddr)> for ContextService<CX, T>
where
    T: Service<(IO, CX::Transformed)>,
    CX: ParamSet<PeerAddr> + Clone,
{
    type Response = T::Response;
    type Error = T::Error;

    async fn call(&self, (io, addr): (IO, SocketAddr)) -> Result<Self::Response, Self::Error> {
        let ctx = self.ctx.clone().param_set(PeerAddr(addr));
        self.inner.call((io, ctx)).await
    }
}

impl<CX: Default + Clone, F: MakeService> MakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            ctx: self.ctx.clone(),
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<CX: Default + Clone, F: AsyncMakeService> AsyncMakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            ctx: self.ctx.clone(),
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

/// Accepts connections until the listener fails, spawning one task per
/// connection on the current thread's runtime.
pub async fn serve<S>(listener: TcpListener, service: Rc<S>)
where
    S: Service<(monoio::net::TcpStream, SocketAddr)> + 'static,
    S::Error: Debug,
{
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let svc = service.clone();
                monoio::spawn(async move {
                    if let Err(e) = svc.call((stream, addr)).await {
                        error!(peer = %addr, "connection handling error: {e:?}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e:?}");
                if is_fatal_accept_error(&e) {
                    info!("listener unusable; accept loop exiting");
                    return;
                }
            }
        }
    }
}

fn is_fatal_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::InvalidInput | ErrorKind::NotConnected | ErrorKind::BrokenPipe
    )
}
