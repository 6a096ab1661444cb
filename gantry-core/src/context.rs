//! Typed connection context.
//!
//! Services above the pipeline attach per-connection facts here; the pipeline
//! reads them through `ParamRef` so embedders can carry richer contexts of
//! their own. The generated store is owned per connection and written through
//! its borrowed handler, which is what implements `ParamSet`/`ParamRef`.

use std::net::SocketAddr;

/// Address of the connected peer, set when the connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr(addr)
    }
}

certain_map::certain_map! {
    #[derive(Debug, Clone)]
    #[empty(EmptyContext)]
    #[full(FullContext)]
    pub struct Context {
        // Set by the accept loop before the pipeline sees the connection.
        peer_addr: PeerAddr,
    }
}
