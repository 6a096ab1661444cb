//! Re-entry handle for the connection loop.
//!
//! Tasks spawned by stages never touch pipeline state directly; they post an
//! event here and the driver dispatches it on the connection's loop. That is
//! what keeps stage execution serialized per connection.

use std::future::Future;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

use super::PipelineEvent;

#[derive(Clone)]
pub struct DriverHandle {
    tx: UnboundedSender<PipelineEvent>,
}

impl DriverHandle {
    pub fn channel() -> (DriverHandle, UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = unbounded();
        (DriverHandle { tx }, rx)
    }

    /// Posts an event to the connection loop. Returns false when the
    /// connection is gone; callers stop their work in that case. An event
    /// the loop will never see has its payload released here.
    pub fn post(&self, ev: PipelineEvent) -> bool {
        match self.tx.unbounded_send(ev) {
            Ok(()) => true,
            Err(rejected) => {
                rejected.into_inner().release_payload();
                false
            }
        }
    }

    /// Spawns a task on the current thread's runtime.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        monoio::spawn(fut);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use gantry_core::frame::{BodyChunk, ChunkLedger};

    use super::*;

    #[test]
    fn post_after_loop_exit_releases_tracked_payloads() {
        let (handle, rx) = DriverHandle::channel();
        drop(rx);

        let ledger = ChunkLedger::new();
        let chunk = BodyChunk::tracked(Bytes::from_static(b"tail"), &ledger);
        assert!(!handle.post(PipelineEvent::Content(Some(chunk))));
        assert_eq!(ledger.released(), 1);
        assert_eq!(ledger.leaked(), 0);
    }
}
