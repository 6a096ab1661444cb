//! Lifecycle observation: the events metrics and access-log listeners see.

use std::time::Duration;

/// Immutable view of a cycle, captured when the event fires. Deferred events
/// (those waiting on the last response write) carry the snapshot taken at
/// finalization time, so later cleanup cannot disturb what gets reported.
#[derive(Debug, Clone, Default)]
pub struct CycleSnapshot {
    pub trace_id: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub matched_pattern: Option<String>,
    pub status: Option<u16>,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub error_uid: Option<String>,
    pub peer_addr: Option<String>,
    pub elapsed: Option<Duration>,
}

#[derive(Debug)]
pub enum LifecycleEvent<'a> {
    /// A request head arrived and a cycle began.
    RequestReceived(&'a CycleSnapshot),
    /// The last response frame was written successfully.
    ResponseSent(&'a CycleSnapshot),
    /// Writing the response failed partway; the connection is being torn
    /// down.
    ResponseWriteFailed {
        snapshot: &'a CycleSnapshot,
        error: &'a str,
    },
}

pub trait LifecycleListener {
    fn on_event(&self, event: &LifecycleEvent<'_>);
}
