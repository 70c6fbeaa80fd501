//! Vport state-change events
//!
//! The lifecycle controller collects an event mask while it holds the registry
//! lock and hands it to an [`EventNotifier`] only after the lock is dropped, so
//! observers are free to call back into the lookup APIs.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

bitflags! {
    /// Event mask posted for a vport.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VportEvents: u32 {
        const CONNECT = 1 << 0;
        const DISCONNECT = 1 << 1;
        const LINK_UP = 1 << 2;
        const LINK_DOWN = 1 << 3;
        const MAC_CHANGE = 1 << 4;
        const MTU_CHANGE = 1 << 5;
    }
}

/// One posted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VportEvent {
    pub port_no: u32,
    pub events: VportEvents,
}

/// Upstream observer of vport state changes.
///
/// Delivery is fire-and-forget: implementations must not block and the
/// controller never retries.
pub trait EventNotifier: Send + Sync {
    fn post_event(&self, port_no: u32, events: VportEvents);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl EventNotifier for NullNotifier {
    fn post_event(&self, port_no: u32, events: VportEvents) {
        debug!(port_no, ?events, "Dropping vport event (no observer)");
    }
}

/// Forwards events into an unbounded tokio channel.
///
/// Posting never blocks, so it is safe from fabric callback threads. A closed
/// receiver loses the event and logs it.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<VportEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<VportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventNotifier for ChannelNotifier {
    fn post_event(&self, port_no: u32, events: VportEvents) {
        if self.tx.send(VportEvent { port_no, events }).is_err() {
            warn!(port_no, ?events, "Event receiver closed, vport event lost");
        }
    }
}

impl<T: EventNotifier + ?Sized> EventNotifier for Arc<T> {
    fn post_event(&self, port_no: u32, events: VportEvents) {
        (**self).post_event(port_no, events)
    }
}
