//! Internal/external event buses.
//!
//! Grounded on `replica_service.py`'s `InternalBus`/`ExternalBus`
//! constructor parameters: a `ReplicaService` never calls its peers
//! directly, it publishes events onto a bus and lets independent
//! subscribers (the catchup coordinator, the network layer) react.
//! Traits rather than a concrete broker, since the broker's delivery
//! guarantees are a collaborator concern (§1, "network layer") out of
//! scope here; `node.rs` wires a concrete in-process implementation
//! for the single-process event loop.

use crate::crypto::hash::Digest;
use crate::ids::{InstId, ViewNo};

/// Events raised for consumption within the same process (e.g. by the
/// catchup coordinator, or a monitor tallying throughput).
#[derive(Debug, Clone)]
pub enum InternalEvent {
    /// The master instance has fallen behind and needs a full catchup
    /// before it can keep ordering (§4.5, condition i or ii).
    NeedMasterCatchup,
    /// A backup instance has fallen behind relative to the master and
    /// needs to replay committed batches (§4.5, condition iii).
    NeedBackupCatchup { inst_id: InstId },
    /// A batch of request digests this validator doesn't hold the full
    /// payload for; the recipient should ask peers to propagate them.
    RequestPropagates(Vec<Digest>),
    /// A view change has completed locally; `view_no` is the new view.
    ViewChanged { view_no: ViewNo },
}

/// Publishes events for consumption by other in-process subscribers.
pub trait InternalBus {
    fn publish(&mut self, event: InternalEvent);
}

/// A message queued for delivery to one or every peer.
#[derive(Debug, Clone)]
pub enum ExternalEvent {
    Unicast { to: crate::ids::NodeName, payload: crate::message::SystemMessage },
    Broadcast { payload: crate::message::SystemMessage },
}

/// Hands messages to the transport collaborator (§1, out of scope; this
/// is "the network layer" named in §6.1). `node.rs` drains queued
/// implementations into the real transport at the end of each
/// event-loop tick (§5.1).
pub trait ExternalBus {
    fn unicast(&mut self, to: crate::ids::NodeName, payload: crate::message::SystemMessage);
    fn broadcast(&mut self, payload: crate::message::SystemMessage);
}

/// An in-memory `InternalBus`/`ExternalBus` double, used by tests and
/// by `node.rs`'s default single-process wiring. Events are queued,
/// not delivered; a caller drains them with `take_internal`/`take_external`.
#[derive(Debug, Default)]
pub struct QueuedBus {
    internal: Vec<InternalEvent>,
    external: Vec<ExternalEvent>,
}

impl QueuedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_internal(&mut self) -> Vec<InternalEvent> {
        std::mem::take(&mut self.internal)
    }

    pub fn take_external(&mut self) -> Vec<ExternalEvent> {
        std::mem::take(&mut self.external)
    }
}

impl InternalBus for QueuedBus {
    fn publish(&mut self, event: InternalEvent) {
        self.internal.push(event);
    }
}

impl ExternalBus for QueuedBus {
    fn unicast(&mut self, to: crate::ids::NodeName, payload: crate::message::SystemMessage) {
        self.external.push(ExternalEvent::Unicast { to, payload });
    }

    fn broadcast(&mut self, payload: crate::message::SystemMessage) {
        self.external.push(ExternalEvent::Broadcast { payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_bus_drains_fifo() {
        let mut bus = QueuedBus::new();
        bus.publish(InternalEvent::NeedMasterCatchup);
        bus.publish(InternalEvent::ViewChanged { view_no: ViewNo::from(1) });
        let drained = bus.take_internal();
        assert_eq!(drained.len(), 2);
        assert!(bus.take_internal().is_empty());
    }
}
