//! Events a replicated log publishes on its bus.

use tide_log::Record;
use tide_types::events::BusEvent;
use tide_types::{ContentHash, PeerId};

/// Something that happened to a log.
///
/// For one batch of remote heads the order is always `Replicate`, then one
/// `ReplicateProgress` per newly fetched entry, then `Replicated`.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A local append succeeded.
    Write { record: Record },

    /// A peer announced heads we do not have; fetching starts.
    Replicate {
        peer: PeerId,
        heads: Vec<ContentHash>,
    },

    /// One remote entry was fetched.
    ///
    /// `record` is set when the entry was linked into the log, `None` when
    /// it was rejected or is still waiting for an ancestor.
    ReplicateProgress {
        peer: PeerId,
        hash: ContentHash,
        record: Option<Record>,
    },

    /// A batch finished. `log_length` counts the entries it added.
    Replicated { peer: PeerId, log_length: usize },
}

/// Discriminant of [`StoreEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Write,
    Replicate,
    ReplicateProgress,
    Replicated,
}

impl EventKind {
    /// Every kind.
    pub const ALL: [EventKind; 4] = [
        EventKind::Write,
        EventKind::Replicate,
        EventKind::ReplicateProgress,
        EventKind::Replicated,
    ];
}

impl BusEvent for StoreEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            StoreEvent::Write { .. } => EventKind::Write,
            StoreEvent::Replicate { .. } => EventKind::Replicate,
            StoreEvent::ReplicateProgress { .. } => EventKind::ReplicateProgress,
            StoreEvent::Replicated { .. } => EventKind::Replicated,
        }
    }
}
