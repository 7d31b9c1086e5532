//! Engine event notifications.
//!
//! The engine reports lifecycle changes through an [`EventBus`]. Listeners
//! are registered per [`EventKind`], invoked synchronously at the trigger
//! point in registration order, and never influence the engine.

use crate::engine::MergeOutcome;
use crate::types::SegmentId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An engine lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The mutable segment was sealed and queued as read-only.
    MutableSegmentSealed {
        /// The sealed segment.
        segment_id: SegmentId,
        /// Read-only segments queued after the seal.
        read_only_count: usize,
    },
    /// A read-only merge started.
    MergeStarted,
    /// A read-only merge finished.
    MergeEnded {
        /// How it finished.
        outcome: MergeOutcome,
    },
    /// A bottom segments merge started.
    BottomSegmentsMergeStarted,
    /// A bottom segments merge finished.
    BottomSegmentsMergeEnded {
        /// How it finished.
        outcome: MergeOutcome,
    },
    /// A merge wrote a new disk segment.
    DiskSegmentCreated {
        /// The new segment.
        segment_id: SegmentId,
    },
    /// A new disk segment was published.
    DiskSegmentActivated {
        /// The published segment.
        segment_id: SegmentId,
    },
    /// The log of a merged read-only segment could not be removed.
    ReadOnlySegmentDropFailed {
        /// The segment whose log remains.
        segment_id: SegmentId,
        /// Error message.
        error: String,
    },
    /// The stores of a superseded disk segment could not be removed.
    DiskSegmentDropFailed {
        /// The segment whose stores remain.
        segment_id: SegmentId,
        /// Error message.
        error: String,
    },
    /// A partially written disk segment could not be removed.
    DiskSegmentCreatorDropFailed {
        /// The abandoned segment.
        segment_id: SegmentId,
        /// Error message.
        error: String,
    },
    /// The engine is closing.
    Disposing,
}

impl EngineEvent {
    /// The kind listeners subscribe to.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MutableSegmentSealed { .. } => EventKind::MutableSegmentSealed,
            Self::MergeStarted => EventKind::MergeStarted,
            Self::MergeEnded { .. } => EventKind::MergeEnded,
            Self::BottomSegmentsMergeStarted => EventKind::BottomSegmentsMergeStarted,
            Self::BottomSegmentsMergeEnded { .. } => EventKind::BottomSegmentsMergeEnded,
            Self::DiskSegmentCreated { .. } => EventKind::DiskSegmentCreated,
            Self::DiskSegmentActivated { .. } => EventKind::DiskSegmentActivated,
            Self::ReadOnlySegmentDropFailed { .. } => EventKind::ReadOnlySegmentDropFailed,
            Self::DiskSegmentDropFailed { .. } => EventKind::DiskSegmentDropFailed,
            Self::DiskSegmentCreatorDropFailed { .. } => EventKind::DiskSegmentCreatorDropFailed,
            Self::Disposing => EventKind::Disposing,
        }
    }
}

/// Event discriminant used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`EngineEvent::MutableSegmentSealed`].
    MutableSegmentSealed,
    /// See [`EngineEvent::MergeStarted`].
    MergeStarted,
    /// See [`EngineEvent::MergeEnded`].
    MergeEnded,
    /// See [`EngineEvent::BottomSegmentsMergeStarted`].
    BottomSegmentsMergeStarted,
    /// See [`EngineEvent::BottomSegmentsMergeEnded`].
    BottomSegmentsMergeEnded,
    /// See [`EngineEvent::DiskSegmentCreated`].
    DiskSegmentCreated,
    /// See [`EngineEvent::DiskSegmentActivated`].
    DiskSegmentActivated,
    /// See [`EngineEvent::ReadOnlySegmentDropFailed`].
    ReadOnlySegmentDropFailed,
    /// See [`EngineEvent::DiskSegmentDropFailed`].
    DiskSegmentDropFailed,
    /// See [`EngineEvent::DiskSegmentCreatorDropFailed`].
    DiskSegmentCreatorDropFailed,
    /// See [`EngineEvent::Disposing`].
    Disposing,
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Ordered listener registry.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates a bus without listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let mut found = false;
        for list in listeners.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            found |= list.len() != before;
        }
        found
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Invokes every listener of the event's kind.
    ///
    /// Listeners run without the registry lock held, so they may subscribe,
    /// unsubscribe, or call back into the engine.
    pub fn emit(&self, event: &EngineEvent) {
        let targets: Vec<Listener> = match self.listeners.read().get(&event.kind()) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in targets {
            listener(event);
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("EventBus")
            .field("kinds", &listeners.len())
            .field(
                "listeners",
                &listeners.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}
