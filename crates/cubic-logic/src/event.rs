//! Outbound notifications from the group sequencer.
//!
//! Every state change the [`GroupSequencer`](crate::sequencer::GroupSequencer)
//! performs is recorded as a [`GroupEvent`] in an [`EventLog`]. The
//! orchestration layer drains the log whenever it wants to refresh a status
//! display or forward the changes elsewhere; nothing is pushed to callbacks.
//!
//! # Example
//!
//! ```
//! use cubic_logic::event::{EventLog, GroupEvent};
//! use cubic_logic::entity::EntityId;
//! use cubic_logic::group::GroupId;
//!
//! let mut log = EventLog::new();
//! log.record(GroupEvent::EntityAdded {
//!     entity: EntityId::new(0, 0),
//!     group: GroupId(0),
//!     group_size: 1,
//! });
//!
//! assert_eq!(log.for_group(GroupId(0)).count(), 1);
//! let drained = log.drain();
//! assert_eq!(drained.len(), 1);
//! assert!(log.is_empty());
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::behavior::BehaviorHandle;
use crate::entity::EntityId;
use crate::group::GroupId;

/// A single observable change of group state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupEvent {
    /// An entity joined a group.
    EntityAdded {
        entity: EntityId,
        group: GroupId,
        /// Member count after the join.
        group_size: usize,
    },
    /// An entity left its group and its proxies were released.
    EntityRemoved {
        entity: EntityId,
        group: GroupId,
        group_size: usize,
        released: usize,
    },
    /// A behavior was offered to a group.
    BehaviorAttached {
        behavior: BehaviorHandle,
        group: GroupId,
        /// `false` when the group already carried the behavior.
        newly_attached: bool,
        members: usize,
    },
    /// A behavior was removed from a group.
    BehaviorDetached {
        behavior: BehaviorHandle,
        group: GroupId,
        members: usize,
    },
    /// Fanning a behavior out to a group failed and was rolled back.
    AttachFailed {
        behavior: BehaviorHandle,
        group: GroupId,
        reason: String,
    },
    /// A generation round finished and a fresh group became current.
    RoundCompleted {
        behavior: BehaviorHandle,
        previous: GroupId,
        current: GroupId,
        group_count: usize,
    },
}

impl GroupEvent {
    /// The group the event concerns (the new current group for
    /// [`GroupEvent::RoundCompleted`]).
    pub fn group(&self) -> GroupId {
        match self {
            GroupEvent::EntityAdded { group, .. }
            | GroupEvent::EntityRemoved { group, .. }
            | GroupEvent::BehaviorAttached { group, .. }
            | GroupEvent::BehaviorDetached { group, .. }
            | GroupEvent::AttachFailed { group, .. } => *group,
            GroupEvent::RoundCompleted { current, .. } => *current,
        }
    }
}

/// Pending events kept by a fresh [`EventLog`].
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Bounded buffer of [`GroupEvent`]s awaiting collection.
///
/// Once `capacity` events are pending, recording a new one drops the oldest
/// and bumps [`dropped`](Self::dropped).
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<GroupEvent>,
    capacity: usize,
    dropped: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log keeping at most `capacity` pending events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn record(&mut self, event: GroupEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
            if self.dropped == 1 {
                warn!(capacity = self.capacity, "group event log full; dropping oldest events");
            }
        }
        self.events.push_back(event);
    }

    /// Take every pending event, oldest first.
    pub fn drain(&mut self) -> Vec<GroupEvent> {
        std::mem::take(&mut self.events).into()
    }

    /// Pending events that concern `group`.
    pub fn for_group(&self, group: GroupId) -> impl Iterator<Item = &GroupEvent> {
        self.events.iter().filter(move |e| e.group() == group)
    }

    /// Pending events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &GroupEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events discarded because the log was full, over its lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_completed_reports_new_current_group() {
        let event = GroupEvent::RoundCompleted {
            behavior: BehaviorHandle::from_raw(1),
            previous: GroupId(0),
            current: GroupId(1),
            group_count: 2,
        };
        assert_eq!(event.group(), GroupId(1));
    }

    fn added(slot: u32) -> GroupEvent {
        GroupEvent::EntityAdded {
            entity: EntityId::new(slot, 0),
            group: GroupId(0),
            group_size: slot as usize + 1,
        }
    }

    #[test]
    fn full_log_drops_oldest() {
        let mut log = EventLog::with_capacity(3);
        for slot in 0..5 {
            log.record(added(slot));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.dropped(), 2);
        assert_eq!(log.drain(), vec![added(2), added(3), added(4)]);

        log.record(added(9));
        assert_eq!(log.events().collect::<Vec<_>>(), vec![&added(9)]);
        assert_eq!(log.dropped(), 2);
    }

    #[test]
    fn default_log_is_bounded() {
        let mut log = EventLog::new();
        assert_eq!(log.capacity(), DEFAULT_EVENT_CAPACITY);
        for slot in 0..(DEFAULT_EVENT_CAPACITY as u32 + 10) {
            log.record(added(slot));
        }
        assert_eq!(log.len(), DEFAULT_EVENT_CAPACITY);
        assert_eq!(log.dropped(), 10);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = GroupEvent::BehaviorAttached {
            behavior: BehaviorHandle::from_raw(4),
            group: GroupId(2),
            newly_attached: false,
            members: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "behavior_attached");
        assert_eq!(json["newly_attached"], false);

        let back: GroupEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
