//! The group sequencer: staged eras of behavior.
//!
//! [`GroupSequencer`] owns an append-only history of [`ObjectGroup`]s. The
//! newest group is *current*: new entities join it, and each freshly generated
//! behavior is applied to it. Once a behavior has been applied the sequencer
//! opens a new, empty current group, so the behavior reaches exactly the
//! entities added before it was generated and none added afterwards.
//!
//! ```text
//! add E1 ─┐                  add E2 ─┐
//!         ▼                          ▼
//!   [group 0: E1] ─ A ─► [group 1: E2] ─ B ─► [group 2: (empty, current)]
//!         E1 = {A}               E2 = {B}
//! ```
//!
//! Older groups are never rotated away; they keep the behaviors they had
//! when they were superseded.
//!
//! # Example
//!
//! ```
//! use cubic_logic::prelude::*;
//! # use cubic_logic::behavior::{LoaderError, ProxyId};
//! # #[derive(Default)]
//! # struct Loader { next: u64 }
//! # impl BehaviorLoader for Loader {
//! #     fn compile_and_load(&mut self, _: &str) -> Result<BehaviorHandle, LoaderError> {
//! #         self.next += 1;
//! #         Ok(BehaviorHandle::from_raw(self.next))
//! #     }
//! #     fn instantiate(&mut self, _: BehaviorHandle, _: EntityId) -> Result<ProxyId, LoaderError> {
//! #         self.next += 1;
//! #         Ok(ProxyId::from_raw(self.next))
//! #     }
//! #     fn release(&mut self, _: ProxyId) {}
//! #     fn unload(&mut self, _: BehaviorHandle) -> bool { true }
//! # }
//! let mut loader = Loader::default();
//! let mut entities = EntityAllocator::new();
//! let mut sequencer = GroupSequencer::new();
//!
//! let e1 = entities.allocate();
//! sequencer.add_entity_to_current_group(e1, &mut loader).unwrap();
//!
//! let spin = loader.compile_and_load("spin").unwrap();
//! let round = sequencer.on_behavior_generated(spin, &mut loader).unwrap();
//!
//! assert!(round.newly_attached);
//! assert_eq!(sequencer.group_count(), 2);
//! assert_eq!(sequencer.behaviors_of(e1).unwrap(), vec![spin]);
//! assert!(sequencer.current_group().is_empty());
//! ```

use std::collections::HashMap;

use tracing::{debug, error, info};

use crate::behavior::{BehaviorHandle, BehaviorLoader};
use crate::entity::EntityId;
use crate::event::{EventLog, GroupEvent};
use crate::group::{GroupId, JoinPolicy, ObjectGroup};
use crate::LogicError;

/// Outcome of one completed generation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRound {
    pub behavior: BehaviorHandle,
    /// The group the behavior was applied to.
    pub applied_to: GroupId,
    /// `false` when that group already carried the behavior.
    pub newly_attached: bool,
    /// The fresh group that is now current.
    pub current: GroupId,
}

/// Owns the group history and routes entities and behaviors to the current
/// group.
#[derive(Debug)]
pub struct GroupSequencer {
    /// Oldest first; the last element is current. Never empty.
    groups: Vec<ObjectGroup>,
    /// Which group each managed entity belongs to.
    membership: HashMap<EntityId, GroupId>,
    join_policy: JoinPolicy,
    events: EventLog,
}

impl GroupSequencer {
    /// A sequencer holding one empty current group. Entities join bare.
    pub fn new() -> Self {
        Self::with_join_policy(JoinPolicy::Bare)
    }

    /// A sequencer whose entities join the current group under `join_policy`.
    pub fn with_join_policy(join_policy: JoinPolicy) -> Self {
        Self {
            groups: vec![ObjectGroup::new(GroupId(0))],
            membership: HashMap::new(),
            join_policy,
            events: EventLog::new(),
        }
    }

    pub fn join_policy(&self) -> JoinPolicy {
        self.join_policy
    }

    /// Add `entity` to the current group.
    ///
    /// # Errors
    ///
    /// - [`LogicError::DuplicateEntity`] if the entity already belongs to any
    ///   group.
    /// - [`LogicError::Attach`] if the join policy inherits behaviors and one
    ///   of them fails to instantiate.
    pub fn add_entity_to_current_group(
        &mut self,
        entity: EntityId,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<GroupId, LogicError> {
        if let Some(&group) = self.membership.get(&entity) {
            error!(%entity, %group, "entity is already managed");
            return Err(LogicError::DuplicateEntity { entity, group });
        }

        let policy = self.join_policy;
        let current = self.current_group_mut();
        current.add_entity(entity, policy, loader)?;
        let group = current.id();
        let group_size = current.count();

        self.membership.insert(entity, group);
        self.events.record(GroupEvent::EntityAdded {
            entity,
            group,
            group_size,
        });
        info!(%entity, %group, group_size, "entity added to current group");
        Ok(group)
    }

    /// Apply a freshly generated behavior to the current group, then open a
    /// new current group.
    ///
    /// The rotation happens even when the current group already carried the
    /// behavior: every completed generation round opens a new era.
    ///
    /// # Errors
    ///
    /// [`LogicError::Attach`] if a member of the current group fails to
    /// instantiate the behavior. The attach is rolled back and no rotation
    /// takes place.
    pub fn on_behavior_generated(
        &mut self,
        behavior: BehaviorHandle,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<GenerationRound, LogicError> {
        let current = self.current_group_mut();
        let previous = current.id();
        let members = current.count();

        let newly_attached = match current.attach_behavior(behavior, loader) {
            Ok(newly) => newly,
            Err(err) => {
                error!(%behavior, group = %previous, error = %err, "behavior could not be applied");
                self.events.record(GroupEvent::AttachFailed {
                    behavior,
                    group: previous,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };
        self.events.record(GroupEvent::BehaviorAttached {
            behavior,
            group: previous,
            newly_attached,
            members,
        });

        let next = GroupId(self.groups.len() as u32);
        self.groups.push(ObjectGroup::new(next));
        self.events.record(GroupEvent::RoundCompleted {
            behavior,
            previous,
            current: next,
            group_count: self.groups.len(),
        });
        info!(
            %behavior,
            applied_to = %previous,
            newly_attached,
            members,
            current = %next,
            "generation round completed"
        );

        Ok(GenerationRound {
            behavior,
            applied_to: previous,
            newly_attached,
            current: next,
        })
    }

    /// Detach `behavior` from every group that carries it, then unload it.
    /// Returns the number of groups it was removed from.
    pub fn retire_behavior(
        &mut self,
        behavior: BehaviorHandle,
        loader: &mut dyn BehaviorLoader,
    ) -> usize {
        let mut affected = 0;
        for group in &mut self.groups {
            if group.detach_behavior(behavior, loader) {
                affected += 1;
                self.events.record(GroupEvent::BehaviorDetached {
                    behavior,
                    group: group.id(),
                    members: group.count(),
                });
            }
        }
        let unloaded = loader.unload(behavior);
        debug!(%behavior, affected, unloaded, "behavior retired");
        affected
    }

    /// Remove `entity` from its group and release its proxies. Returns the
    /// number of proxies released.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownEntity`] if the entity is not managed.
    pub fn remove_entity(
        &mut self,
        entity: EntityId,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<usize, LogicError> {
        let group_id = self.group_of(entity)?;
        let group = self
            .groups
            .get_mut(group_id.index())
            .ok_or(LogicError::UnknownGroup { group: group_id })?;
        let released = group.remove_entity(entity, loader)?;
        let group_size = group.count();

        self.membership.remove(&entity);
        self.events.record(GroupEvent::EntityRemoved {
            entity,
            group: group_id,
            group_size,
            released,
        });
        debug!(%entity, group = %group_id, released, "entity removed");
        Ok(released)
    }

    /// The group `entity` belongs to.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownEntity`] if the entity is not managed.
    pub fn group_of(&self, entity: EntityId) -> Result<GroupId, LogicError> {
        self.membership.get(&entity).copied().ok_or_else(|| {
            error!(%entity, "entity is not managed by any group");
            LogicError::UnknownEntity { entity }
        })
    }

    /// Behaviors attached to `entity`, in attachment order.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownEntity`] if the entity is not managed.
    pub fn behaviors_of(&self, entity: EntityId) -> Result<Vec<BehaviorHandle>, LogicError> {
        let group = self.group(self.group_of(entity)?)?;
        Ok(group.binding(entity)?.behaviors().collect())
    }

    /// The group new entities and behaviors go to.
    pub fn current_group(&self) -> &ObjectGroup {
        // `groups` starts with one element and only grows.
        &self.groups[self.groups.len() - 1]
    }

    pub fn current_group_id(&self) -> GroupId {
        self.current_group().id()
    }

    /// Look up a group by id.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownGroup`] if no such group exists.
    pub fn group(&self, id: GroupId) -> Result<&ObjectGroup, LogicError> {
        self.groups
            .get(id.index())
            .ok_or(LogicError::UnknownGroup { group: id })
    }

    /// All groups, oldest first.
    pub fn groups(&self) -> &[ObjectGroup] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of managed entities across all groups.
    pub fn entity_count(&self) -> usize {
        self.membership.len()
    }

    /// Pending events, oldest first.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Take all pending events.
    pub fn drain_events(&mut self) -> Vec<GroupEvent> {
        self.events.drain()
    }

    fn current_group_mut(&mut self) -> &mut ObjectGroup {
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }
}

impl Default for GroupSequencer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityAllocator;
    use crate::test_support::RecordingLoader;

    #[test]
    fn starts_with_one_empty_group() {
        let sequencer = GroupSequencer::new();
        assert_eq!(sequencer.group_count(), 1);
        assert_eq!(sequencer.current_group_id(), GroupId(0));
        assert!(sequencer.current_group().is_empty());
        assert_eq!(sequencer.join_policy(), JoinPolicy::Bare);
    }

    #[test]
    fn every_round_rotates_even_with_the_same_handle() {
        let mut loader = RecordingLoader::new();
        let mut sequencer = GroupSequencer::new();
        let spin = loader.compile_and_load("spin").unwrap();

        let first = sequencer.on_behavior_generated(spin, &mut loader).unwrap();
        assert!(first.newly_attached);
        assert_eq!(first.applied_to, GroupId(0));
        assert_eq!(first.current, GroupId(1));

        let second = sequencer.on_behavior_generated(spin, &mut loader).unwrap();
        assert!(second.newly_attached, "group 1 had never seen the behavior");
        assert_eq!(second.current, GroupId(2));

        assert_eq!(sequencer.group_count(), 3);
        assert_eq!(sequencer.group(GroupId(0)).unwrap().behaviors(), &[spin]);
        assert_eq!(sequencer.group(GroupId(1)).unwrap().behaviors(), &[spin]);
        assert!(sequencer.current_group().behaviors().is_empty());
    }

    #[test]
    fn duplicate_entity_across_groups_is_rejected() {
        let mut loader = RecordingLoader::new();
        let mut sequencer = GroupSequencer::new();
        let mut alloc = EntityAllocator::new();
        let cube = alloc.allocate();

        sequencer.add_entity_to_current_group(cube, &mut loader).unwrap();
        let spin = loader.compile_and_load("spin").unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();

        let err = sequencer
            .add_entity_to_current_group(cube, &mut loader)
            .unwrap_err();
        assert!(matches!(err, LogicError::DuplicateEntity { group, .. } if group == GroupId(0)));
        assert_eq!(sequencer.entity_count(), 1);
    }

    #[test]
    fn failed_attach_does_not_rotate() {
        let mut loader = RecordingLoader::new();
        let mut sequencer = GroupSequencer::new();
        let mut alloc = EntityAllocator::new();
        let cube = alloc.allocate();
        sequencer.add_entity_to_current_group(cube, &mut loader).unwrap();

        let spin = loader.compile_and_load("spin").unwrap();
        loader.fail_on_entity(cube);
        assert!(sequencer.on_behavior_generated(spin, &mut loader).is_err());
        assert_eq!(sequencer.group_count(), 1);
        assert!(!sequencer.current_group().has_behavior(spin));

        let events = sequencer.drain_events();
        assert!(matches!(events.last(), Some(GroupEvent::AttachFailed { .. })));
    }

    #[test]
    fn retire_detaches_everywhere_and_unloads() {
        let mut loader = RecordingLoader::new();
        let mut sequencer = GroupSequencer::with_join_policy(JoinPolicy::InheritExisting);
        let mut alloc = EntityAllocator::new();
        let spin = loader.compile_and_load("spin").unwrap();

        let e1 = alloc.allocate();
        sequencer.add_entity_to_current_group(e1, &mut loader).unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();
        let e2 = alloc.allocate();
        sequencer.add_entity_to_current_group(e2, &mut loader).unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();

        assert_eq!(sequencer.retire_behavior(spin, &mut loader), 2);
        assert!(sequencer.behaviors_of(e1).unwrap().is_empty());
        assert!(sequencer.behaviors_of(e2).unwrap().is_empty());
        assert_eq!(loader.live_proxies(), 0);
        assert_eq!(loader.unloaded(), &[spin]);
    }

    #[test]
    fn remove_entity_updates_membership() {
        let mut loader = RecordingLoader::new();
        let mut sequencer = GroupSequencer::new();
        let mut alloc = EntityAllocator::new();
        let cube = alloc.allocate();
        sequencer.add_entity_to_current_group(cube, &mut loader).unwrap();
        let spin = loader.compile_and_load("spin").unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();

        assert_eq!(sequencer.remove_entity(cube, &mut loader).unwrap(), 1);
        assert_eq!(sequencer.entity_count(), 0);
        assert!(matches!(
            sequencer.behaviors_of(cube),
            Err(LogicError::UnknownEntity { .. })
        ));
        assert!(sequencer.remove_entity(cube, &mut loader).is_err());
    }

    #[test]
    fn events_trace_a_round() {
        let mut loader = RecordingLoader::new();
        let mut sequencer = GroupSequencer::new();
        let mut alloc = EntityAllocator::new();
        let cube = alloc.allocate();
        sequencer.add_entity_to_current_group(cube, &mut loader).unwrap();
        let spin = loader.compile_and_load("spin").unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();

        let events = sequencer.drain_events();
        assert_eq!(
            events,
            vec![
                GroupEvent::EntityAdded {
                    entity: cube,
                    group: GroupId(0),
                    group_size: 1,
                },
                GroupEvent::BehaviorAttached {
                    behavior: spin,
                    group: GroupId(0),
                    newly_attached: true,
                    members: 1,
                },
                GroupEvent::RoundCompleted {
                    behavior: spin,
                    previous: GroupId(0),
                    current: GroupId(1),
                    group_count: 2,
                },
            ]
        );
        assert!(sequencer.events().is_empty());
    }
}
