//! Object groups: cohorts of entities sharing an era of behaviors.
//!
//! An [`ObjectGroup`] owns a list of member entities, one
//! [`EntityBehaviorBinding`] per member, and the set of behaviors applied to
//! the group as a whole. Attaching a behavior to the group fans it out to
//! every member; detaching it pulls it back from every member.
//!
//! # Invariants
//!
//! - The group behavior set never holds the same handle twice.
//! - Every member carries every group behavior, except members that joined
//!   with [`JoinPolicy::Bare`] after the behavior was attached.
//! - Attaching is all-or-nothing across members: if one member fails to
//!   instantiate the behavior, the members already done are rolled back and
//!   the group is left as it was.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::behavior::{BehaviorHandle, BehaviorLoader};
use crate::binding::EntityBehaviorBinding;
use crate::entity::EntityId;
use crate::LogicError;

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Position of a group in its sequencer's history (0 = oldest).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}", self.0)
    }
}

// ---------------------------------------------------------------------------
// JoinPolicy
// ---------------------------------------------------------------------------

/// What a newly joining entity receives from its group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Start with no behaviors; only behaviors attached later reach the entity.
    #[default]
    Bare,
    /// Receive every behavior the group already carries.
    InheritExisting,
}

// ---------------------------------------------------------------------------
// ObjectGroup
// ---------------------------------------------------------------------------

/// A cohort of entities plus the behaviors applied to the cohort.
#[derive(Debug, Clone)]
pub struct ObjectGroup {
    id: GroupId,
    /// Members in join order.
    entities: Vec<EntityId>,
    bindings: HashMap<EntityId, EntityBehaviorBinding>,
    /// Group-wide behaviors in attachment order.
    behaviors: Vec<BehaviorHandle>,
}

impl ObjectGroup {
    /// An empty group.
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            entities: Vec::new(),
            bindings: HashMap::new(),
            behaviors: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Add `entity` as a member.
    ///
    /// With [`JoinPolicy::InheritExisting`] every behavior the group already
    /// carries is attached to the newcomer.
    ///
    /// # Errors
    ///
    /// - [`LogicError::DuplicateEntity`] if `entity` is already a member.
    /// - [`LogicError::Attach`] if an inherited behavior fails to instantiate;
    ///   whatever was attached to the newcomer is released and it is not added.
    pub fn add_entity(
        &mut self,
        entity: EntityId,
        policy: JoinPolicy,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<(), LogicError> {
        if self.bindings.contains_key(&entity) {
            return Err(LogicError::DuplicateEntity {
                entity,
                group: self.id,
            });
        }

        let mut binding = EntityBehaviorBinding::new(entity);
        if policy == JoinPolicy::InheritExisting {
            for &behavior in &self.behaviors {
                if let Err(source) = binding.attach(behavior, loader) {
                    binding.release_all(loader);
                    return Err(LogicError::Attach {
                        behavior,
                        group: self.id,
                        entity,
                        source,
                    });
                }
            }
        }

        debug!(
            group = %self.id,
            %entity,
            inherited = binding.len(),
            "entity joined group"
        );
        self.entities.push(entity);
        self.bindings.insert(entity, binding);
        Ok(())
    }

    /// Remove `entity` and release all of its proxies. Returns how many
    /// proxies were released.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownEntity`] if `entity` is not a member.
    pub fn remove_entity(
        &mut self,
        entity: EntityId,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<usize, LogicError> {
        let mut binding = self
            .bindings
            .remove(&entity)
            .ok_or(LogicError::UnknownEntity { entity })?;
        self.entities.retain(|e| *e != entity);
        Ok(binding.release_all(loader))
    }

    /// Apply `behavior` to the whole group.
    ///
    /// Returns `Ok(false)` and does nothing if the group already carries it.
    ///
    /// # Errors
    ///
    /// [`LogicError::Attach`] if a member fails to instantiate the behavior.
    /// Members attached earlier in the same call are detached again and the
    /// behavior is not recorded.
    pub fn attach_behavior(
        &mut self,
        behavior: BehaviorHandle,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<bool, LogicError> {
        if self.behaviors.contains(&behavior) {
            debug!(group = %self.id, %behavior, "behavior already applied to group");
            return Ok(false);
        }

        let mut done: Vec<EntityId> = Vec::with_capacity(self.entities.len());
        for &entity in &self.entities {
            let Some(binding) = self.bindings.get_mut(&entity) else {
                continue;
            };
            match binding.attach(behavior, loader) {
                Ok(true) => done.push(entity),
                Ok(false) => {}
                Err(source) => {
                    warn!(
                        group = %self.id,
                        %behavior,
                        %entity,
                        rolled_back = done.len(),
                        error = %source,
                        "attach failed on a member, rolling back"
                    );
                    for undo in done {
                        if let Some(b) = self.bindings.get_mut(&undo) {
                            b.detach(behavior, loader);
                        }
                    }
                    return Err(LogicError::Attach {
                        behavior,
                        group: self.id,
                        entity,
                        source,
                    });
                }
            }
        }

        self.behaviors.push(behavior);
        debug!(
            group = %self.id,
            %behavior,
            members = self.entities.len(),
            "behavior applied to group"
        );
        Ok(true)
    }

    /// Remove `behavior` from the group and from every member, releasing its
    /// proxies. Returns `false` if the group did not carry it.
    pub fn detach_behavior(
        &mut self,
        behavior: BehaviorHandle,
        loader: &mut dyn BehaviorLoader,
    ) -> bool {
        let Some(pos) = self.behaviors.iter().position(|b| *b == behavior) else {
            return false;
        };
        self.behaviors.remove(pos);
        for entity in &self.entities {
            if let Some(binding) = self.bindings.get_mut(entity) {
                binding.detach(behavior, loader);
            }
        }
        debug!(group = %self.id, %behavior, "behavior removed from group");
        true
    }

    /// Number of member entities.
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Members in join order.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Group-wide behaviors in attachment order.
    pub fn behaviors(&self) -> &[BehaviorHandle] {
        &self.behaviors
    }

    pub fn contains_entity(&self, entity: EntityId) -> bool {
        self.bindings.contains_key(&entity)
    }

    pub fn has_behavior(&self, behavior: BehaviorHandle) -> bool {
        self.behaviors.contains(&behavior)
    }

    /// The binding of a member.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownEntity`] if `entity` is not a member.
    pub fn binding(&self, entity: EntityId) -> Result<&EntityBehaviorBinding, LogicError> {
        self.bindings
            .get(&entity)
            .ok_or(LogicError::UnknownEntity { entity })
    }

    /// Whether a member carries `behavior`.
    ///
    /// # Errors
    ///
    /// [`LogicError::UnknownEntity`] if `entity` is not a member.
    pub fn entity_has_behavior(
        &self,
        entity: EntityId,
        behavior: BehaviorHandle,
    ) -> Result<bool, LogicError> {
        Ok(self.binding(entity)?.contains(behavior))
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

    fn group_with(n: usize) -> (ObjectGroup, RecordingLoader, Vec<EntityId>) {
        let mut loader = RecordingLoader::new();
        let mut alloc = EntityAllocator::new();
        let mut group = ObjectGroup::new(GroupId(0));
        let members: Vec<EntityId> = (0..n).map(|_| alloc.allocate()).collect();
        for &e in &members {
            group.add_entity(e, JoinPolicy::Bare, &mut loader).unwrap();
        }
        (group, loader, members)
    }

    #[test]
    fn attach_fans_out_to_every_member() {
        let (mut group, mut loader, members) = group_with(3);
        let spin = loader.compile_and_load("spin").unwrap();

        assert!(group.attach_behavior(spin, &mut loader).unwrap());
        for e in members {
            assert!(group.entity_has_behavior(e, spin).unwrap());
        }
        assert_eq!(loader.live_proxies(), 3);
    }

    #[test]
    fn attach_twice_returns_true_then_false() {
        let (mut group, mut loader, members) = group_with(2);
        let spin = loader.compile_and_load("spin").unwrap();

        let first = group.attach_behavior(spin, &mut loader).unwrap();
        let second = group.attach_behavior(spin, &mut loader).unwrap();

        assert_eq!((first, second), (true, false));
        assert_eq!(group.behaviors(), &[spin]);
        for e in members {
            assert_eq!(group.binding(e).unwrap().behaviors().filter(|b| *b == spin).count(), 1);
        }
        assert_eq!(loader.instantiations(), 2, "no duplicate proxies");
    }

    #[test]
    fn detach_then_attach_restores_membership() {
        let (mut group, mut loader, members) = group_with(2);
        let spin = loader.compile_and_load("spin").unwrap();
        group.attach_behavior(spin, &mut loader).unwrap();

        assert!(group.detach_behavior(spin, &mut loader));
        assert!(!group.has_behavior(spin));
        assert_eq!(loader.live_proxies(), 0);

        assert!(group.attach_behavior(spin, &mut loader).unwrap());
        for e in members {
            assert!(group.entity_has_behavior(e, spin).unwrap());
        }
    }

    #[test]
    fn detach_absent_returns_false() {
        let (mut group, mut loader, _) = group_with(1);
        let spin = loader.compile_and_load("spin").unwrap();
        assert!(!group.detach_behavior(spin, &mut loader));
    }

    #[test]
    fn bare_join_gets_nothing_retroactively() {
        let (mut group, mut loader, _) = group_with(1);
        let spin = loader.compile_and_load("spin").unwrap();
        group.attach_behavior(spin, &mut loader).unwrap();

        let late = EntityId::new(100, 0);
        group.add_entity(late, JoinPolicy::Bare, &mut loader).unwrap();
        assert!(!group.entity_has_behavior(late, spin).unwrap());
        assert_eq!(group.count(), 2);
    }

    #[test]
    fn inheriting_join_receives_existing_behaviors() {
        let (mut group, mut loader, _) = group_with(1);
        let spin = loader.compile_and_load("spin").unwrap();
        let pulse = loader.compile_and_load("pulse").unwrap();
        group.attach_behavior(spin, &mut loader).unwrap();
        group.attach_behavior(pulse, &mut loader).unwrap();

        let late = EntityId::new(100, 0);
        group
            .add_entity(late, JoinPolicy::InheritExisting, &mut loader)
            .unwrap();
        let carried: Vec<_> = group.binding(late).unwrap().behaviors().collect();
        assert_eq!(carried, vec![spin, pulse]);
    }

    #[test]
    fn failed_inherit_leaves_group_untouched() {
        let (mut group, mut loader, _) = group_with(1);
        let spin = loader.compile_and_load("spin").unwrap();
        group.attach_behavior(spin, &mut loader).unwrap();

        let late = EntityId::new(100, 0);
        loader.fail_on_entity(late);
        let err = group
            .add_entity(late, JoinPolicy::InheritExisting, &mut loader)
            .unwrap_err();
        assert!(matches!(err, LogicError::Attach { entity, .. } if entity == late));
        assert!(!group.contains_entity(late));
        assert_eq!(group.count(), 1);
    }

    #[test]
    fn duplicate_member_is_rejected() {
        let (mut group, mut loader, members) = group_with(1);
        let err = group
            .add_entity(members[0], JoinPolicy::Bare, &mut loader)
            .unwrap_err();
        assert!(matches!(err, LogicError::DuplicateEntity { .. }));
        assert_eq!(group.count(), 1);
    }

    #[test]
    fn partial_attach_failure_rolls_back() {
        let (mut group, mut loader, members) = group_with(3);
        let spin = loader.compile_and_load("spin").unwrap();
        loader.fail_on_entity(members[2]);

        let err = group.attach_behavior(spin, &mut loader).unwrap_err();
        assert!(matches!(err, LogicError::Attach { entity, .. } if entity == members[2]));
        assert!(!group.has_behavior(spin));
        for e in &members {
            assert!(!group.entity_has_behavior(*e, spin).unwrap());
        }
        assert_eq!(loader.live_proxies(), 0, "rolled back proxies are released");
    }

    #[test]
    fn remove_entity_releases_its_proxies() {
        let (mut group, mut loader, members) = group_with(2);
        let spin = loader.compile_and_load("spin").unwrap();
        group.attach_behavior(spin, &mut loader).unwrap();

        assert_eq!(group.remove_entity(members[0], &mut loader).unwrap(), 1);
        assert_eq!(group.entities(), &[members[1]]);
        assert_eq!(loader.live_proxies(), 1);
        assert!(matches!(
            group.remove_entity(members[0], &mut loader),
            Err(LogicError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn unknown_entity_lookup_fails() {
        let (group, _, _) = group_with(0);
        let stranger = EntityId::new(7, 0);
        assert!(matches!(
            group.binding(stranger),
            Err(LogicError::UnknownEntity { entity }) if entity == stranger
        ));
    }
}
