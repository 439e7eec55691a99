//! Per-entity record of attached behaviors.
//!
//! An [`EntityBehaviorBinding`] remembers which behaviors are live on one
//! entity, together with the proxy the loader created for each. A behavior
//! is attached at most once per entity.

use tracing::trace;

use crate::behavior::{BehaviorHandle, BehaviorLoader, LoaderError, ProxyId};
use crate::entity::EntityId;

/// The behaviors currently attached to a single entity.
#[derive(Debug, Clone)]
pub struct EntityBehaviorBinding {
    entity: EntityId,
    /// Attachment order is kept so release order is deterministic.
    attached: Vec<(BehaviorHandle, ProxyId)>,
}

impl EntityBehaviorBinding {
    /// An empty binding for `entity`.
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            attached: Vec::new(),
        }
    }

    /// The entity this binding belongs to.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Attach `behavior` to the entity.
    ///
    /// Returns `Ok(false)` without touching the loader when the behavior is
    /// already attached.
    ///
    /// # Errors
    ///
    /// Propagates the loader's failure to instantiate; nothing is recorded in
    /// that case.
    pub fn attach(
        &mut self,
        behavior: BehaviorHandle,
        loader: &mut dyn BehaviorLoader,
    ) -> Result<bool, LoaderError> {
        if self.contains(behavior) {
            return Ok(false);
        }
        let proxy = loader.instantiate(behavior, self.entity)?;
        trace!(entity = %self.entity, %behavior, ?proxy, "behavior attached to entity");
        self.attached.push((behavior, proxy));
        Ok(true)
    }

    /// Detach `behavior` and release its proxy. Returns `false` if it was not
    /// attached.
    pub fn detach(&mut self, behavior: BehaviorHandle, loader: &mut dyn BehaviorLoader) -> bool {
        let Some(pos) = self.attached.iter().position(|(b, _)| *b == behavior) else {
            return false;
        };
        let (_, proxy) = self.attached.remove(pos);
        loader.release(proxy);
        trace!(entity = %self.entity, %behavior, ?proxy, "behavior detached from entity");
        true
    }

    /// `true` if `behavior` is attached.
    pub fn contains(&self, behavior: BehaviorHandle) -> bool {
        self.attached.iter().any(|(b, _)| *b == behavior)
    }

    /// The proxy backing `behavior` on this entity, if attached.
    pub fn proxy_for(&self, behavior: BehaviorHandle) -> Option<ProxyId> {
        self.attached
            .iter()
            .find(|(b, _)| *b == behavior)
            .map(|(_, p)| *p)
    }

    /// Attached behaviors in attachment order.
    pub fn behaviors(&self) -> impl Iterator<Item = BehaviorHandle> + '_ {
        self.attached.iter().map(|(b, _)| *b)
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }

    /// Release every proxy and clear the binding. Returns how many were
    /// released.
    pub fn release_all(&mut self, loader: &mut dyn BehaviorLoader) -> usize {
        let released = self.attached.len();
        for (_, proxy) in self.attached.drain(..) {
            loader.release(proxy);
        }
        released
    }
}
