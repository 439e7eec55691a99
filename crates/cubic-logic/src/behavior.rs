//! Behavior handles and the loader seam.
//!
//! A behavior is one packaged unit of runtime logic, generated outside the
//! core (typically from AI-produced source) and loaded by a
//! [`BehaviorLoader`]. The core only ever sees two opaque tokens:
//!
//! - [`BehaviorHandle`]: the loaded unit itself, compared by identity.
//! - [`ProxyId`]: one live instance of a behavior bound to one entity.
//!
//! The loader is passed by `&mut dyn BehaviorLoader` into every operation that
//! needs to instantiate or release something. The core never owns it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::EntityId;

// ---------------------------------------------------------------------------
// BehaviorHandle
// ---------------------------------------------------------------------------

/// Identity of one compiled and loaded behavior unit.
///
/// Two handles are equal only if they came from the same successful
/// `compile_and_load` call. Loading identical source twice yields two
/// distinct handles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BehaviorHandle(u64);

impl BehaviorHandle {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BehaviorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Behavior(#{})", self.0)
    }
}

impl fmt::Display for BehaviorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProxyId
// ---------------------------------------------------------------------------

/// One behavior instance living on one entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(u64);

impl ProxyId {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy(#{})", self.0)
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy #{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// LoaderError
// ---------------------------------------------------------------------------

/// Failures reported by a [`BehaviorLoader`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoaderError {
    /// The source text did not compile into a loadable behavior.
    #[error("behavior source failed to compile: {0}")]
    Compile(String),

    /// The handle does not name a behavior currently loaded.
    #[error("behavior {0} is not loaded")]
    UnknownBehavior(BehaviorHandle),

    /// The behavior could not be instantiated on the entity.
    #[error("failed to instantiate behavior {behavior} on entity {entity}: {reason}")]
    Instantiate {
        behavior: BehaviorHandle,
        entity: EntityId,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// BehaviorLoader
// ---------------------------------------------------------------------------

/// Compiles behavior source and manages the live instances of behaviors.
pub trait BehaviorLoader {
    /// Compile `source` and load it, returning a fresh handle.
    ///
    /// # Errors
    ///
    /// [`LoaderError::Compile`] when the source is rejected.
    fn compile_and_load(&mut self, source: &str) -> Result<BehaviorHandle, LoaderError>;

    /// Create a live instance of `behavior` bound to `entity`.
    ///
    /// # Errors
    ///
    /// [`LoaderError::UnknownBehavior`] if the handle is not loaded,
    /// [`LoaderError::Instantiate`] if the instance could not be created.
    fn instantiate(
        &mut self,
        behavior: BehaviorHandle,
        entity: EntityId,
    ) -> Result<ProxyId, LoaderError>;

    /// Destroy a live instance. Unknown proxies are ignored.
    fn release(&mut self, proxy: ProxyId);

    /// Drop a loaded behavior. Returns `false` if it was not loaded.
    ///
    /// Callers detach the behavior from every entity first; instances still
    /// alive at this point are released by the loader.
    fn unload(&mut self, behavior: BehaviorHandle) -> bool;
}
