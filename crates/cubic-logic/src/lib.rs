//! Cubic Logic -- runtime management of behavior groups.
//!
//! This crate is the state core of CubicMusic. Cubes (managed entities) are
//! collected into groups; behaviors generated at runtime are attached to the
//! current group and fanned out to each member; every generated behavior
//! closes the current group and opens a fresh one.
//!
//! # Architecture
//!
//! - **[`BehaviorHandle`](behavior::BehaviorHandle)**: opaque identity of one
//!   loaded behavior unit.
//! - **[`BehaviorLoader`](behavior::BehaviorLoader)**: the seam to whatever
//!   compiles behaviors and instantiates them on entities. Passed in by the
//!   caller, never owned.
//! - **[`EntityBehaviorBinding`](binding::EntityBehaviorBinding)**: which
//!   behaviors are live on one entity, with no duplicates.
//! - **[`ObjectGroup`](group::ObjectGroup)**: a cohort of entities and the
//!   behaviors applied to all of them.
//! - **[`GroupSequencer`](sequencer::GroupSequencer)**: the append-only group
//!   history and its current group.
//!
//! All mutation is synchronous and single-threaded. Slow work (the AI request
//! and compilation) finishes before the sequencer is told about a behavior.

#![deny(unsafe_code)]

pub mod behavior;
pub mod binding;
pub mod entity;
pub mod event;
pub mod group;
pub mod sequencer;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by group and sequencer operations.
///
/// These indicate an integration bug in the caller (an entity that was never
/// added, or added twice) or a loader that failed mid-attach.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LogicError {
    /// The entity is not managed by the group or sequencer.
    #[error("entity {entity} is not managed by any group")]
    UnknownEntity { entity: entity::EntityId },

    /// The entity is already a member of a group.
    #[error("entity {entity} already belongs to {group}")]
    DuplicateEntity {
        entity: entity::EntityId,
        group: group::GroupId,
    },

    /// No group exists with that id.
    #[error("{group} does not exist")]
    UnknownGroup { group: group::GroupId },

    /// A behavior could not be instantiated on a member; the attach was
    /// rolled back.
    #[error("attaching behavior {behavior} to {group} failed on entity {entity}")]
    Attach {
        behavior: behavior::BehaviorHandle,
        group: group::GroupId,
        entity: entity::EntityId,
        source: behavior::LoaderError,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::behavior::{BehaviorHandle, BehaviorLoader, LoaderError, ProxyId};
    pub use crate::binding::EntityBehaviorBinding;
    pub use crate::entity::{EntityAllocator, EntityId};
    pub use crate::event::{EventLog, GroupEvent};
    pub use crate::group::{GroupId, JoinPolicy, ObjectGroup};
    pub use crate::sequencer::{GenerationRound, GroupSequencer};
    pub use crate::LogicError;
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
