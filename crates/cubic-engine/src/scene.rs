//! Minimal cube scene: where each cube is, how it is turned, scaled and
//! colored.
//!
//! Behaviors never write to the scene directly. Their queued
//! [`TransformCommand`]s are applied here after every behavior ran for the
//! frame, in the order they were issued.

use std::collections::BTreeMap;

use cubic_logic::entity::{EntityAllocator, EntityId};
use cubic_script_host::{TransformCommand, TransformKind};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const ONE: Vec3 = Vec3::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl std::ops::Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// RGB, components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const WHITE: Color = Color { r: 1.0, g: 1.0, b: 1.0 };

    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::WHITE
    }
}

/// Placement of a cube. Rotation is in euler degrees, each axis kept in
/// `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Transform {
    /// Unrotated, unit-scale transform at `position`.
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

/// Everything the scene knows about one cube.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CubeState {
    pub transform: Transform,
    pub color: Color,
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

/// The set of live cubes, keyed by entity id.
#[derive(Debug, Default)]
pub struct Scene {
    allocator: EntityAllocator,
    cubes: BTreeMap<EntityId, CubeState>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a white cube with `transform`.
    pub fn spawn(&mut self, transform: Transform) -> EntityId {
        let entity = self.allocator.allocate();
        self.cubes.insert(
            entity,
            CubeState {
                transform: normalized(transform),
                color: Color::default(),
            },
        );
        entity
    }

    /// Remove a cube, returning its last state.
    pub fn despawn(&mut self, entity: EntityId) -> Option<CubeState> {
        let state = self.cubes.remove(&entity)?;
        self.allocator.free(entity);
        Some(state)
    }

    pub fn get(&self, entity: EntityId) -> Option<&CubeState> {
        self.cubes.get(&entity)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.cubes.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.cubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cubes.is_empty()
    }

    /// Cubes in entity order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &CubeState)> {
        self.cubes.iter().map(|(&e, s)| (e, s))
    }

    /// Apply commands in order. Commands for cubes that no longer exist are
    /// skipped. Returns the number applied.
    pub fn apply(&mut self, commands: &[TransformCommand]) -> usize {
        let mut applied = 0;
        for command in commands {
            let Some(cube) = self.cubes.get_mut(&command.entity) else {
                tracing::warn!(
                    entity = %command.entity,
                    behavior = %command.behavior,
                    "dropping command for a cube that is gone"
                );
                continue;
            };
            apply_one(cube, command.kind);
            applied += 1;
        }
        applied
    }

    /// BLAKE3 digest of every cube's state, in entity order.
    ///
    /// Two scenes with equal hashes hold the same cubes in the same state.
    pub fn state_hash(&self) -> String {
        let cubes: Vec<(EntityId, &CubeState)> = self.iter().collect();
        match serde_json::to_vec(&cubes) {
            Ok(bytes) => blake3::hash(&bytes).to_hex().to_string(),
            Err(e) => {
                tracing::error!(error = %e, "scene state is not serializable");
                String::new()
            }
        }
    }
}

fn apply_one(cube: &mut CubeState, kind: TransformKind) {
    let t = &mut cube.transform;
    match kind {
        TransformKind::Translate { x, y, z } => t.position = t.position + Vec3::new(x, y, z),
        TransformKind::SetPosition { x, y, z } => t.position = Vec3::new(x, y, z),
        TransformKind::Rotate { x, y, z } => {
            t.rotation = wrap_degrees(t.rotation + Vec3::new(x, y, z));
        }
        TransformKind::SetScale { x, y, z } => t.scale = Vec3::new(x, y, z),
        TransformKind::SetColor { r, g, b } => cube.color = Color::new(r, g, b),
    }
}

fn normalized(mut transform: Transform) -> Transform {
    transform.rotation = wrap_degrees(transform.rotation);
    transform
}

fn wrap_degrees(v: Vec3) -> Vec3 {
    Vec3::new(v.x.rem_euclid(360.0), v.y.rem_euclid(360.0), v.z.rem_euclid(360.0))
}
