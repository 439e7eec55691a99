//! Host API for generated behavior modules.
//!
//! Defines the [`HostState`] stored inside each behavior instance's Wasmtime
//! store and [`register_host_api`], which registers every host function under
//! the `"cubic"` import namespace.
//!
//! # Design
//!
//! - **Reads are immediate:** a behavior reads the frame clock and the audio
//!   levels from a [`FrameInput`] copied into its state before each call.
//! - **Writes are deferred:** transform and color changes are queued as
//!   [`TransformCommand`]s and applied to the scene after every proxy ran.
//! - **A behavior only touches its own entity:** each command targets the
//!   entity the instance is bound to and records the behavior that issued it.
//!
//! # Host Functions (registered under `"cubic"`)
//!
//! ## Read
//! - `microphone_volume() -> f32` (0..=1)
//! - `music_volume() -> f32` (0..=1)
//! - `delta_time() -> f32` seconds since the previous frame
//! - `elapsed_time() -> f64` seconds since the scene started
//! - `frame_number() -> i64`
//! - `entity_id() -> i64`
//! - `random() -> f32` in `[0, 1)`, deterministic per instance
//!
//! ## Write
//! - `translate(x: f32, y: f32, z: f32)`
//! - `set_position(x: f32, y: f32, z: f32)`
//! - `rotate(x: f32, y: f32, z: f32)` euler degrees, relative
//! - `set_scale(x: f32, y: f32, z: f32)`
//! - `set_color(r: f32, g: f32, b: f32)` components in 0..=1
//!
//! ## Utility
//! - `log(level: i32, msg_ptr: i32, msg_len: i32)`

use cubic_logic::behavior::BehaviorHandle;
use cubic_logic::entity::EntityId;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use wasmtime::{Caller, Linker, StoreLimits, StoreLimitsBuilder};

/// Import namespace for all host functions.
pub const HOST_NAMESPACE: &str = "cubic";

// ---------------------------------------------------------------------------
// FrameInput
// ---------------------------------------------------------------------------

/// Read-only values a behavior can query during one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameInput {
    pub frame: u64,
    /// Seconds since the scene started.
    pub elapsed: f64,
    /// Seconds since the previous frame.
    pub delta_time: f32,
    pub microphone_volume: f32,
    pub music_volume: f32,
}

// ---------------------------------------------------------------------------
// TransformCommand
// ---------------------------------------------------------------------------

/// What a behavior asked to change on its entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformKind {
    Translate { x: f32, y: f32, z: f32 },
    SetPosition { x: f32, y: f32, z: f32 },
    /// Relative rotation in euler degrees.
    Rotate { x: f32, y: f32, z: f32 },
    SetScale { x: f32, y: f32, z: f32 },
    SetColor { r: f32, g: f32, b: f32 },
}

/// A deferred change to one entity, tagged with the behavior that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformCommand {
    pub entity: EntityId,
    pub behavior: BehaviorHandle,
    pub kind: TransformKind,
}

// ---------------------------------------------------------------------------
// HostState
// ---------------------------------------------------------------------------

/// State held inside a behavior instance's store.
pub struct HostState {
    /// Entity this instance is bound to.
    pub entity: EntityId,
    /// Behavior this instance was created from.
    pub behavior: BehaviorHandle,
    /// Values for the current frame, set by [`begin_frame`](Self::begin_frame).
    pub input: FrameInput,
    /// Queued writes, drained after the instance ran.
    pub commands: Vec<TransformCommand>,
    /// Host calls made since the last `begin_frame`.
    pub host_call_count: u32,
    rng: Pcg32,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    /// State for an instance of `behavior` on `entity`. The random stream is
    /// seeded from `seed`; `memory_limit_bytes` caps linear memory growth.
    pub fn new(
        entity: EntityId,
        behavior: BehaviorHandle,
        seed: u64,
        memory_limit_bytes: usize,
    ) -> Self {
        Self {
            entity,
            behavior,
            input: FrameInput::default(),
            commands: Vec::new(),
            host_call_count: 0,
            rng: Pcg32::seed_from_u64(seed),
            limits: StoreLimitsBuilder::new()
                .memory_size(memory_limit_bytes)
                .build(),
        }
    }

    /// Load the frame's read values and reset the host call counter.
    ///
    /// Audio levels are clamped into `[0, 1]`. Queued commands are kept.
    pub fn begin_frame(&mut self, input: &FrameInput) {
        self.input = FrameInput {
            microphone_volume: clamp_unit(input.microphone_volume),
            music_volume: clamp_unit(input.music_volume),
            ..*input
        };
        self.host_call_count = 0;
    }

    /// Take every queued command.
    pub fn drain_commands(&mut self) -> Vec<TransformCommand> {
        std::mem::take(&mut self.commands)
    }

    fn push(&mut self, kind: TransformKind) {
        self.commands.push(TransformCommand {
            entity: self.entity,
            behavior: self.behavior,
            kind,
        });
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("entity", &self.entity)
            .field("behavior", &self.behavior)
            .field("input", &self.input)
            .field("host_call_count", &self.host_call_count)
            .field("pending_commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Host function registration
// ---------------------------------------------------------------------------

/// Register all host functions under the `"cubic"` namespace.
///
/// # Errors
///
/// Returns an error if Wasmtime rejects a registration.
pub fn register_host_api(linker: &mut Linker<HostState>) -> Result<(), anyhow::Error> {
    // -- READ ---------------------------------------------------------------

    linker.func_wrap(HOST_NAMESPACE, "microphone_volume", host_microphone_volume)?;
    linker.func_wrap(HOST_NAMESPACE, "music_volume", host_music_volume)?;
    linker.func_wrap(HOST_NAMESPACE, "delta_time", host_delta_time)?;
    linker.func_wrap(HOST_NAMESPACE, "elapsed_time", host_elapsed_time)?;
    linker.func_wrap(HOST_NAMESPACE, "frame_number", host_frame_number)?;
    linker.func_wrap(HOST_NAMESPACE, "entity_id", host_entity_id)?;
    linker.func_wrap(HOST_NAMESPACE, "random", host_random)?;

    // -- WRITE --------------------------------------------------------------

    linker.func_wrap(HOST_NAMESPACE, "translate", host_translate)?;
    linker.func_wrap(HOST_NAMESPACE, "set_position", host_set_position)?;
    linker.func_wrap(HOST_NAMESPACE, "rotate", host_rotate)?;
    linker.func_wrap(HOST_NAMESPACE, "set_scale", host_set_scale)?;
    linker.func_wrap(HOST_NAMESPACE, "set_color", host_set_color)?;

    // -- UTILITY ------------------------------------------------------------

    linker.func_wrap(HOST_NAMESPACE, "log", host_log)?;

    Ok(())
}

/// Read a UTF-8 string from the instance's exported `memory`.
fn read_wasm_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> Result<String, String> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| {
            "behavior must export 'memory' to pass strings -- \
             add `(memory (export \"memory\") 1)` to the module"
                .to_owned()
        })?;

    let data = memory.data(&caller);
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(format!("negative string bounds: ptr={ptr}, len={len}"));
    };
    let end = start.saturating_add(len);
    if end > data.len() {
        return Err(format!(
            "string read out of bounds: ptr={ptr}, len={len}, memory_size={}",
            data.len()
        ));
    }

    String::from_utf8(data[start..end].to_vec())
        .map_err(|e| format!("string at ptr={ptr} len={len} is not valid UTF-8: {e}"))
}

/// Non-finite arguments are dropped rather than written into the scene.
fn finite3(name: &str, a: f32, b: f32, c: f32) -> bool {
    let ok = a.is_finite() && b.is_finite() && c.is_finite();
    if !ok {
        tracing::warn!(call = name, a, b, c, "ignoring non-finite arguments from behavior");
    }
    ok
}

// ---------------------------------------------------------------------------
// READ host functions
// ---------------------------------------------------------------------------

fn host_microphone_volume(mut caller: Caller<'_, HostState>) -> f32 {
    caller.data_mut().host_call_count += 1;
    caller.data().input.microphone_volume
}

fn host_music_volume(mut caller: Caller<'_, HostState>) -> f32 {
    caller.data_mut().host_call_count += 1;
    caller.data().input.music_volume
}

fn host_delta_time(mut caller: Caller<'_, HostState>) -> f32 {
    caller.data_mut().host_call_count += 1;
    caller.data().input.delta_time
}

fn host_elapsed_time(mut caller: Caller<'_, HostState>) -> f64 {
    caller.data_mut().host_call_count += 1;
    caller.data().input.elapsed
}

fn host_frame_number(mut caller: Caller<'_, HostState>) -> i64 {
    caller.data_mut().host_call_count += 1;
    caller.data().input.frame as i64
}

fn host_entity_id(mut caller: Caller<'_, HostState>) -> i64 {
    caller.data_mut().host_call_count += 1;
    caller.data().entity.to_raw() as i64
}

/// `random() -> f32`
///
/// Uniform in `[0, 1)` from the instance's own PCG stream, so two runs of
/// the same scene produce the same values.
fn host_random(mut caller: Caller<'_, HostState>) -> f32 {
    let state = caller.data_mut();
    state.host_call_count += 1;
    state.rng.gen::<f32>()
}

// ---------------------------------------------------------------------------
// WRITE host functions
// ---------------------------------------------------------------------------

fn host_translate(mut caller: Caller<'_, HostState>, x: f32, y: f32, z: f32) {
    caller.data_mut().host_call_count += 1;
    if finite3("translate", x, y, z) {
        caller.data_mut().push(TransformKind::Translate { x, y, z });
    }
}

fn host_set_position(mut caller: Caller<'_, HostState>, x: f32, y: f32, z: f32) {
    caller.data_mut().host_call_count += 1;
    if finite3("set_position", x, y, z) {
        caller.data_mut().push(TransformKind::SetPosition { x, y, z });
    }
}

fn host_rotate(mut caller: Caller<'_, HostState>, x: f32, y: f32, z: f32) {
    caller.data_mut().host_call_count += 1;
    if finite3("rotate", x, y, z) {
        caller.data_mut().push(TransformKind::Rotate { x, y, z });
    }
}

fn host_set_scale(mut caller: Caller<'_, HostState>, x: f32, y: f32, z: f32) {
    caller.data_mut().host_call_count += 1;
    if finite3("set_scale", x, y, z) {
        caller.data_mut().push(TransformKind::SetScale { x, y, z });
    }
}

/// `set_color(r, g, b)`
///
/// Components are clamped into `[0, 1]`.
fn host_set_color(mut caller: Caller<'_, HostState>, r: f32, g: f32, b: f32) {
    caller.data_mut().host_call_count += 1;
    if finite3("set_color", r, g, b) {
        caller.data_mut().push(TransformKind::SetColor {
            r: r.clamp(0.0, 1.0),
            g: g.clamp(0.0, 1.0),
            b: b.clamp(0.0, 1.0),
        });
    }
}

// ---------------------------------------------------------------------------
// UTILITY host functions
// ---------------------------------------------------------------------------

/// `log(level: i32, msg_ptr: i32, msg_len: i32)`
///
/// Level mapping: 0 trace, 1 debug, 2 info, 3 warn, 4 error.
fn host_log(mut caller: Caller<'_, HostState>, level: i32, msg_ptr: i32, msg_len: i32) {
    caller.data_mut().host_call_count += 1;

    let msg = match read_wasm_string(&mut caller, msg_ptr, msg_len) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "log: failed to read message from behavior memory");
            return;
        }
    };
    let entity = caller.data().entity;
    let behavior = caller.data().behavior;

    match level {
        0 => tracing::trace!(source = "behavior", %entity, %behavior, "{msg}"),
        1 => tracing::debug!(source = "behavior", %entity, %behavior, "{msg}"),
        2 => tracing::info!(source = "behavior", %entity, %behavior, "{msg}"),
        3 => tracing::warn!(source = "behavior", %entity, %behavior, "{msg}"),
        4 => tracing::error!(source = "behavior", %entity, %behavior, "{msg}"),
        _ => tracing::info!(source = "behavior", %entity, %behavior, level, "{msg}"),
    }
}
