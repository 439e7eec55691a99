//! Cubic Script Host -- Wasmtime sandbox for generated cube behaviors.
//!
//! Behaviors produced at runtime are WebAssembly modules. This crate compiles
//! them, instantiates one copy per cube they are applied to, and runs every
//! copy once per frame inside a fuel-metered store with no filesystem,
//! network, threading, or wall-clock access.
//!
//! # Architecture
//!
//! - **`ScriptConfig`**: fuel budget per call and memory cap per instance.
//! - **`BehaviorModule`**: a compiled behavior with a required `update()`
//!   export and an optional `start()`.
//! - **`BehaviorInstance`**: one behavior running on one entity.
//! - **`WasmBehaviorLoader`**: the
//!   [`BehaviorLoader`](cubic_logic::behavior::BehaviorLoader) the group
//!   logic drives; also runs all live instances each frame.
//! - **`ScriptError`**: compilation, missing exports, fuel exhaustion, traps.
//!
//! # Host API
//!
//! Behaviors import functions from the `"cubic"` namespace to read the audio
//! levels and the frame clock, and to queue transform changes for their own
//! cube. See [`host_api`].
//!
//! # Example
//!
//! ```no_run
//! use cubic_logic::prelude::*;
//! use cubic_script_host::{FrameInput, ScriptConfig, WasmBehaviorLoader};
//!
//! let mut loader = WasmBehaviorLoader::new(ScriptConfig::default()).unwrap();
//! let mut entities = EntityAllocator::new();
//! let mut sequencer = GroupSequencer::new();
//!
//! let cube = entities.allocate();
//! sequencer.add_entity_to_current_group(cube, &mut loader).unwrap();
//!
//! let wat = r#"(module
//!     (import "cubic" "rotate" (func $rotate (param f32 f32 f32)))
//!     (func (export "update") (call $rotate (f32.const 0) (f32.const 1) (f32.const 0))))"#;
//! let spin = loader.compile_and_load(wat).unwrap();
//! sequencer.on_behavior_generated(spin, &mut loader).unwrap();
//!
//! let output = loader.run_frame(&FrameInput::default());
//! assert_eq!(output.commands.len(), 1);
//! ```

#![deny(unsafe_code)]

pub mod host_api;
mod loader;
mod module;

use cubic_logic::behavior::LoaderError;

pub use host_api::{FrameInput, HostState, TransformCommand, TransformKind};
pub use loader::{FrameOutput, ProxyFailure, WasmBehaviorLoader};
pub use module::{BehaviorInstance, BehaviorModule, ScriptConfig};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while compiling or running behaviors.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum ScriptError {
    /// The source could not be compiled (invalid bytecode or WAT syntax).
    #[error("behavior compilation failed: {0}")]
    Compile(String),

    /// The module does not export a required function.
    #[error("missing required export '{name}' -- a behavior must export an `update()` function")]
    MissingExport {
        /// The name of the missing export.
        name: String,
    },

    /// A call exhausted its fuel budget.
    #[error("behavior ran out of fuel (budget: {budget} units) -- possible infinite loop")]
    OutOfFuel {
        /// The fuel budget that was exceeded.
        budget: u64,
    },

    /// A WebAssembly trap occurred (unreachable, division by zero,
    /// out-of-bounds memory access).
    #[error("behavior trap: {0}")]
    Trap(String),

    /// The module asks for more memory than an instance may have.
    #[error("behavior exceeds memory limit of {limit_bytes} bytes")]
    MemoryLimitExceeded {
        /// The configured memory limit in bytes.
        limit_bytes: usize,
    },

    /// A general runtime error from the Wasmtime engine.
    #[error("script runtime error: {0}")]
    Runtime(String),
}

/// Errors from loading a source all mean the behavior cannot be used.
impl From<ScriptError> for LoaderError {
    fn from(error: ScriptError) -> Self {
        LoaderError::Compile(error.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests -- module loading and execution
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cubic_logic::behavior::{BehaviorHandle, BehaviorLoader};
    use cubic_logic::entity::EntityId;

    /// Helper: load a WAT fixture file from the tests/fixtures directory.
    fn fixture_bytes(name: &str) -> Vec<u8> {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name);
        std::fs::read(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {}", path.display(), e))
    }

    fn loader() -> WasmBehaviorLoader {
        WasmBehaviorLoader::new(ScriptConfig::default()).unwrap()
    }

    fn frame(frame: u64) -> FrameInput {
        FrameInput {
            frame,
            elapsed: frame as f64 * 0.5,
            delta_time: 0.5,
            microphone_volume: 0.25,
            music_volume: 0.75,
        }
    }

    // -- compile ------------------------------------------------------------

    #[test]
    fn load_noop_module() {
        let mut loader = loader();
        let handle = loader.load_module(&fixture_bytes("noop.wat"));
        assert!(handle.is_ok(), "noop module should load: {:?}", handle.err());
        assert_eq!(loader.module_count(), 1);
    }

    #[test]
    fn handles_are_unique_per_load() {
        let mut loader = loader();
        let a = loader.load_module(&fixture_bytes("noop.wat")).unwrap();
        let b = loader.load_module(&fixture_bytes("noop.wat")).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            loader.module(a).unwrap().digest(),
            loader.module(b).unwrap().digest(),
            "same source hashes the same"
        );
    }

    #[test]
    fn missing_update_export_returns_error() {
        let mut loader = loader();
        let err = loader.load_module(&fixture_bytes("no_update.wat")).unwrap_err();
        assert!(
            matches!(err, ScriptError::MissingExport { ref name } if name == "update"),
            "expected MissingExport for 'update', got: {err:?}"
        );
    }

    #[test]
    fn invalid_source_is_a_compile_error() {
        let mut loader = loader();
        let err = loader.load_module(&fixture_bytes("invalid.wat")).unwrap_err();
        assert!(matches!(err, ScriptError::Compile(_)), "got: {err:?}");
        assert_eq!(loader.module_count(), 0);
    }

    #[test]
    fn oversized_memory_is_rejected() {
        let mut loader = loader();
        let err = loader.load_module(&fixture_bytes("big_memory.wat")).unwrap_err();
        assert_eq!(
            err,
            ScriptError::MemoryLimitExceeded {
                limit_bytes: 16 * 1024 * 1024
            }
        );
    }

    #[test]
    fn compile_failure_maps_to_loader_compile_error() {
        let mut loader = loader();
        let err = loader.compile_and_load("(module").unwrap_err();
        assert!(matches!(err, LoaderError::Compile(_)), "got: {err:?}");
    }

    // -- instantiate --------------------------------------------------------

    #[test]
    fn wasi_import_fails_without_wasi() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("wasi_import.wat")).unwrap();
        let err = loader.instantiate(h, EntityId::new(0, 0)).unwrap_err();
        assert!(matches!(err, LoaderError::Instantiate { .. }), "got: {err:?}");
        assert_eq!(loader.proxy_count(), 0);
    }

    #[test]
    fn unknown_behavior_is_reported() {
        let mut loader = loader();
        let ghost = BehaviorHandle::from_raw(99);
        assert_eq!(
            loader.instantiate(ghost, EntityId::new(0, 0)),
            Err(LoaderError::UnknownBehavior(ghost))
        );
    }

    #[test]
    fn failing_start_prevents_instantiation() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("failing_start.wat")).unwrap();
        let err = loader.instantiate(h, EntityId::new(0, 0)).unwrap_err();
        match err {
            LoaderError::Instantiate { reason, .. } => {
                assert!(reason.contains("trap"), "reason should name the trap: {reason}")
            }
            other => panic!("expected Instantiate, got: {other:?}"),
        }
    }

    #[test]
    fn release_and_unload_drop_instances() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("noop.wat")).unwrap();
        let p1 = loader.instantiate(h, EntityId::new(0, 0)).unwrap();
        let _p2 = loader.instantiate(h, EntityId::new(1, 0)).unwrap();
        assert_eq!(loader.proxy_count(), 2);

        loader.release(p1);
        loader.release(p1);
        assert_eq!(loader.proxy_count(), 1);

        assert!(loader.unload(h));
        assert!(!loader.unload(h));
        assert_eq!(loader.proxy_count(), 0);
        assert!(!loader.is_loaded(h));
    }

    // -- run_frame ----------------------------------------------------------

    #[test]
    fn spin_rotates_by_delta_time() {
        let mut loader = loader();
        let cube = EntityId::new(4, 0);
        let h = loader.load_module(&fixture_bytes("spin.wat")).unwrap();
        loader.instantiate(h, cube).unwrap();

        let output = loader.run_frame(&frame(1));
        assert_eq!(output.proxies_run, 1);
        assert!(output.fuel_consumed > 0);
        assert_eq!(
            output.commands,
            vec![TransformCommand {
                entity: cube,
                behavior: h,
                kind: TransformKind::Rotate { x: 0.0, y: 45.0, z: 0.0 },
            }]
        );
    }

    #[test]
    fn audio_levels_reach_behaviors() {
        let mut loader = loader();
        let scale = loader.load_module(&fixture_bytes("music_scale.wat")).unwrap();
        let color = loader.load_module(&fixture_bytes("mic_color.wat")).unwrap();
        loader.instantiate(scale, EntityId::new(0, 0)).unwrap();
        loader.instantiate(color, EntityId::new(1, 0)).unwrap();

        let kinds: Vec<TransformKind> = loader
            .run_frame(&frame(0))
            .commands
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TransformKind::SetScale { x: 1.75, y: 1.75, z: 1.75 },
                TransformKind::SetColor { r: 0.25, g: 0.0, b: 0.75 },
            ]
        );
    }

    #[test]
    fn start_commands_arrive_with_first_frame() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("start_color.wat")).unwrap();
        loader.instantiate(h, EntityId::new(0, 0)).unwrap();

        let first: Vec<_> = loader.run_frame(&frame(0)).commands.into_iter().map(|c| c.kind).collect();
        assert_eq!(
            first,
            vec![
                TransformKind::SetColor { r: 0.0, g: 1.0, b: 0.0 },
                TransformKind::Translate { x: 0.0, y: 0.5, z: 0.0 },
            ]
        );
        let second = loader.run_frame(&frame(1)).commands;
        assert_eq!(second.len(), 1, "start() runs once");
    }

    #[test]
    fn fuel_exhaustion_is_isolated_to_one_proxy() {
        let mut loader = WasmBehaviorLoader::new(ScriptConfig {
            fuel_per_call: 10_000,
            ..ScriptConfig::default()
        })
        .unwrap();
        let hog = loader.load_module(&fixture_bytes("fuel_hog.wat")).unwrap();
        let spin = loader.load_module(&fixture_bytes("spin.wat")).unwrap();
        let hog_proxy = loader.instantiate(hog, EntityId::new(0, 0)).unwrap();
        loader.instantiate(spin, EntityId::new(1, 0)).unwrap();

        let output = loader.run_frame(&frame(1));
        assert_eq!(output.proxies_run, 1);
        assert_eq!(output.commands.len(), 1);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].proxy, hog_proxy);
        assert_eq!(output.failures[0].error, ScriptError::OutOfFuel { budget: 10_000 });

        // The hog keeps failing, the loader keeps running.
        let again = loader.run_frame(&frame(2));
        assert_eq!(again.failures.len(), 1);
        assert_eq!(again.proxies_run, 1);
    }

    #[test]
    fn trap_is_reported_as_trap() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("trap.wat")).unwrap();
        loader.instantiate(h, EntityId::new(0, 0)).unwrap();
        let output = loader.run_frame(&frame(0));
        assert!(
            matches!(output.failures[0].error, ScriptError::Trap(_)),
            "got: {:?}",
            output.failures[0].error
        );
    }

    #[test]
    fn fuel_is_identical_across_frames() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("noop.wat")).unwrap();
        loader.instantiate(h, EntityId::new(0, 0)).unwrap();
        let a = loader.run_frame(&frame(0)).fuel_consumed;
        let b = loader.run_frame(&frame(1)).fuel_consumed;
        assert!(a > 0);
        assert_eq!(a, b, "identical noop updates consume identical fuel");
    }

    #[test]
    fn random_stream_is_deterministic_per_entity() {
        let run = || {
            let mut loader = loader();
            let h = loader.load_module(&fixture_bytes("random_walk.wat")).unwrap();
            loader.instantiate(h, EntityId::new(0, 0)).unwrap();
            loader.instantiate(h, EntityId::new(1, 0)).unwrap();
            (0..3)
                .flat_map(|f| loader.run_frame(&frame(f)).commands)
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert_ne!(first[0].kind, first[1].kind, "entities draw different streams");
        for cmd in &first {
            match cmd.kind {
                TransformKind::Translate { x, .. } => assert!((0.0..1.0).contains(&x)),
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    #[test]
    fn log_and_frame_number_are_available() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("logger.wat")).unwrap();
        let proxy = loader.instantiate(h, EntityId::new(0, 0)).unwrap();
        let output = loader.run_frame(&frame(7));
        assert_eq!(
            output.commands[0].kind,
            TransformKind::SetPosition { x: 7.0, y: 0.0, z: 0.0 }
        );
        // log + frame_number + set_position
        assert_eq!(loader.proxy(proxy).unwrap().host_state().host_call_count, 3);
    }

    #[test]
    fn non_finite_arguments_are_dropped() {
        let mut loader = loader();
        let h = loader.load_module(&fixture_bytes("nan_translate.wat")).unwrap();
        loader.instantiate(h, EntityId::new(0, 0)).unwrap();
        let output = loader.run_frame(&frame(0));
        assert!(output.failures.is_empty());
        assert!(output.commands.is_empty());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ScriptConfig = serde_json::from_str(r#"{ "fuel_per_call": 500 }"#).unwrap();
        assert_eq!(config.fuel_per_call, 500);
        assert_eq!(config.memory_limit_bytes, 16 * 1024 * 1024);
    }
}

// ---------------------------------------------------------------------------
// Tests -- driven through the group logic
// ---------------------------------------------------------------------------

#[cfg(test)]
mod sequencer_tests {
    use super::*;
    use cubic_logic::prelude::*;

    fn fixture_source(name: &str) -> String {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {}", path.display(), e))
    }

    #[test]
    fn generated_behavior_runs_only_on_its_era() {
        let mut loader = WasmBehaviorLoader::new(ScriptConfig::default()).unwrap();
        let mut entities = EntityAllocator::new();
        let mut sequencer = GroupSequencer::new();

        let early = entities.allocate();
        sequencer.add_entity_to_current_group(early, &mut loader).unwrap();
        let spin = loader.compile_and_load(&fixture_source("spin.wat")).unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();

        let late = entities.allocate();
        sequencer.add_entity_to_current_group(late, &mut loader).unwrap();

        let output = loader.run_frame(&FrameInput {
            delta_time: 1.0,
            ..FrameInput::default()
        });
        let touched: Vec<EntityId> = output.commands.iter().map(|c| c.entity).collect();
        assert_eq!(touched, vec![early]);
    }

    #[test]
    fn failed_attach_leaves_no_instances_behind() {
        let mut loader = WasmBehaviorLoader::new(ScriptConfig::default()).unwrap();
        let mut entities = EntityAllocator::new();
        let mut sequencer = GroupSequencer::new();

        // Slots 0 and 1: the picky behavior refuses the odd one.
        for _ in 0..2 {
            sequencer
                .add_entity_to_current_group(entities.allocate(), &mut loader)
                .unwrap();
        }
        let picky = loader.compile_and_load(&fixture_source("picky_start.wat")).unwrap();
        let err = sequencer.on_behavior_generated(picky, &mut loader).unwrap_err();
        assert!(matches!(err, LogicError::Attach { .. }), "got: {err:?}");
        assert_eq!(loader.proxy_count(), 0);
        assert_eq!(sequencer.group_count(), 1, "failed round does not rotate");
    }

    #[test]
    fn removing_a_cube_stops_its_behaviors() {
        let mut loader = WasmBehaviorLoader::new(ScriptConfig::default()).unwrap();
        let mut entities = EntityAllocator::new();
        let mut sequencer = GroupSequencer::new();

        let a = entities.allocate();
        let b = entities.allocate();
        sequencer.add_entity_to_current_group(a, &mut loader).unwrap();
        sequencer.add_entity_to_current_group(b, &mut loader).unwrap();
        let spin = loader.compile_and_load(&fixture_source("spin.wat")).unwrap();
        sequencer.on_behavior_generated(spin, &mut loader).unwrap();
        assert_eq!(loader.proxy_count(), 2);

        assert_eq!(sequencer.remove_entity(a, &mut loader).unwrap(), 1);
        assert_eq!(loader.proxy_count(), 1);

        assert_eq!(sequencer.retire_behavior(spin, &mut loader), 1);
        assert_eq!(loader.proxy_count(), 0);
        assert!(!loader.is_loaded(spin));
    }
}
