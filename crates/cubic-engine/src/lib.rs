//! Cubic Engine -- prompt-driven behaviors for groups of cubes.
//!
//! This crate builds on [`cubic_logic`] (groups and the sequencer) and
//! [`cubic_script_host`] (the behavior sandbox) to run a CubicMusic session:
//! cubes are placed in the current group, a prompt (typed or spoken) is turned
//! into a behavior by an AI completion service, the behavior is applied to
//! that group, and every frame the behaviors animate the cubes, optionally
//! following the microphone and music volume.
//!
//! # Quick Start
//!
//! ```no_run
//! use cubic_engine::prelude::*;
//!
//! struct Canned;
//!
//! impl PromptCompletionService for Canned {
//!     fn complete(&mut self, _: &str, _: &GenerationParameters) -> Result<String, ServiceError> {
//!         Ok(r#"(module
//!   (import "cubic" "delta_time" (func $dt (result f32)))
//!   (import "cubic" "rotate" (func $rotate (param f32 f32 f32)))
//!   (func (export "update")
//!     (call $rotate (f32.const 0) (f32.mul (f32.const 90) (call $dt)) (f32.const 0))))"#
//!             .to_owned())
//!     }
//!
//!     fn transcribe(&mut self, _: &AudioClip, _: &str) -> Result<String, ServiceError> {
//!         Ok("spin".to_owned())
//!     }
//! }
//!
//! let mut cubes = CubesManager::new(Canned, EngineConfig::default()).unwrap();
//! let cube = cubes.add_cube_to_current_group(Transform::default()).unwrap();
//! cubes.generate_logic_from_text("spin", &CancellationToken::new()).unwrap();
//!
//! for _ in 0..60 {
//!     cubes.advance_frame(AudioLevels::default());
//! }
//! let y = cubes.scene().get(cube).unwrap().transform.rotation.y;
//! assert!((y - 90.0).abs() < 0.01);
//! ```

#![deny(unsafe_code)]

pub mod ai;
pub mod audio;
pub mod config;
pub mod cubes;
pub mod generation;
pub mod logging;
pub mod mood;
pub mod scene;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the group logic crate for convenience.
pub use cubic_logic;

/// Re-export the script host crate for convenience.
pub use cubic_script_host;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A configuration value is out of range.
    #[error("invalid engine config: {0}")]
    Config(String),

    /// A config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A config document is not valid JSON for [`config::EngineConfig`].
    #[error("malformed engine config: {0}")]
    Json(#[from] serde_json::Error),

    /// A group operation failed.
    #[error(transparent)]
    Logic(#[from] cubic_logic::LogicError),

    /// The behavior sandbox failed.
    #[error(transparent)]
    Script(#[from] cubic_script_host::ScriptError),

    /// A generation did not produce an applied behavior.
    #[error(transparent)]
    Generation(#[from] generation::GenerationError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use cubic_logic::prelude::*;

    pub use cubic_script_host::{
        FrameInput, FrameOutput, ProxyFailure, ScriptConfig, ScriptError, TransformCommand,
        TransformKind, WasmBehaviorLoader,
    };

    pub use crate::ai::{
        AudioClip, CancellationToken, CompletionModel, GenerationParameters,
        PromptCompletionService, PromptTemplate, ServiceError, StatusEvent, StatusFeed,
    };
    pub use crate::audio::{
        AnalyzerConfig, AudioAnalyzer, AudioDataSource, AudioLevelProvider, AudioLevels,
        FixedLevel, SampleBuffer,
    };
    pub use crate::config::{EngineConfig, FrameConfig};
    pub use crate::cubes::{CubesManager, FrameReport};
    pub use crate::generation::{extract_source, GenerationError, LogicGenerator, RetryPolicy};
    pub use crate::logging::init_logging;
    pub use crate::mood::{
        mood_template, parse_mood_instructions, MoodFailure, MoodInstruction, MoodReport,
    };
    pub use crate::scene::{Color, CubeState, Scene, Transform, Vec3};
    pub use crate::EngineError;
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
