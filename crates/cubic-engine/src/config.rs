//! Engine configuration.
//!
//! [`EngineConfig`] gathers every tunable of a session. It is plain data,
//! loaded from JSON; any field left out takes its default.
//!
//! ```
//! use cubic_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "retry": { "max_attempts": 5 } }"#).unwrap();
//! assert_eq!(config.retry.max_attempts, 5);
//! assert_eq!(config.transcription_language, "en");
//! ```

use std::path::Path;

use cubic_logic::group::JoinPolicy;
use cubic_script_host::ScriptConfig;
use serde::{Deserialize, Serialize};

use crate::ai::GenerationParameters;
use crate::audio::AnalyzerConfig;
use crate::generation::RetryPolicy;
use crate::EngineError;

/// Frame clock settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Seconds per frame. Must be positive and finite. Default: 1/60.
    pub fixed_dt: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
        }
    }
}

/// Every tunable of a cubes session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parameters for behavior completions.
    pub generation: GenerationParameters,
    pub retry: RetryPolicy,
    /// Sandbox limits for behaviors.
    pub script: ScriptConfig,
    /// Tuning for the microphone and music analyzers.
    pub analyzer: AnalyzerConfig,
    pub frame: FrameConfig,
    /// Language of spoken prompts (ISO 639-1). Default: `"en"`.
    pub transcription_language: String,
    /// Whether cubes joining a group get the behaviors it already has.
    pub join_policy: JoinPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation: GenerationParameters::default(),
            retry: RetryPolicy::default(),
            script: ScriptConfig::default(),
            analyzer: AnalyzerConfig::default(),
            frame: FrameConfig::default(),
            transcription_language: "en".to_owned(),
            join_policy: JoinPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// [`EngineError::Json`] for malformed JSON, [`EngineError::Config`] for
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// [`EngineError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loading engine config");
        Self::from_json_str(&json)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.frame.fixed_dt.is_finite() && self.frame.fixed_dt > 0.0) {
            return Err(EngineError::Config(format!(
                "frame.fixed_dt must be positive and finite, got {}",
                self.frame.fixed_dt
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".to_owned()));
        }
        if self.script.fuel_per_call == 0 {
            return Err(EngineError::Config("script.fuel_per_call must be positive".to_owned()));
        }
        if self.analyzer.samples == 0 {
            return Err(EngineError::Config("analyzer.samples must be positive".to_owned()));
        }
        if !(0.0..=1.0).contains(&self.analyzer.alpha) {
            return Err(EngineError::Config(format!(
                "analyzer.alpha must be in [0, 1], got {}",
                self.analyzer.alpha
            )));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(EngineError::Config(format!(
                "generation.temperature must be in [0, 2], got {}",
                self.generation.temperature
            )));
        }
        Ok(())
    }
}
