//! The AI side of generation: the completion service seam, prompt templates,
//! generation parameters, cooperative cancellation, and the status feed.
//!
//! The service itself is a trait. Talking to a cloud provider is left to the
//! embedding application; tests use scripted implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use cubic_logic::behavior::BehaviorHandle;
use cubic_logic::group::GroupId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Generation parameters
// ---------------------------------------------------------------------------

/// Which completion model to ask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionModel {
    /// Slower, better code.
    #[default]
    Accurate,
    /// Faster and cheaper.
    Cheap,
}

/// Parameters sent with every completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    pub model: CompletionModel,
    /// Higher values give more varied answers. Default: 0.33.
    pub temperature: f32,
    /// Upper bound on the answer length. Default: 2048.
    pub max_tokens: u32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            model: CompletionModel::Accurate,
            temperature: 0.33,
            max_tokens: 2048,
        }
    }
}

impl GenerationParameters {
    /// Parameters for open-ended answers such as mood instructions.
    pub fn creative() -> Self {
        Self {
            temperature: 1.0,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// PromptTemplate
// ---------------------------------------------------------------------------

/// Text wrapped around the user's prompt before it is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub pre_prompt: String,
    pub post_prompt: String,
}

impl PromptTemplate {
    pub fn new(pre_prompt: impl Into<String>, post_prompt: impl Into<String>) -> Self {
        Self {
            pre_prompt: pre_prompt.into(),
            post_prompt: post_prompt.into(),
        }
    }

    /// `"{pre} {prompt} {post}"`.
    pub fn full_prompt(&self, prompt: &str) -> String {
        format!("{} {} {}", self.pre_prompt, prompt, self.post_prompt)
    }

    /// Template asking for a cube behavior written against the `"cubic"`
    /// host API.
    pub fn behavior_script() -> Self {
        Self::new(
            "Write a WebAssembly text module (WAT) for a cube in a 3D scene that does the following:",
            BEHAVIOR_REQUIREMENTS,
        )
    }
}

const BEHAVIOR_REQUIREMENTS: &str = "\
The module must work out of the box without any external configuration. Requirements:
- Export a function `update` with no parameters and no results; it runs once per frame.
- Optionally export a function `start` with no parameters and no results; it runs once before the first frame.
- Do not import anything except these functions from the \"cubic\" module:
  delta_time() -> f32 (seconds since the previous frame), elapsed_time() -> f64,
  frame_number() -> i64, entity_id() -> i64, random() -> f32 in [0, 1),
  translate(x f32, y f32, z f32), set_position(x f32, y f32, z f32),
  rotate(x f32, y f32, z f32) in degrees, set_scale(x f32, y f32, z f32),
  set_color(r f32, g f32, b f32) with components in [0, 1],
  log(level i32, ptr i32, len i32) reading a UTF-8 string from an exported memory.
- IF and only if the request is about the microphone, use microphone_volume() -> f32, range 0 to 1.
- IF and only if the request is about the music, use music_volume() -> f32, range 0 to 1.
- Keep all state in globals or in the module's own memory.
Reply with the module only, inside a single ```wat code block.";

// ---------------------------------------------------------------------------
// Audio prompts
// ---------------------------------------------------------------------------

/// A recorded spoken prompt, interleaved samples in `[-1, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Length in seconds, 0 for a malformed clip.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.sample_rate as f32 * self.channels as f32)
    }
}

// ---------------------------------------------------------------------------
// PromptCompletionService
// ---------------------------------------------------------------------------

/// Failures reported by a [`PromptCompletionService`].
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ServiceError {
    /// The request failed but may succeed if repeated (network, rate limit,
    /// malformed answer).
    #[error("AI service request failed: {0}")]
    Transient(String),

    /// The request was abandoned because the caller cancelled it.
    #[error("AI service request was cancelled")]
    Cancelled,
}

/// Turns prompts into text and speech into prompts.
pub trait PromptCompletionService {
    /// Complete `prompt` with the given parameters.
    ///
    /// # Errors
    ///
    /// [`ServiceError`] when the request fails.
    fn complete(
        &mut self,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<String, ServiceError>;

    /// Transcribe a spoken prompt in `language` (an ISO 639-1 code).
    ///
    /// # Errors
    ///
    /// [`ServiceError`] when the request fails.
    fn transcribe(&mut self, clip: &AudioClip, language: &str) -> Result<String, ServiceError>;
}

// ---------------------------------------------------------------------------
// CancellationToken
// ---------------------------------------------------------------------------

/// Shared flag checked before each generation attempt and after each
/// service call. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Status feed
// ---------------------------------------------------------------------------

/// Progress notifications for whoever displays generation status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    PromptSent { prompt: String },
    PromptResponseReceived { response: String },
    TranscriptionSent,
    TranscriptionReceived { transcription: String },
    /// One attempt failed; `will_retry` tells whether another follows.
    GenerationFailed {
        attempt: u32,
        reason: String,
        will_retry: bool,
    },
    BehaviorApplied {
        behavior: BehaviorHandle,
        group: GroupId,
        members: usize,
    },
    GenerationCancelled,
}

/// Fan-out of [`StatusEvent`]s to any number of subscribers.
///
/// Each subscriber gets its own channel; dropping the receiver unsubscribes
/// on the next publish.
#[derive(Debug, Default)]
pub struct StatusFeed {
    subscribers: Vec<Sender<StatusEvent>>,
}

impl StatusFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&mut self, event: StatusEvent) {
        tracing::debug!(?event, "status");
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
