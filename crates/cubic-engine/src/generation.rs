//! The generation pipeline: prompt in, loaded behavior out.
//!
//! [`LogicGenerator`] wraps the user's prompt in a template, asks the
//! completion service, pulls the source out of the answer and compiles it
//! through the [`BehaviorLoader`]. It performs one attempt; retrying is the
//! caller's decision, guided by [`RetryPolicy`].

use cubic_logic::behavior::{BehaviorHandle, BehaviorLoader, LoaderError};
use cubic_logic::LogicError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ai::{
    AudioClip, CancellationToken, GenerationParameters, PromptCompletionService, PromptTemplate,
    ServiceError, StatusEvent, StatusFeed,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a generation did not produce an applied behavior.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    /// The completion or transcription request failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The answer held no source code.
    #[error("AI answer contained no source code")]
    EmptyResponse,

    /// The generated source did not compile.
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// The behavior compiled but could not be applied to the current group.
    #[error(transparent)]
    Attach(#[from] LogicError),

    /// The caller cancelled the generation.
    #[error("generation was cancelled")]
    Cancelled,

    /// Every attempt failed.
    #[error("generation failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    /// Whether repeating the request could succeed. Generated code differs
    /// between answers, so compile and attach failures count as retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Service(ServiceError::Transient(_))
            | GenerationError::EmptyResponse
            | GenerationError::Loader(_)
            | GenerationError::Attach(_) => true,
            GenerationError::Service(ServiceError::Cancelled)
            | GenerationError::Cancelled
            | GenerationError::Exhausted { .. } => false,
        }
    }

    fn cancelled(&self) -> bool {
        matches!(
            self,
            GenerationError::Cancelled | GenerationError::Service(ServiceError::Cancelled)
        )
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times a text generation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Default: 3.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// A policy that tries once.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1 }
    }
}

// ---------------------------------------------------------------------------
// Source extraction
// ---------------------------------------------------------------------------

/// Pull source code out of an AI answer.
///
/// The body of the first fenced block (```` ``` ````) is returned, without
/// its language tag. Without a fence, the whole answer is returned trimmed.
/// An unterminated fence runs to the end of the answer.
pub fn extract_source(response: &str) -> &str {
    const FENCE: &str = "```";
    let Some(start) = response.find(FENCE) else {
        return response.trim();
    };
    let after_fence = &response[start + FENCE.len()..];
    // Skip the language tag line, if any.
    let body = match after_fence.find('\n') {
        Some(newline) => &after_fence[newline + 1..],
        None => after_fence,
    };
    match body.find(FENCE) {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

// ---------------------------------------------------------------------------
// LogicGenerator
// ---------------------------------------------------------------------------

/// One-attempt generator of behaviors from text or speech.
#[derive(Debug, Clone)]
pub struct LogicGenerator {
    params: GenerationParameters,
    template: PromptTemplate,
    language: String,
}

impl LogicGenerator {
    pub fn new(params: GenerationParameters, template: PromptTemplate, language: impl Into<String>) -> Self {
        Self {
            params,
            template,
            language: language.into(),
        }
    }

    pub fn params(&self) -> &GenerationParameters {
        &self.params
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Ask for code implementing `prompt` and load it.
    ///
    /// # Errors
    ///
    /// - [`GenerationError::Cancelled`] if `token` is cancelled before the
    ///   request or once the answer is back.
    /// - [`GenerationError::Service`], [`GenerationError::EmptyResponse`] or
    ///   [`GenerationError::Loader`] for a failed attempt.
    pub fn generate_from_text(
        &self,
        service: &mut dyn PromptCompletionService,
        loader: &mut dyn BehaviorLoader,
        status: &mut StatusFeed,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<BehaviorHandle, GenerationError> {
        let source = self.complete(service, status, &self.template, &self.params, prompt, token)?;
        let code = extract_source(&source);
        if code.is_empty() {
            warn!("AI answer had no code");
            return Err(GenerationError::EmptyResponse);
        }
        let handle = loader.compile_and_load(code)?;
        info!(behavior = %handle, "behavior generated");
        Ok(handle)
    }

    /// Transcribe `clip`, then behave as [`generate_from_text`](Self::generate_from_text).
    ///
    /// # Errors
    ///
    /// As `generate_from_text`, plus transcription failures.
    pub fn generate_from_audio(
        &self,
        service: &mut dyn PromptCompletionService,
        loader: &mut dyn BehaviorLoader,
        status: &mut StatusFeed,
        clip: &AudioClip,
        token: &CancellationToken,
    ) -> Result<BehaviorHandle, GenerationError> {
        let prompt = self.transcribe(service, status, clip, token)?;
        self.generate_from_text(service, loader, status, &prompt, token)
    }

    /// Send `template.full_prompt(prompt)` and return the raw answer.
    pub(crate) fn complete(
        &self,
        service: &mut dyn PromptCompletionService,
        status: &mut StatusFeed,
        template: &PromptTemplate,
        params: &GenerationParameters,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<String, GenerationError> {
        if token.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let full = template.full_prompt(prompt);
        status.publish(StatusEvent::PromptSent {
            prompt: full.clone(),
        });
        debug!(model = ?params.model, temperature = params.temperature, "completion requested");
        let response = service.complete(&full, params)?;
        if token.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        status.publish(StatusEvent::PromptResponseReceived {
            response: response.clone(),
        });
        Ok(response)
    }

    /// Transcribe `clip` in the configured language.
    pub(crate) fn transcribe(
        &self,
        service: &mut dyn PromptCompletionService,
        status: &mut StatusFeed,
        clip: &AudioClip,
        token: &CancellationToken,
    ) -> Result<String, GenerationError> {
        if token.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        status.publish(StatusEvent::TranscriptionSent);
        let transcription = service.transcribe(clip, &self.language)?;
        if token.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        info!(%transcription, "audio prompt transcribed");
        status.publish(StatusEvent::TranscriptionReceived {
            transcription: transcription.clone(),
        });
        Ok(transcription)
    }
}

impl Default for LogicGenerator {
    fn default() -> Self {
        Self::new(
            GenerationParameters::default(),
            PromptTemplate::behavior_script(),
            "en",
        )
    }
}

/// Run `attempt` up to `policy.max_attempts` times.
///
/// Stops at the first success, the first non-retryable error, or on
/// cancellation. Each failure is published as
/// [`StatusEvent::GenerationFailed`].
///
/// # Errors
///
/// The non-retryable error, [`GenerationError::Cancelled`], or
/// [`GenerationError::Exhausted`] carrying the last failure.
pub(crate) fn with_retry<T>(
    policy: RetryPolicy,
    status: &mut StatusFeed,
    token: &CancellationToken,
    mut attempt: impl FnMut(&mut StatusFeed) -> Result<T, GenerationError>,
) -> Result<T, GenerationError> {
    let attempts = policy.max_attempts.max(1);
    let mut last = None;
    for n in 1..=attempts {
        if token.is_cancelled() {
            status.publish(StatusEvent::GenerationCancelled);
            return Err(GenerationError::Cancelled);
        }
        match attempt(status) {
            Ok(value) => return Ok(value),
            Err(e) if e.cancelled() => {
                status.publish(StatusEvent::GenerationCancelled);
                return Err(GenerationError::Cancelled);
            }
            Err(e) => {
                let will_retry = e.is_retryable() && n < attempts;
                warn!(attempt = n, error = %e, will_retry, "generation attempt failed");
                status.publish(StatusEvent::GenerationFailed {
                    attempt: n,
                    reason: e.to_string(),
                    will_retry,
                });
                if !e.is_retryable() {
                    return Err(e);
                }
                last = Some(e);
            }
        }
    }
    Err(GenerationError::Exhausted {
        attempts,
        last: Box::new(last.unwrap_or(GenerationError::EmptyResponse)),
    })
}
