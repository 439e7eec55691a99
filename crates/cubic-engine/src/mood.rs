//! Mood cubes: a whole set of cubes generated from a single mood.
//!
//! The AI is asked, with creative parameters, for a handful of instruction
//! lines of the form
//!
//! ```text
//! @(1.5, 2.0, -3.25) rotate slowly clockwise and fade from blue to grey
//! ```
//!
//! Each line becomes one cube at the given position, followed by one
//! generation round with the line's prompt, so every cube gets its own
//! behavior.

use cubic_logic::entity::EntityId;
use cubic_logic::sequencer::GenerationRound;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ai::{
    AudioClip, CancellationToken, GenerationParameters, PromptCompletionService, PromptTemplate,
};
use crate::cubes::CubesManager;
use crate::generation::GenerationError;
use crate::scene::{Transform, Vec3};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// One cube to create: where, and what it should do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodInstruction {
    pub position: Vec3,
    pub prompt: String,
}

/// Read instruction lines from an AI answer.
///
/// A line needs a parenthesised `x, y, z` triple (decimal point, any
/// whitespace) followed by a non-empty prompt. A leading `@` and a `:` or
/// `-` after the triple are allowed. Other lines (blank lines, commentary
/// the AI added) are skipped.
pub fn parse_mood_instructions(text: &str) -> Vec<MoodInstruction> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MoodInstruction> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let open = line.find('(')?;
    let close = open + line[open..].find(')')?;

    let coords: Vec<&str> = line[open + 1..close].split(',').map(str::trim).collect();
    let [x, y, z] = coords.as_slice() else {
        warn!(%line, "mood line skipped: expected three coordinates");
        return None;
    };
    let position = match (x.parse::<f32>(), y.parse::<f32>(), z.parse::<f32>()) {
        (Ok(x), Ok(y), Ok(z)) if x.is_finite() && y.is_finite() && z.is_finite() => {
            Vec3::new(x, y, z)
        }
        _ => {
            warn!(%line, "mood line skipped: coordinates are not numbers");
            return None;
        }
    };

    let prompt = line[close + 1..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '-')
        .trim_end();
    if prompt.is_empty() {
        return None;
    }
    Some(MoodInstruction {
        position,
        prompt: prompt.to_owned(),
    })
}

/// Template asking for mood instructions. The user's mood goes between the
/// quotes that close the pre-prompt and open the post-prompt.
pub fn mood_template() -> PromptTemplate {
    PromptTemplate::new(MOOD_PRE_PROMPT, MOOD_POST_PROMPT)
}

const MOOD_PRE_PROMPT: &str = "\
Create the initial setup for a mood representation made of seven cubes. Every cube represents the same mood, \
with variations in its behavior.
First, give each cube a position. Pick x and z in [-4.5, 4.6] and y in [0.5, 3.6], varied so the cubes spread out.
Second, give each cube a prompt describing its behavior, combining 1 to 3 of:
    Rotation: e.g. slow clockwise rotation
    Color transition: e.g. from warm to vibrant colors
    Scale: e.g. gradual growth, always between 0.25 and 2
The mood is a spectrum from happiness to sadness. Happiness means bright colors, growing scale and graceful \
rotation. Sadness means muted colors, shrinking scale and melancholic rotation.
Behaviors may depend on the current microphone volume or the music volume (for example, a color that goes from \
green at low music volume to red at high volume). Volume is never set and never transitions by itself. At least \
one cube, but not all of them, should depend on volume.
If colors are needed, choose among: red, blue, black, grey, green, yellow, white, magenta, cyan.
Write one cube per line: the @ symbol, the position as (x, y, z) with a dot as decimal separator, then the \
behavior prompt.
The mood to consider is \"";

const MOOD_POST_PROMPT: &str =
    "\". Generate only prompts coherent with this mood. No examples, no explanations.";

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// An instruction whose behavior could not be generated. Its cube stays in
/// the current group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodFailure {
    pub index: usize,
    pub prompt: String,
    pub reason: String,
}

/// Outcome of a mood generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoodReport {
    pub instructions: Vec<MoodInstruction>,
    /// Cubes created, in instruction order.
    pub cubes: Vec<EntityId>,
    /// Successful generation rounds, in instruction order.
    pub rounds: Vec<GenerationRound>,
    pub failures: Vec<MoodFailure>,
    /// The token was cancelled part-way; later instructions were not run.
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// CubesManager integration
// ---------------------------------------------------------------------------

impl<S: PromptCompletionService> CubesManager<S> {
    /// Ask for mood instructions and build one behaving cube per line.
    ///
    /// Per-instruction failures are collected in the report. Cancellation
    /// part-way stops at the current instruction and sets
    /// [`MoodReport::cancelled`].
    ///
    /// # Errors
    ///
    /// [`EngineError::Generation`] if the instructions themselves cannot be
    /// obtained (including cancellation before they arrive).
    pub fn generate_mood_cubes(
        &mut self,
        mood: &str,
        token: &CancellationToken,
    ) -> Result<MoodReport, EngineError> {
        info!(%mood, "mood cubes requested");
        let answer = self.generator.complete(
            &mut self.service,
            &mut self.status,
            &mood_template(),
            &GenerationParameters::creative(),
            mood,
            token,
        )?;

        let instructions = parse_mood_instructions(&answer);
        info!(count = instructions.len(), "mood instructions received");

        let mut report = MoodReport {
            instructions: instructions.clone(),
            ..MoodReport::default()
        };
        for (index, instruction) in instructions.into_iter().enumerate() {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let cube = self.add_cube_to_current_group(Transform::at(instruction.position))?;
            report.cubes.push(cube);

            match self.generate_logic_from_text(&instruction.prompt, token) {
                Ok(round) => report.rounds.push(round),
                Err(EngineError::Generation(GenerationError::Cancelled)) => {
                    report.cancelled = true;
                    break;
                }
                Err(error) => {
                    warn!(index, %error, "mood cube left without behavior");
                    report.failures.push(MoodFailure {
                        index,
                        prompt: instruction.prompt,
                        reason: error.to_string(),
                    });
                }
            }
        }
        info!(
            cubes = report.cubes.len(),
            behaviors = report.rounds.len(),
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "mood cubes generation completed"
        );
        Ok(report)
    }

    /// Transcribe a spoken mood, then run
    /// [`generate_mood_cubes`](Self::generate_mood_cubes).
    ///
    /// # Errors
    ///
    /// Transcription failures, or as `generate_mood_cubes`.
    pub fn generate_mood_cubes_from_audio(
        &mut self,
        clip: &AudioClip,
        token: &CancellationToken,
    ) -> Result<MoodReport, EngineError> {
        let mood = self.transcribe(clip, token)?;
        self.generate_mood_cubes(&mood, token)
    }
}
