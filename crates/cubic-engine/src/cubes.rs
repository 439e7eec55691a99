//! [`CubesManager`]: the session object tying the pieces together.
//!
//! It owns the completion service, the behavior loader, the group
//! sequencer, the scene and the status feed. Cubes are added to the current
//! group; a successful generation applies the new behavior to that group and
//! opens the next one; every frame runs all live behaviors and applies their
//! commands to the scene.
//!
//! All calls are synchronous. A generation blocks until the service answers;
//! callers that need responsiveness run the manager on a worker thread and
//! cancel through the [`CancellationToken`].

use std::sync::mpsc::Receiver;

use cubic_logic::behavior::{BehaviorHandle, BehaviorLoader};
use cubic_logic::entity::EntityId;
use cubic_logic::event::GroupEvent;
use cubic_logic::sequencer::{GenerationRound, GroupSequencer};
use cubic_logic::LogicError;
use cubic_script_host::{FrameInput, ProxyFailure, WasmBehaviorLoader};
use tracing::{debug, info};

use crate::ai::{
    AudioClip, CancellationToken, PromptCompletionService, PromptTemplate, ServiceError,
    StatusEvent, StatusFeed,
};
use crate::audio::{AudioAnalyzer, AudioDataSource, AudioLevels};
use crate::config::EngineConfig;
use crate::generation::{with_retry, GenerationError, LogicGenerator};
use crate::scene::{CubeState, Scene, Transform};
use crate::EngineError;

// ---------------------------------------------------------------------------
// FrameReport
// ---------------------------------------------------------------------------

/// What happened during one [`CubesManager::advance_frame`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub levels: AudioLevels,
    /// Commands applied to the scene.
    pub commands_applied: usize,
    /// Behaviors that failed this frame; their commands were discarded.
    pub failures: Vec<ProxyFailure>,
    pub fuel_consumed: u64,
}

// ---------------------------------------------------------------------------
// CubesManager
// ---------------------------------------------------------------------------

/// A cubes session driven by prompts and audio.
pub struct CubesManager<S> {
    pub(crate) service: S,
    pub(crate) loader: WasmBehaviorLoader,
    pub(crate) sequencer: GroupSequencer,
    pub(crate) scene: Scene,
    pub(crate) generator: LogicGenerator,
    pub(crate) status: StatusFeed,
    pub(crate) config: EngineConfig,
    frame: u64,
}

impl<S: PromptCompletionService> CubesManager<S> {
    /// Start a session with one empty group and an empty scene.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] for an invalid config, [`EngineError::Script`]
    /// if the sandbox cannot be created.
    pub fn new(service: S, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let loader = WasmBehaviorLoader::new(config.script.clone())?;
        let generator = LogicGenerator::new(
            config.generation.clone(),
            PromptTemplate::behavior_script(),
            config.transcription_language.clone(),
        );
        info!(join_policy = ?config.join_policy, "cubes manager initialized");
        Ok(Self {
            service,
            loader,
            sequencer: GroupSequencer::with_join_policy(config.join_policy),
            scene: Scene::new(),
            generator,
            status: StatusFeed::new(),
            config,
            frame: 0,
        })
    }

    /// Replace the template wrapped around behavior prompts.
    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.generator = LogicGenerator::new(
            self.generator.params().clone(),
            template,
            self.generator.language().to_owned(),
        );
        self
    }

    // -- cubes ---------------------------------------------------------------

    /// Spawn a cube with `transform` and add it to the current group.
    ///
    /// # Errors
    ///
    /// [`EngineError::Logic`] if the group refuses the cube; the cube is
    /// removed from the scene again.
    pub fn add_cube_to_current_group(&mut self, transform: Transform) -> Result<EntityId, EngineError> {
        let entity = self.scene.spawn(transform);
        match self.sequencer.add_entity_to_current_group(entity, &mut self.loader) {
            Ok(group) => {
                info!(
                    %entity,
                    %group,
                    group_size = self.sequencer.current_group().count(),
                    "cube added to the current group"
                );
                Ok(entity)
            }
            Err(e) => {
                self.scene.despawn(entity);
                Err(e.into())
            }
        }
    }

    /// Remove a cube from its group and from the scene, stopping its
    /// behaviors. Returns the cube's last state.
    ///
    /// # Errors
    ///
    /// [`EngineError::Logic`] if the cube is not managed.
    pub fn remove_cube(&mut self, entity: EntityId) -> Result<CubeState, EngineError> {
        let released = self.sequencer.remove_entity(entity, &mut self.loader)?;
        let state = self
            .scene
            .despawn(entity)
            .ok_or(LogicError::UnknownEntity { entity })?;
        debug!(%entity, released, "cube removed");
        Ok(state)
    }

    // -- generation ----------------------------------------------------------

    /// Generate a behavior from a text prompt and apply it to the current
    /// group, which is then closed.
    ///
    /// The whole request (completion, compile, attach) is retried up to
    /// `retry.max_attempts` times. A behavior that compiles but cannot be
    /// applied is unloaded before the next attempt.
    ///
    /// # Errors
    ///
    /// [`EngineError::Generation`] with [`GenerationError::Cancelled`] or
    /// [`GenerationError::Exhausted`]. The groups are unchanged in both cases.
    pub fn generate_logic_from_text(
        &mut self,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<GenerationRound, EngineError> {
        info!(%prompt, "logic requested from text prompt");
        let Self {
            service,
            loader,
            sequencer,
            generator,
            status,
            config,
            ..
        } = &mut *self;

        let round = with_retry(config.retry, status, token, |status| {
            let handle = generator.generate_from_text(&mut *service, &mut *loader, status, prompt, token)?;
            if token.is_cancelled() {
                loader.unload(handle);
                return Err(GenerationError::Cancelled);
            }
            sequencer
                .on_behavior_generated(handle, &mut *loader)
                .map_err(|e| {
                    loader.unload(handle);
                    GenerationError::Attach(e)
                })
        })?;

        let members = self
            .sequencer
            .group(round.applied_to)
            .map(|g| g.count())
            .unwrap_or(0);
        self.status.publish(StatusEvent::BehaviorApplied {
            behavior: round.behavior,
            group: round.applied_to,
            members,
        });
        info!(
            behavior = %round.behavior,
            group = %round.applied_to,
            members,
            current = %round.current,
            "behavior applied; new group opened"
        );
        Ok(round)
    }

    /// Transcribe a spoken prompt once, then generate from the transcription
    /// as [`generate_logic_from_text`](Self::generate_logic_from_text) does.
    ///
    /// # Errors
    ///
    /// Transcription failures are returned as they are, without retry.
    pub fn generate_logic_from_audio(
        &mut self,
        clip: &AudioClip,
        token: &CancellationToken,
    ) -> Result<GenerationRound, EngineError> {
        info!(duration_secs = clip.duration_secs(), "logic requested from audio prompt");
        let prompt = self.transcribe(clip, token)?;
        self.generate_logic_from_text(&prompt, token)
    }

    pub(crate) fn transcribe(
        &mut self,
        clip: &AudioClip,
        token: &CancellationToken,
    ) -> Result<String, EngineError> {
        let result = self
            .generator
            .transcribe(&mut self.service, &mut self.status, clip, token);
        if matches!(
            result,
            Err(GenerationError::Cancelled | GenerationError::Service(ServiceError::Cancelled))
        ) {
            self.status.publish(StatusEvent::GenerationCancelled);
        }
        Ok(result?)
    }

    /// Detach a behavior from every group and unload it. Returns the number
    /// of groups that carried it.
    pub fn retire_behavior(&mut self, behavior: BehaviorHandle) -> usize {
        self.sequencer.retire_behavior(behavior, &mut self.loader)
    }

    // -- frames --------------------------------------------------------------

    /// Run every live behavior once with `levels` and apply their commands.
    pub fn advance_frame(&mut self, levels: AudioLevels) -> FrameReport {
        let dt = self.config.frame.fixed_dt;
        let frame = self.frame;
        let input = FrameInput {
            frame,
            elapsed: frame as f64 * dt,
            delta_time: dt as f32,
            microphone_volume: levels.microphone,
            music_volume: levels.music,
        };
        let output = self.loader.run_frame(&input);
        let commands_applied = self.scene.apply(&output.commands);
        self.frame += 1;

        debug!(
            frame,
            proxies = output.proxies_run,
            commands_applied,
            failures = output.failures.len(),
            fuel = output.fuel_consumed,
            "frame advanced"
        );
        FrameReport {
            frame,
            levels,
            commands_applied,
            failures: output.failures,
            fuel_consumed: output.fuel_consumed,
        }
    }

    /// Build a volume analyzer over `source` tuned by the session's
    /// `analyzer` config.
    pub fn analyzer<A: AudioDataSource>(&self, source: A) -> AudioAnalyzer<A> {
        AudioAnalyzer::new(source, self.config.analyzer.clone())
    }

    // -- notifications -------------------------------------------------------

    /// Receive status notifications from now on.
    pub fn subscribe_status(&mut self) -> Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Take the group events recorded since the last drain.
    ///
    /// The manager never drains the log itself; hosts must poll this
    /// regularly or the log keeps every event of the session.
    pub fn drain_group_events(&mut self) -> Vec<GroupEvent> {
        self.sequencer.drain_events()
    }

    // -- accessors -----------------------------------------------------------

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn sequencer(&self) -> &GroupSequencer {
        &self.sequencer
    }

    pub fn loader(&self) -> &WasmBehaviorLoader {
        &self.loader
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of the next frame to run.
    pub fn frame_number(&self) -> u64 {
        self.frame
    }

    /// Number of cubes in the current group.
    pub fn current_group_size(&self) -> usize {
        self.sequencer.current_group().count()
    }

    /// Whether `behavior` is still loaded.
    pub fn is_loaded(&self, behavior: BehaviorHandle) -> bool {
        self.loader.is_loaded(behavior)
    }
}

impl<S> std::fmt::Debug for CubesManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubesManager")
            .field("frame", &self.frame)
            .field("cubes", &self.scene.len())
            .field("groups", &self.sequencer.group_count())
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}
