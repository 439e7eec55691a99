//! A full cubes session without network access.
//!
//! A canned completion service answers every prompt with one of a few
//! prewritten behaviors, so the whole pipeline (prompt, compile, group
//! rounds, frames) runs offline. Run with:
//!
//! ```text
//! RUST_LOG=debug cargo run -p cubic-engine --example scripted_session
//! ```

use std::collections::VecDeque;

use anyhow::Context;
use cubic_engine::prelude::*;

const SPIN: &str = r#"(module
  (import "cubic" "delta_time" (func $dt (result f32)))
  (import "cubic" "rotate" (func $rotate (param f32 f32 f32)))
  (func (export "update")
    (call $rotate (f32.const 0) (f32.mul (f32.const 90) (call $dt)) (f32.const 0))))"#;

const MUSIC_SCALE: &str = r#"(module
  (import "cubic" "music_volume" (func $music (result f32)))
  (import "cubic" "set_scale" (func $scale (param f32 f32 f32)))
  (func (export "update")
    (local $s f32)
    (local.set $s (f32.add (f32.const 1) (call $music)))
    (call $scale (local.get $s) (local.get $s) (local.get $s))))"#;

const MIC_COLOR: &str = r#"(module
  (import "cubic" "microphone_volume" (func $mic (result f32)))
  (import "cubic" "set_color" (func $color (param f32 f32 f32)))
  (func (export "update")
    (local $v f32)
    (local.set $v (call $mic))
    (call $color (local.get $v) (f32.sub (f32.const 1) (local.get $v)) (f32.const 0))))"#;

/// Replays canned answers in order.
struct CannedService {
    answers: VecDeque<&'static str>,
}

impl PromptCompletionService for CannedService {
    fn complete(&mut self, _prompt: &str, _params: &GenerationParameters) -> Result<String, ServiceError> {
        self.answers
            .pop_front()
            .map(|source| format!("```wat\n{source}\n```"))
            .ok_or_else(|| ServiceError::Transient("out of canned answers".to_owned()))
    }

    fn transcribe(&mut self, _clip: &AudioClip, _language: &str) -> Result<String, ServiceError> {
        Ok("change color with my voice".to_owned())
    }
}

fn main() -> Result<(), anyhow::Error> {
    init_logging("info");

    let service = CannedService {
        answers: VecDeque::from([SPIN, MUSIC_SCALE, MIC_COLOR]),
    };
    let mut cubes = CubesManager::new(service, EngineConfig::default())
        .context("failed to start the session")?;
    let feed = cubes.subscribe_status();
    let token = CancellationToken::new();

    // Three eras of cubes, each with its own behavior.
    for x in [-2.0, -1.0] {
        cubes.add_cube_to_current_group(Transform::at(Vec3::new(x, 1.0, 0.0)))?;
    }
    cubes.generate_logic_from_text("spin around", &token)?;

    cubes.add_cube_to_current_group(Transform::at(Vec3::new(0.0, 1.0, 0.0)))?;
    cubes.generate_logic_from_text("pulse with the music", &token)?;

    for x in [1.0, 2.0] {
        cubes.add_cube_to_current_group(Transform::at(Vec3::new(x, 1.0, 0.0)))?;
    }
    let clip = AudioClip::new(vec![0.0; 16_000], 16_000, 1);
    cubes.generate_logic_from_audio(&clip, &token)?;

    // Simulated audio: music ramps up, microphone alternates.
    let mut music = SampleBuffer::new(1, 256);
    music.set_playing(true);
    let mut analyzer = cubes.analyzer(music);

    for frame in 0..120u32 {
        let amplitude = frame as f32 / 1200.0;
        let samples: Vec<f32> = (0..64)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        analyzer.source_mut().push(0, &samples);
        let mut microphone = FixedLevel(if frame % 30 < 15 { 0.8 } else { 0.1 });

        let levels = AudioLevels::sample(&mut microphone, &mut analyzer);
        let report = cubes.advance_frame(levels);
        if !report.failures.is_empty() {
            tracing::warn!(frame = report.frame, failures = report.failures.len(), "behaviors failed");
        }
    }

    for event in feed.try_iter() {
        tracing::info!(?event, "status");
    }
    for (entity, cube) in cubes.scene().iter() {
        println!(
            "{entity}: rotation y {:.1}, scale {:.2}, color ({:.2}, {:.2}, {:.2})",
            cube.transform.rotation.y,
            cube.transform.scale.x,
            cube.color.r,
            cube.color.g,
            cube.color.b,
        );
    }
    println!("scene hash: {}", cubes.scene().state_hash());
    Ok(())
}
