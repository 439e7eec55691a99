//! Audio level analysis for audio-reactive behaviors.
//!
//! An [`AudioAnalyzer`] turns raw samples from an [`AudioDataSource`] into a
//! smoothed volume in `[0, 1]`. Each frame the engine samples the microphone
//! and music providers into an [`AudioLevels`] snapshot, which behaviors read
//! through the host API.
//!
//! Device capture is out of scope: the embedding application pushes samples
//! into a [`SampleBuffer`].

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Sources and providers
// ---------------------------------------------------------------------------

/// Anything that can hand out the latest samples of a playing stream.
pub trait AudioDataSource {
    fn is_playing(&self) -> bool;

    fn channels(&self) -> usize;

    /// Fill `buf` with the latest samples of `channel`.
    fn read_channel(&mut self, buf: &mut [f32], channel: usize);
}

/// A volume in `[0, 1]`, read once per frame.
pub trait AudioLevelProvider {
    fn current_volume(&mut self) -> f32;
}

/// A provider that always reports the same level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FixedLevel(pub f32);

impl AudioLevelProvider for FixedLevel {
    fn current_volume(&mut self) -> f32 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Audio levels for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioLevels {
    pub microphone: f32,
    pub music: f32,
}

impl AudioLevels {
    /// Read both providers once.
    pub fn sample(
        microphone: &mut dyn AudioLevelProvider,
        music: &mut dyn AudioLevelProvider,
    ) -> Self {
        Self {
            microphone: microphone.current_volume(),
            music: music.current_volume(),
        }
    }

    /// The same level on both inputs.
    pub fn uniform(level: f32) -> Self {
        Self {
            microphone: level,
            music: level,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioAnalyzer
// ---------------------------------------------------------------------------

/// Tuning for an [`AudioAnalyzer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Gain applied to the smoothed level. Default: 10.
    pub sensitivity: f32,
    /// Samples read per channel per update. Default: 128.
    pub samples: usize,
    /// Weight of the previous level in the running average. Default: 0.25.
    pub alpha: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sensitivity: 10.0,
            samples: 128,
            alpha: 0.25,
        }
    }
}

/// Smoothed volume of an [`AudioDataSource`].
///
/// While the source plays, every read folds the mean absolute sample into a
/// running average, `v = v * alpha + mean * (1 - alpha)`, and reports
/// `clamp(v * sensitivity, 0, 1)`. A silent source keeps the last level.
#[derive(Debug)]
pub struct AudioAnalyzer<S> {
    source: S,
    config: AnalyzerConfig,
    scratch: Vec<f32>,
    level: f32,
}

impl<S: AudioDataSource> AudioAnalyzer<S> {
    pub fn new(source: S, config: AnalyzerConfig) -> Self {
        let scratch = vec![0.0; config.samples];
        Self {
            source,
            config,
            scratch,
            level: 0.0,
        }
    }

    /// Unscaled running average.
    pub fn raw_level(&self) -> f32 {
        self.level
    }

    pub fn sensitivity(&self) -> f32 {
        self.config.sensitivity
    }

    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        self.config.sensitivity = sensitivity;
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn update_level(&mut self) {
        let channels = self.source.channels();
        if !self.source.is_playing() || channels == 0 || self.scratch.is_empty() {
            return;
        }
        let mut sum = 0.0f32;
        for channel in 0..channels {
            self.scratch.fill(0.0);
            self.source.read_channel(&mut self.scratch, channel);
            // Non-finite samples count as silence.
            sum += self
                .scratch
                .iter()
                .filter(|s| s.is_finite())
                .map(|s| s.abs())
                .sum::<f32>();
        }
        let mean = sum / (self.scratch.len() * channels) as f32;
        let alpha = self.config.alpha;
        self.level = self.level * alpha + mean * (1.0 - alpha);
        if !self.level.is_finite() {
            warn!(level = self.level, "audio level reset after overflow");
            self.level = 0.0;
        }
    }
}

impl<S: AudioDataSource> AudioLevelProvider for AudioAnalyzer<S> {
    fn current_volume(&mut self) -> f32 {
        self.update_level();
        let scaled = self.level * self.config.sensitivity;
        if scaled.is_nan() {
            0.0
        } else {
            scaled.clamp(0.0, 1.0)
        }
    }
}

// ---------------------------------------------------------------------------
// SampleBuffer
// ---------------------------------------------------------------------------

/// In-memory [`AudioDataSource`] holding the most recent samples per channel.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    channels: Vec<VecDeque<f32>>,
    capacity: usize,
    playing: bool,
}

impl SampleBuffer {
    /// A stopped buffer keeping the last `capacity` samples of each channel.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: vec![VecDeque::with_capacity(capacity); channels],
            capacity,
            playing: false,
        }
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    /// Append samples to `channel`, dropping the oldest beyond capacity.
    /// Unknown channels are ignored.
    pub fn push(&mut self, channel: usize, samples: &[f32]) {
        let capacity = self.capacity;
        if let Some(queue) = self.channels.get_mut(channel) {
            queue.extend(samples.iter().copied());
            let excess = queue.len().saturating_sub(capacity);
            queue.drain(..excess);
        }
    }

    /// Append interleaved samples, one per channel per frame.
    pub fn push_interleaved(&mut self, samples: &[f32]) {
        let channels = self.channels.len();
        if channels == 0 {
            return;
        }
        for (i, sample) in samples.iter().enumerate() {
            self.push(i % channels, std::slice::from_ref(sample));
        }
    }

    pub fn clear(&mut self) {
        self.channels.iter_mut().for_each(VecDeque::clear);
    }
}

impl AudioDataSource for SampleBuffer {
    fn is_playing(&self) -> bool {
        self.playing
    }

    fn channels(&self) -> usize {
        self.channels.len()
    }

    /// The newest samples are right-aligned in `buf`; missing ones stay as
    /// they were.
    fn read_channel(&mut self, buf: &mut [f32], channel: usize) {
        let Some(queue) = self.channels.get(channel) else {
            return;
        };
        let take = buf.len().min(queue.len());
        let offset = buf.len() - take;
        for (slot, sample) in buf[offset..].iter_mut().zip(queue.iter().skip(queue.len() - take)) {
            *slot = *sample;
        }
    }
}
