//! Call cues
//!
//! Short synthesized tones marking call start and end, played on the default
//! output device.

use std::f32::consts::PI;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tracing::{debug, warn};

/// End-of-segment fade to avoid clicks, in samples at 48 kHz
const FADE_SAMPLES: usize = 240;

/// An audible call cue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Two rising tones when a call connects
    Connected,
    /// Two falling tones when a call ends
    Ended,
}

impl Cue {
    /// Tone sequence as (frequency Hz, duration seconds)
    fn segments(self) -> [(f32, f32); 2] {
        match self {
            Cue::Connected => [(660.0, 0.09), (880.0, 0.12)],
            Cue::Ended => [(660.0, 0.09), (440.0, 0.12)],
        }
    }
}

/// Cue playback, injectable so tests and headless runs can stay silent
pub trait CuePlayer: Send + Sync {
    /// Warm up the output path. Called once from the user-gesture point so
    /// the first real cue is not clipped by device spin-up.
    fn prime(&self) {}

    /// Play a cue; fire-and-forget.
    fn play(&self, cue: Cue);
}

/// Discards all cues
pub struct NullCuePlayer;

impl CuePlayer for NullCuePlayer {
    fn play(&self, _cue: Cue) {}
}

/// Synthesizes cues on the default output device
pub struct SynthCuePlayer {
    volume: f32,
}

impl SynthCuePlayer {
    pub fn new(volume: f32) -> Self {
        Self {
            volume: volume.clamp(0.0, 1.0),
        }
    }
}

impl Default for SynthCuePlayer {
    fn default() -> Self {
        Self::new(0.4)
    }
}

impl CuePlayer for SynthCuePlayer {
    fn prime(&self) {
        std::thread::spawn(|| {
            // 100ms of silence opens the device ahead of the first cue
            play_samples(vec![0.0; 4800]);
        });
    }

    fn play(&self, cue: Cue) {
        let volume = self.volume;
        std::thread::spawn(move || {
            let samples = render_cue(cue, 48000, volume);
            play_samples(samples);
        });
    }
}

/// Render a cue into mono f32 samples with a decay envelope per tone
fn render_cue(cue: Cue, sample_rate: u32, volume: f32) -> Vec<f32> {
    let mut samples = Vec::new();
    for (freq, dur) in cue.segments() {
        let count = (sample_rate as f32 * dur) as usize;
        for i in 0..count {
            let t = i as f32 / sample_rate as f32;
            let envelope = (-6.0 * t / dur).exp();
            let fade = if count - i < FADE_SAMPLES {
                (count - i) as f32 / FADE_SAMPLES as f32
            } else {
                1.0
            };
            samples.push(volume * envelope * fade * (2.0 * PI * freq * t).sin());
        }
    }
    samples
}

/// Play mono samples on the default output device, blocking until done
fn play_samples(samples: Vec<f32>) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        debug!("No output device; cue skipped");
        return;
    };
    let supported = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to query output device: {}", e);
            return;
        }
    };
    if supported.sample_format() != SampleFormat::F32 {
        debug!("Output device is not f32; cue skipped");
        return;
    }
    let config: StreamConfig = supported.config();
    let channels = config.channels as usize;
    let out_rate = config.sample_rate.0;

    // Duration at the device rate; samples were rendered at 48k and are
    // played back nearest-neighbor
    let total = Duration::from_secs_f32(samples.len() as f32 / 48000.0);
    let mut pos = 0f32;
    let step = 48000.0 / out_rate as f32;

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _| {
            for frame in data.chunks_mut(channels) {
                let sample = samples.get(pos as usize).copied().unwrap_or(0.0);
                for out in frame.iter_mut() {
                    *out = sample;
                }
                pos += step;
            }
        },
        |e| warn!("Cue stream error: {}", e),
        None,
    );
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to open output stream: {}", e);
            return;
        }
    };
    if stream.play().is_ok() {
        std::thread::sleep(total + Duration::from_millis(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_cue_length() {
        let samples = render_cue(Cue::Connected, 48000, 0.4);
        // 0.09s + 0.12s at 48kHz
        assert_eq!(samples.len(), 4320 + 5760);
    }

    #[test]
    fn test_render_cue_within_volume() {
        for cue in [Cue::Connected, Cue::Ended] {
            let samples = render_cue(cue, 48000, 0.4);
            assert!(samples.iter().all(|s| s.abs() <= 0.4 + f32::EPSILON));
        }
    }
}
