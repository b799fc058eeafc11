//! Audio module
//!
//! Capture device acquisition for the microphone supervisor and call cue
//! playback.

mod capture;
mod cue;
mod error;

pub use capture::{
    list_capture_devices, CaptureDevice, CaptureEvent, CaptureSink, CpalMicDriver, MicDriver,
    MicStream,
};
pub use cue::{Cue, CuePlayer, NullCuePlayer, SynthCuePlayer};
pub use error::AudioError;
