//! Microphone capture
//!
//! Acquires the local capture device and hands out a shared [`MicStream`]
//! handle. The device is a scoped resource: it is released when the last
//! handle drops, on every exit path, including abrupt teardown from a parent
//! state change.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::error::AudioError;

/// Capture frames buffered for slow subscribers before they start lagging
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle events reported by a capture acquisition
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// The device was acquired and is delivering frames
    Acquired(MicStream),
    /// Acquisition failed (device missing, busy, or permission denied)
    Rejected(AudioError),
    /// The held device went away mid-capture (unplugged, revoked)
    Lost,
}

/// Callback for capture lifecycle events
pub type CaptureSink = Box<dyn Fn(CaptureEvent) + Send + Sync + 'static>;

/// Capture device acquisition, injectable so tests can fake denial and loss
pub trait MicDriver: Send + Sync {
    /// Request the capture device. Never blocks: the outcome arrives on the
    /// sink as `Acquired` or `Rejected`, and later `Lost` if the device
    /// disappears while held.
    fn acquire(&self, sink: CaptureSink);
}

struct MicStreamInner {
    device_name: String,
    sample_rate: u32,
    channels: u16,
    frames: broadcast::Sender<Vec<f32>>,
    /// Dropping this wakes the capture thread, which releases the device
    _stop: Option<std::sync::mpsc::Sender<()>>,
}

/// Shared handle to a live capture stream
///
/// Clones are cheap; the underlying device is released when the last clone
/// drops.
#[derive(Clone)]
pub struct MicStream {
    inner: Arc<MicStreamInner>,
}

impl MicStream {
    /// Handle not backed by a local capture thread, for drivers that manage
    /// capture themselves and for tests.
    pub fn detached(device_name: &str, sample_rate: u32, channels: u16) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MicStreamInner {
                device_name: device_name.to_string(),
                sample_rate,
                channels,
                frames,
                _stop: None,
            }),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    /// Subscribe to interleaved f32 capture frames
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<f32>> {
        self.inner.frames.subscribe()
    }
}

impl fmt::Debug for MicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicStream")
            .field("device", &self.inner.device_name)
            .field("sample_rate", &self.inner.sample_rate)
            .field("channels", &self.inner.channels)
            .finish()
    }
}

/// Information about an available capture device
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    pub name: String,
    pub is_default: bool,
}

/// List available capture devices
pub fn list_capture_devices() -> Vec<CaptureDevice> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| {
                    let name = device.name().ok()?;
                    let is_default = default_name.as_ref() == Some(&name);
                    Some(CaptureDevice { name, is_default })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Production capture driver backed by the default cpal input device
///
/// cpal streams are not `Send`, so each acquisition runs on a dedicated
/// thread that owns the stream and parks until the last [`MicStream`] handle
/// drops.
pub struct CpalMicDriver;

impl MicDriver for CpalMicDriver {
    fn acquire(&self, sink: CaptureSink) {
        std::thread::spawn(move || run_capture(Arc::new(sink)));
    }
}

fn run_capture(sink: Arc<CaptureSink>) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        sink(CaptureEvent::Rejected(AudioError::NoCaptureDevice));
        return;
    };
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            sink(CaptureEvent::Rejected(AudioError::DeviceOpenFailed(
                e.to_string(),
            )));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config: StreamConfig = supported.config();

    let (frames_tx, _) = broadcast::channel::<Vec<f32>>(FRAME_CHANNEL_CAPACITY);

    // Lost fires at most once per acquisition
    let lost = Arc::new(AtomicBool::new(false));
    let err_sink = sink.clone();
    let err_lost = lost.clone();
    let err_fn = move |e: cpal::StreamError| {
        warn!("Capture stream error: {}", e);
        if !err_lost.swap(true, Ordering::SeqCst) {
            err_sink(CaptureEvent::Lost);
        }
    };

    let data_tx = frames_tx.clone();
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let _ = data_tx.send(data.to_vec());
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                let samples: Vec<f32> =
                    data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                let _ = data_tx.send(samples);
            },
            err_fn,
            None,
        ),
        other => {
            sink(CaptureEvent::Rejected(AudioError::UnsupportedConfig(
                format!("sample format {:?}", other),
            )));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            sink(CaptureEvent::Rejected(AudioError::DeviceOpenFailed(
                e.to_string(),
            )));
            return;
        }
    };

    if let Err(e) = stream.play() {
        sink(CaptureEvent::Rejected(AudioError::StreamError(
            e.to_string(),
        )));
        return;
    }

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    debug!(
        "Capture acquired: {} ({} Hz, {} ch)",
        device_name, sample_rate, channels
    );
    sink(CaptureEvent::Acquired(MicStream {
        inner: Arc::new(MicStreamInner {
            device_name: device_name.clone(),
            sample_rate,
            channels,
            frames: frames_tx,
            _stop: Some(stop_tx),
        }),
    }));

    // Park until the last handle drops, then release the device
    let _ = stop_rx.recv();
    drop(stream);
    debug!("Capture released: {}", device_name);
}
