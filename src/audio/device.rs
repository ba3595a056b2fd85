//! Sound-device backend using CPAL.
//!
//! cpal streams are not `Send` on every platform, so each stream is built,
//! played and dropped on its own thread. The output thread pulls frames from
//! the context's mixer; the input thread pushes device blocks through a
//! [`FrameAssembler`].
//!
//! Nothing here blocks the caller on a device. The input stream is opened
//! inside `request_microphone` on the blocking pool, so `start` only installs
//! the frame callback and `stop` only signals the input thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleRate, StreamConfig};
use futures_util::future::BoxFuture;
use tracing::{error, info, warn};

use super::backend::{spawn_null_sink, AudioBackend};
use super::capture::{downmix_interleaved, FrameAssembler, FrameCallback, MicConstraints, Microphone};
use super::graph::{AudioContext, ContextState};
use super::{AudioError, CAPTURE_BUFFER_SIZE};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backend bound to the host's default input and output devices.
#[derive(Debug, Clone)]
pub struct DeviceBackend {
    output_device: String,
}

impl DeviceBackend {
    /// Fails when the host has no default output device.
    pub fn new() -> Result<Self, AudioError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::Device("No output device available".to_string()))?;
        let output_device = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!(device = %output_device, "Using output device");
        Ok(Self { output_device })
    }

    /// Names of the available input devices.
    pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl AudioBackend for DeviceBackend {
    fn create_context(&self, sample_rate: u32) -> Result<AudioContext, AudioError> {
        let context = AudioContext::new(sample_rate)?;
        spawn_output_stream(&context, self.output_device.clone())?;
        Ok(context)
    }

    fn request_microphone(&self, constraints: MicConstraints) -> BoxFuture<'static, Result<Box<dyn Microphone>, AudioError>> {
        Box::pin(async move {
            let microphone = tokio::task::spawn_blocking(move || DeviceMicrophone::open(constraints))
                .await
                .map_err(|e| AudioError::Device(e.to_string()))??;
            let microphone: Box<dyn Microphone> = Box::new(microphone);
            Ok(microphone)
        })
    }

    fn name(&self) -> &'static str {
        "device"
    }
}

/// Play `context` on the default output device until it is closed or dropped.
///
/// Returns once the thread is spawned. If the stream cannot be built the
/// context is rendered into a null sink instead, so its clock keeps moving
/// and scheduled sources still end.
fn spawn_output_stream(context: &AudioContext, device_name: String) -> Result<(), AudioError> {
    let weak = context.downgrade();
    let sample_rate = context.sample_rate();
    let context_id = context.id();

    thread::Builder::new()
        .name(format!("audio-out-{}", context_id))
        .spawn(move || {
            let build = || -> Result<cpal::Stream, AudioError> {
                let device = cpal::default_host()
                    .default_output_device()
                    .ok_or_else(|| AudioError::ContextCreation("No output device available".to_string()))?;
                let channels = device
                    .default_output_config()
                    .map_err(|e| AudioError::ContextCreation(e.to_string()))?
                    .channels();
                let config = StreamConfig {
                    channels,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                let render_from = weak.clone();
                let stream = device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let frames = data.len() / channels as usize;
                            let mono = match render_from.upgrade() {
                                Some(context) => context.render(frames),
                                None => vec![0.0; frames],
                            };
                            for (frame, sample) in data.chunks_mut(channels as usize).zip(mono) {
                                frame.iter_mut().for_each(|s| *s = sample);
                            }
                        },
                        |err| warn!("Audio output stream error: {}", err),
                        None,
                    )
                    .map_err(|e| AudioError::ContextCreation(e.to_string()))?;
                stream.play().map_err(|e| AudioError::ContextCreation(e.to_string()))?;
                Ok(stream)
            };

            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    error!(device = %device_name, context_id, sample_rate, "Output stream failed, rendering silently: {}", e);
                    if let Some(context) = weak.upgrade() {
                        if let Err(e) = spawn_null_sink(&context) {
                            error!("Null sink fallback failed: {}", e);
                        }
                    }
                    return;
                }
            };

            loop {
                thread::sleep(POLL_INTERVAL);
                match weak.upgrade() {
                    Some(context) if context.state() != ContextState::Closed => continue,
                    _ => break,
                }
            }
            drop(stream);
        })
        .map(|_| ())
        .map_err(|e| AudioError::ContextCreation(e.to_string()))
}

fn input_error(error: BuildStreamError) -> AudioError {
    match error {
        BuildStreamError::DeviceNotAvailable | BuildStreamError::StreamConfigNotSupported => {
            AudioError::MicrophoneUnavailable(error.to_string())
        }
        other => AudioError::MicrophoneDenied(other.to_string()),
    }
}

/// Where the input stream delivers samples. Frames are only assembled and
/// forwarded while a callback is installed.
struct CaptureSlot {
    channels: usize,
    assembler: Mutex<FrameAssembler>,
    callback: Mutex<Option<FrameCallback>>,
}

impl CaptureSlot {
    fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            assembler: Mutex::new(FrameAssembler::new(CAPTURE_BUFFER_SIZE)),
            callback: Mutex::new(None),
        }
    }

    fn install(&self, on_frame: FrameCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(on_frame);
    }

    fn clear(&self) -> bool {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner).take().is_some()
    }

    fn deliver(&self, data: &[f32]) {
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(on_frame) = callback.as_mut() else { return };
        let frames = self
            .assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&downmix_interleaved(data, self.channels));
        for frame in frames {
            on_frame(frame);
        }
    }
}

struct DeviceMicrophone {
    sample_rate: u32,
    device_name: String,
    slot: Arc<CaptureSlot>,
    /// Keeps the input thread (and its stream) alive while true.
    open: Arc<AtomicBool>,
}

impl DeviceMicrophone {
    /// Open the default input device and start its stream. Blocks until the
    /// stream is playing, so it runs on the blocking pool.
    fn open(constraints: MicConstraints) -> Result<Self, AudioError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            warn!("Echo cancellation and noise suppression are left to the OS input path");
        }

        let channels = constraints.channel_count.max(1);
        let slot = Arc::new(CaptureSlot::new(channels));
        let open = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();

        let stream_slot = Arc::clone(&slot);
        let keep_open = Arc::clone(&open);
        let sample_rate = constraints.sample_rate;
        thread::Builder::new()
            .name("audio-in".to_string())
            .spawn(move || {
                let build = || -> Result<(cpal::Stream, String), AudioError> {
                    let device = cpal::default_host()
                        .default_input_device()
                        .ok_or_else(|| AudioError::MicrophoneUnavailable("No input device available".to_string()))?;
                    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                    let config = StreamConfig {
                        channels: channels as u16,
                        sample_rate: SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };

                    let stream = device
                        .build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| stream_slot.deliver(data),
                            |err| warn!("Audio input stream error: {}", err),
                            None,
                        )
                        .map_err(input_error)?;
                    stream.play().map_err(|e| AudioError::Device(e.to_string()))?;
                    Ok((stream, name))
                };

                let stream = match build() {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while keep_open.load(Ordering::SeqCst) {
                    thread::sleep(POLL_INTERVAL);
                }
                drop(stream);
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| AudioError::Device("input thread exited early".to_string()))??;
        info!(device = %device_name, sample_rate, "Input device opened");

        Ok(Self {
            sample_rate,
            device_name,
            slot,
            open,
        })
    }
}

impl Microphone for DeviceMicrophone {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AudioError::Device("microphone has been released".to_string()));
        }
        self.slot.install(on_frame);
        info!(device = %self.device_name, sample_rate = self.sample_rate, "Audio capture started");
        Ok(())
    }

    /// The input thread drops its stream within one poll interval.
    fn stop(&mut self) {
        let was_capturing = self.slot.clear();
        if self.open.swap(false, Ordering::SeqCst) || was_capturing {
            info!(device = %self.device_name, "Audio capture stopped");
        }
    }

    fn is_live(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        self.device_name.clone()
    }
}

impl Drop for DeviceMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use std::time::Instant;

    fn detached_microphone(slot: Arc<CaptureSlot>) -> DeviceMicrophone {
        DeviceMicrophone {
            sample_rate: 16_000,
            device_name: "test".to_string(),
            slot,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    fn collector() -> (Arc<Mutex<Vec<AudioFrame>>>, FrameCallback) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        (frames, Box::new(move |frame| sink.lock().unwrap().push(frame)))
    }

    #[test]
    fn test_build_errors_map_to_mic_errors() {
        assert!(matches!(
            input_error(BuildStreamError::DeviceNotAvailable),
            AudioError::MicrophoneUnavailable(_)
        ));
        assert!(matches!(
            input_error(BuildStreamError::StreamConfigNotSupported),
            AudioError::MicrophoneUnavailable(_)
        ));
        assert!(matches!(input_error(BuildStreamError::InvalidArgument), AudioError::MicrophoneDenied(_)));
    }

    #[test]
    fn test_samples_before_start_are_dropped() {
        let slot = Arc::new(CaptureSlot::new(2));
        slot.deliver(&vec![0.5; CAPTURE_BUFFER_SIZE * 2]);

        let mut microphone = detached_microphone(Arc::clone(&slot));
        let (frames, callback) = collector();
        microphone.start(callback).unwrap();
        assert!(frames.lock().unwrap().is_empty());

        // Stereo blocks are downmixed before framing
        slot.deliver(&vec![0.25; CAPTURE_BUFFER_SIZE * 2]);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples().len(), CAPTURE_BUFFER_SIZE);
    }

    #[test]
    fn test_stop_returns_immediately_and_blocks_restart() {
        let slot = Arc::new(CaptureSlot::new(1));
        let mut microphone = detached_microphone(Arc::clone(&slot));
        let (frames, callback) = collector();
        microphone.start(callback).unwrap();
        assert!(microphone.is_live());

        let started = Instant::now();
        microphone.stop();
        microphone.stop();
        assert!(started.elapsed() < POLL_INTERVAL);
        assert!(!microphone.is_live());

        slot.deliver(&vec![0.1; CAPTURE_BUFFER_SIZE]);
        assert!(frames.lock().unwrap().is_empty());

        let (_, callback) = collector();
        assert!(microphone.start(callback).is_err());
    }
}
