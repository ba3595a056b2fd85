//! Audio backends: who creates contexts and who hands out microphones.
//!
//! The session never talks to a sound device directly. It asks an
//! [`AudioBackend`] for contexts at the two fixed rates and for a microphone
//! matching its constraints. [`HeadlessBackend`] renders contexts against the
//! wall clock into a null sink and captures silence, which is enough to run
//! the whole pipeline on a server or in tests. The cpal-backed backend lives
//! in `audio::device`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture};
use tracing::{debug, info};

use super::capture::{AudioFrame, FrameCallback, MicConstraints, Microphone};
use super::graph::{AudioContext, ContextState};
use super::{AudioError, CAPTURE_BUFFER_SIZE};

/// Granularity of the headless render loop.
const RENDER_TICK: Duration = Duration::from_millis(10);

/// Creates audio contexts and grants microphone access.
pub trait AudioBackend: Send + Sync {
    /// Create a running context at `sample_rate`, attached to this backend's sink.
    fn create_context(&self, sample_rate: u32) -> Result<AudioContext, AudioError>;

    /// Ask for a microphone. May take a while (permission prompts, device
    /// start-up), hence the future.
    fn request_microphone(&self, constraints: MicConstraints) -> BoxFuture<'static, Result<Box<dyn Microphone>, AudioError>>;

    fn name(&self) -> &'static str;
}

/// Null-sink backend.
///
/// By default each context gets a render thread that advances its clock in
/// real time. With `manual_clock` no thread is spawned and the caller drives
/// contexts with [`AudioContext::render`].
#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    manual_clock: bool,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self { manual_clock: false }
    }

    /// Contexts whose clocks only move when rendered by hand.
    pub fn manual_clock() -> Self {
        Self { manual_clock: true }
    }
}

impl AudioBackend for HeadlessBackend {
    fn create_context(&self, sample_rate: u32) -> Result<AudioContext, AudioError> {
        let context = AudioContext::new(sample_rate)?;
        if !self.manual_clock {
            spawn_null_sink(&context)?;
        }
        debug!(context_id = context.id(), sample_rate, "Created headless audio context");
        Ok(context)
    }

    fn request_microphone(&self, constraints: MicConstraints) -> BoxFuture<'static, Result<Box<dyn Microphone>, AudioError>> {
        let microphone: Box<dyn Microphone> = Box::new(SilentMicrophone::new(constraints));
        Box::pin(future::ready(Ok(microphone)))
    }

    fn name(&self) -> &'static str {
        "headless"
    }
}

/// Render `context` in real time until it is closed or dropped.
pub(super) fn spawn_null_sink(context: &AudioContext) -> Result<(), AudioError> {
    let weak = context.downgrade();
    let sample_rate = context.sample_rate() as f64;

    thread::Builder::new()
        .name(format!("null-sink-{}", context.id()))
        .spawn(move || {
            let mut last = Instant::now();
            let mut carry = 0.0f64;
            loop {
                thread::sleep(RENDER_TICK);
                let Some(context) = weak.upgrade() else { break };
                if context.state() == ContextState::Closed {
                    break;
                }

                let now = Instant::now();
                let due = now.duration_since(last).as_secs_f64() * sample_rate + carry;
                last = now;
                let frames = due.floor();
                carry = due - frames;
                context.render(frames as usize);
            }
        })
        .map(|_| ())
        .map_err(|e| AudioError::ContextCreation(format!("failed to spawn render thread: {}", e)))
}

/// A microphone that captures silence at the requested rate.
pub struct SilentMicrophone {
    constraints: MicConstraints,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SilentMicrophone {
    pub fn new(constraints: MicConstraints) -> Self {
        Self {
            constraints,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Microphone for SilentMicrophone {
    fn start(&mut self, mut on_frame: FrameCallback) -> Result<(), AudioError> {
        if self.is_live() {
            return Ok(());
        }
        if self.constraints.sample_rate == 0 {
            return Err(AudioError::MicrophoneUnavailable("sample rate must be greater than 0".to_string()));
        }

        let period = Duration::from_secs_f64(CAPTURE_BUFFER_SIZE as f64 / self.constraints.sample_rate as f64);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name("silent-microphone".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(period);
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    on_frame(AudioFrame::new(vec![0.0; CAPTURE_BUFFER_SIZE]));
                }
            })
            .map_err(|e| AudioError::Device(format!("failed to spawn capture thread: {}", e)))?;

        self.worker = Some(worker);
        info!(sample_rate = self.constraints.sample_rate, "Silent microphone started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            debug!("Silent microphone stopped");
        }
    }

    fn is_live(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        "silent".to_string()
    }
}

impl Drop for SilentMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}
