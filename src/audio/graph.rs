//! # Audio Graph
//!
//! A small audio graph modelled on how browsers structure realtime audio:
//!
//! - **AudioContext**: owns an audio clock and a playback mixer at one fixed sample rate
//! - **AudioNode**: a point in the graph whose most recent signal can be observed
//! - **Playback sources**: decoded buffers scheduled to start at a clock time
//!
//! The audio clock only moves when frames are rendered. A sink (the sound
//! device, a wall-clock null sink, or a test) calls [`AudioContext::render`],
//! which mixes every source that is due, feeds the destination nodes, advances
//! the clock, and fires completion callbacks for sources that ran out.
//!
//! ## Threading:
//! Rendering usually happens on a device or sink thread while the session
//! schedules sources from its own task, so the mixer sits behind a `Mutex`.
//! Completion callbacks are always invoked after the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use uuid::Uuid;

use super::codec::PcmBuffer;
use super::AudioError;

/// How many recent samples a node keeps for observers.
const TAP_CAPACITY: usize = 2048;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a scheduled playback source.
pub type SourceId = Uuid;

/// Called once, with the source's id, when a source finishes playing on its own.
pub type EndedCallback = Box<dyn FnOnce(SourceId) + Send>;

/// Lifecycle of an audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Running,
    Suspended,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ring of the most recent samples that passed through a node.
#[derive(Debug, Default)]
struct SignalTap {
    samples: Mutex<VecDeque<f32>>,
}

impl SignalTap {
    fn push(&self, samples: &[f32]) {
        let mut ring = lock(&self.samples);
        for &sample in samples {
            if ring.len() == TAP_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(sample);
        }
    }

    fn latest(&self, out: &mut [f32]) {
        let ring = lock(&self.samples);
        let available = ring.len().min(out.len());
        let pad = out.len() - available;
        out[..pad].iter_mut().for_each(|s| *s = 0.0);
        for (slot, sample) in out[pad..].iter_mut().zip(ring.iter().skip(ring.len() - available)) {
            *slot = *sample;
        }
    }
}

/// A point in an audio graph whose signal can be observed.
///
/// Cloning an `AudioNode` yields another handle to the same node.
#[derive(Debug, Clone)]
pub struct AudioNode {
    context_id: u64,
    tap: Arc<SignalTap>,
    context_alive: Arc<AtomicBool>,
}

impl AudioNode {
    /// Context this node belongs to.
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Whether both handles point at the same node.
    pub fn same_node(&self, other: &AudioNode) -> bool {
        Arc::ptr_eq(&self.tap, &other.tap)
    }

    /// True once the owning context has been closed.
    pub fn is_torn_down(&self) -> bool {
        !self.context_alive.load(Ordering::SeqCst)
    }

    /// Feed samples through this node.
    pub fn write(&self, samples: &[f32]) {
        if !self.is_torn_down() {
            self.tap.push(samples);
        }
    }

    /// Copy the newest `out.len()` samples, zero-padded at the front when
    /// fewer have been seen.
    pub fn read_latest(&self, out: &mut [f32]) {
        self.tap.latest(out);
    }
}

struct ScheduledSource {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
    cursor: usize,
    destination: AudioNode,
    on_ended: Option<EndedCallback>,
}

impl ScheduledSource {
    fn finished(&self) -> bool {
        self.cursor >= self.samples.len()
    }
}

struct Mixer {
    state: ContextState,
    rendered_frames: u64,
    sources: Vec<ScheduledSource>,
}

impl Mixer {
    /// Mix `frames` frames. Returns the mono output and the callbacks of
    /// sources that completed inside this block.
    fn render(&mut self, frames: usize) -> (Vec<f32>, Vec<(SourceId, EndedCallback)>) {
        let mut output = vec![0.0f32; frames];
        if self.state != ContextState::Running {
            return (output, Vec::new());
        }

        let block_start = self.rendered_frames;
        let block_end = block_start + frames as u64;
        let mut destinations: Vec<(AudioNode, Vec<f32>)> = Vec::new();

        for source in &mut self.sources {
            if source.start_frame >= block_end || source.finished() {
                continue;
            }
            let offset = source.start_frame.saturating_sub(block_start) as usize;
            let count = (frames - offset).min(source.samples.len() - source.cursor);
            let chunk = &source.samples[source.cursor..source.cursor + count];

            for (slot, sample) in output[offset..offset + count].iter_mut().zip(chunk) {
                *slot += *sample;
            }

            let index = match destinations.iter().position(|(node, _)| node.same_node(&source.destination)) {
                Some(index) => index,
                None => {
                    destinations.push((source.destination.clone(), vec![0.0; frames]));
                    destinations.len() - 1
                }
            };
            for (slot, sample) in destinations[index].1[offset..offset + count].iter_mut().zip(chunk) {
                *slot += *sample;
            }

            source.cursor += count;
        }

        for (node, mix) in &destinations {
            node.write(mix);
        }

        // Zero-length buffers end as soon as their start time is reached.
        let mut ended = Vec::new();
        self.sources.retain_mut(|source| {
            let done = source.start_frame < block_end && source.finished();
            if done {
                if let Some(callback) = source.on_ended.take() {
                    ended.push((source.id, callback));
                }
            }
            !done
        });

        self.rendered_frames = block_end;
        (output, ended)
    }
}

struct ContextInner {
    id: u64,
    sample_rate: u32,
    alive: Arc<AtomicBool>,
    mixer: Mutex<Mixer>,
}

/// An audio processing context: one clock, one mixer, one sample rate.
///
/// Cheap to clone; clones share the same context.
#[derive(Clone)]
pub struct AudioContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("id", &self.inner.id)
            .field("sample_rate", &self.inner.sample_rate)
            .field("state", &self.state())
            .finish()
    }
}

impl AudioContext {
    /// Create a running context with no sink attached.
    ///
    /// Its clock stays at zero until something calls [`render`](Self::render).
    pub fn new(sample_rate: u32) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::ContextCreation("sample rate must be greater than 0".to_string()));
        }
        Ok(Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
                sample_rate,
                alive: Arc::new(AtomicBool::new(true)),
                mixer: Mutex::new(Mixer {
                    state: ContextState::Running,
                    rendered_frames: 0,
                    sources: Vec::new(),
                }),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn state(&self) -> ContextState {
        lock(&self.inner.mixer).state
    }

    /// Audio clock in seconds: frames rendered so far over the sample rate.
    pub fn current_time(&self) -> f64 {
        lock(&self.inner.mixer).rendered_frames as f64 / self.inner.sample_rate as f64
    }

    pub fn resume(&self) -> Result<(), AudioError> {
        let mut mixer = lock(&self.inner.mixer);
        match mixer.state {
            ContextState::Closed => Err(AudioError::Resume("context is closed".to_string())),
            _ => {
                mixer.state = ContextState::Running;
                Ok(())
            }
        }
    }

    pub fn suspend(&self) -> Result<(), AudioError> {
        let mut mixer = lock(&self.inner.mixer);
        match mixer.state {
            ContextState::Closed => Err(AudioError::ContextClosed),
            _ => {
                mixer.state = ContextState::Suspended;
                Ok(())
            }
        }
    }

    /// Close the context. Pending sources are dropped without callbacks and
    /// every node of this context becomes torn down. Closing twice is a no-op.
    pub fn close(&self) {
        let mut mixer = lock(&self.inner.mixer);
        mixer.state = ContextState::Closed;
        mixer.sources.clear();
        self.inner.alive.store(false, Ordering::SeqCst);
    }

    /// Create a pass-through node (the visualizer taps are built this way).
    pub fn create_node(&self) -> Result<AudioNode, AudioError> {
        if self.state() == ContextState::Closed {
            return Err(AudioError::ContextClosed);
        }
        Ok(AudioNode {
            context_id: self.inner.id,
            tap: Arc::new(SignalTap::default()),
            context_alive: Arc::clone(&self.inner.alive),
        })
    }

    /// Schedule `buffer` to start at clock time `when` (seconds), routed
    /// through `destination`.
    ///
    /// A start time in the past starts at the next rendered frame. The
    /// buffer is mixed down to mono and must already be at the context rate.
    pub fn start_source(
        &self,
        buffer: &PcmBuffer,
        destination: &AudioNode,
        when: f64,
        on_ended: EndedCallback,
    ) -> Result<SourceId, AudioError> {
        if destination.context_id() != self.inner.id {
            return Err(AudioError::ContextMismatch {
                expected: self.inner.id,
                found: destination.context_id(),
            });
        }
        if buffer.sample_rate() != self.inner.sample_rate {
            return Err(AudioError::SampleRateMismatch {
                expected: self.inner.sample_rate,
                found: buffer.sample_rate(),
            });
        }

        let mut mixer = lock(&self.inner.mixer);
        if mixer.state == ContextState::Closed {
            return Err(AudioError::ContextClosed);
        }

        let requested = (when.max(0.0) * self.inner.sample_rate as f64).round() as u64;
        let start_frame = requested.max(mixer.rendered_frames);
        let id = Uuid::new_v4();
        mixer.sources.push(ScheduledSource {
            id,
            samples: buffer.to_mono(),
            start_frame,
            cursor: 0,
            destination: destination.clone(),
            on_ended: Some(on_ended),
        });
        Ok(id)
    }

    /// Stop a source immediately. Its completion callback is not invoked.
    /// Returns false when the source already finished or never existed.
    pub fn stop_source(&self, id: SourceId) -> bool {
        let mut mixer = lock(&self.inner.mixer);
        let before = mixer.sources.len();
        mixer.sources.retain(|source| source.id != id);
        mixer.sources.len() != before
    }

    /// Number of scheduled sources that have not finished yet.
    pub fn pending_sources(&self) -> usize {
        lock(&self.inner.mixer).sources.len()
    }

    /// Render the next `frames` frames of mono output and advance the clock.
    ///
    /// A suspended or closed context renders silence and its clock does not move.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let (output, ended) = lock(&self.inner.mixer).render(frames);
        for (id, callback) in ended {
            callback(id);
        }
        output
    }

    /// A handle that does not keep the context alive. Sinks hold one of these
    /// so dropping the last strong handle stops them.
    pub fn downgrade(&self) -> WeakAudioContext {
        WeakAudioContext {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference to an [`AudioContext`].
#[derive(Clone)]
pub struct WeakAudioContext {
    inner: Weak<ContextInner>,
}

impl WeakAudioContext {
    pub fn upgrade(&self) -> Option<AudioContext> {
        self.inner.upgrade().map(|inner| AudioContext { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tone(sample_rate: u32, seconds: f64, value: f32) -> PcmBuffer {
        let frames = (sample_rate as f64 * seconds) as usize;
        PcmBuffer::from_channels(sample_rate, vec![vec![value; frames]])
    }

    fn counter() -> (Arc<AtomicUsize>, EndedCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, Box::new(move |_| {
            handle.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_clock_advances_only_when_rendering() {
        let ctx = AudioContext::new(1000).unwrap();
        assert_eq!(ctx.current_time(), 0.0);
        ctx.render(500);
        assert!((ctx.current_time() - 0.5).abs() < 1e-9);

        ctx.suspend().unwrap();
        ctx.render(500);
        assert!((ctx.current_time() - 0.5).abs() < 1e-9);

        ctx.resume().unwrap();
        ctx.render(250);
        assert!((ctx.current_time() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_source_plays_at_scheduled_time_and_ends() {
        let ctx = AudioContext::new(1000).unwrap();
        let node = ctx.create_node().unwrap();
        let (ended, callback) = counter();

        ctx.start_source(&tone(1000, 0.1, 0.5), &node, 0.05, callback).unwrap();
        let out = ctx.render(100);

        assert!(out[..50].iter().all(|&s| s == 0.0));
        assert!(out[50..].iter().all(|&s| s == 0.5));
        assert_eq!(ended.load(Ordering::SeqCst), 0);

        let mut seen = [0.0f32; 4];
        node.read_latest(&mut seen);
        assert_eq!(seen, [0.5; 4]);

        let out = ctx.render(100);
        assert!(out[..50].iter().all(|&s| s == 0.5));
        assert!(out[50..].iter().all(|&s| s == 0.0));
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.pending_sources(), 0);
    }

    #[test]
    fn test_back_to_back_sources_have_no_gap() {
        let ctx = AudioContext::new(1000).unwrap();
        let node = ctx.create_node().unwrap();
        let (_, first) = counter();
        let (_, second) = counter();

        ctx.start_source(&tone(1000, 0.1, 0.25), &node, 0.0, first).unwrap();
        ctx.start_source(&tone(1000, 0.1, 0.5), &node, 0.1, second).unwrap();
        let out = ctx.render(200);

        assert!(out[..100].iter().all(|&s| s == 0.25));
        assert!(out[100..].iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_stopped_source_does_not_fire_callback() {
        let ctx = AudioContext::new(1000).unwrap();
        let node = ctx.create_node().unwrap();
        let (ended, callback) = counter();

        let id = ctx.start_source(&tone(1000, 0.1, 0.5), &node, 0.0, callback).unwrap();
        ctx.render(10);
        assert!(ctx.stop_source(id));
        assert!(!ctx.stop_source(id));
        ctx.render(200);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cross_context_and_rate_checks() {
        let a = AudioContext::new(1000).unwrap();
        let b = AudioContext::new(1000).unwrap();
        let foreign = b.create_node().unwrap();
        let (_, callback) = counter();
        assert!(matches!(
            a.start_source(&tone(1000, 0.1, 0.1), &foreign, 0.0, callback),
            Err(AudioError::ContextMismatch { .. })
        ));

        let node = a.create_node().unwrap();
        let (_, callback) = counter();
        assert!(matches!(
            a.start_source(&tone(2000, 0.1, 0.1), &node, 0.0, callback),
            Err(AudioError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_close_tears_down_nodes() {
        let ctx = AudioContext::new(1000).unwrap();
        let node = ctx.create_node().unwrap();
        assert!(!node.is_torn_down());

        let weak = ctx.downgrade();
        ctx.close();
        ctx.close();
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(weak.upgrade().is_some());
        assert!(node.is_torn_down());
        assert!(ctx.create_node().is_err());
        assert!(ctx.resume().is_err());
        drop(ctx);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_read_latest_pads_with_zeros() {
        let ctx = AudioContext::new(1000).unwrap();
        let node = ctx.create_node().unwrap();
        node.write(&[0.1, 0.2]);
        let mut out = [1.0f32; 4];
        node.read_latest(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.1, 0.2]);
    }
}
