//! Frequency-magnitude snapshots for visualizers.
//!
//! An [`AmplitudeAnalyzer`] watches one [`AudioNode`] and turns the newest
//! `ANALYZER_FFT_SIZE` samples into `ANALYZER_FFT_SIZE / 2` byte magnitudes,
//! the same way a browser analyser node does: Blackman window, FFT,
//! magnitude over N, time smoothing, then decibels mapped onto `0..=255`.
//!
//! Nothing here returns an error. Wiring problems are logged and the
//! snapshot falls back to zeros.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::{debug, error, warn};

use super::graph::AudioNode;
use super::ANALYZER_FFT_SIZE;

/// Number of magnitude bins in a snapshot.
pub const FREQUENCY_BIN_COUNT: usize = ANALYZER_FFT_SIZE / 2;

const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// One visualizer frame.
pub type AnalyzerSnapshot = [u8; FREQUENCY_BIN_COUNT];

/// Analysis node living in one audio context.
struct AnalysisNode {
    context_id: u64,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl AnalysisNode {
    fn new(context_id: u64) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            context_id,
            fft: planner.plan_fft_forward(ANALYZER_FFT_SIZE),
            window: blackman_window(ANALYZER_FFT_SIZE),
            smoothed: vec![0.0; FREQUENCY_BIN_COUNT],
        }
    }

    fn analyze(&mut self, samples: &[f32], out: &mut AnalyzerSnapshot) {
        let mut spectrum: Vec<Complex<f32>> = samples
            .iter()
            .zip(&self.window)
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut spectrum);

        let n = ANALYZER_FFT_SIZE as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (bin, slot) in out.iter_mut().enumerate() {
            let magnitude = spectrum[bin].norm() / n;
            let smoothed = SMOOTHING_TIME_CONSTANT * self.smoothed[bin] + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            self.smoothed[bin] = if smoothed.is_finite() { smoothed } else { 0.0 };

            let db = 20.0 * self.smoothed[bin].log10();
            *slot = if db.is_finite() {
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }
}

/// Blackman window with alpha = 0.16.
fn blackman_window(size: usize) -> Vec<f32> {
    let a0 = 0.42;
    let a1 = 0.5;
    let a2 = 0.08;
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

/// Visualizer tap over one audio node.
pub struct AmplitudeAnalyzer {
    analysis: Option<AnalysisNode>,
    source: Option<AudioNode>,
    data: AnalyzerSnapshot,
}

impl AmplitudeAnalyzer {
    /// Attach to `node`. If the node's context is already gone the analyzer
    /// is created detached and reports zeros.
    pub fn new(node: &AudioNode) -> Self {
        let mut analyzer = Self {
            analysis: None,
            source: None,
            data: [0; FREQUENCY_BIN_COUNT],
        };
        if node.is_torn_down() {
            error!(context_id = node.context_id(), "Cannot attach analyzer to a torn-down audio node");
            return analyzer;
        }
        analyzer.analysis = Some(AnalysisNode::new(node.context_id()));
        analyzer.source = Some(node.clone());
        analyzer
    }

    /// Point the analyzer at a different node, recreating the analysis node
    /// when the new node lives in another context.
    pub fn retarget(&mut self, node: &AudioNode) {
        if self.source.as_ref().is_some_and(|current| current.same_node(node)) {
            return;
        }

        if let Some(old) = self.source.take() {
            if old.is_torn_down() {
                debug!(context_id = old.context_id(), "Previous analyzer source was already torn down");
            }
        }

        match &self.analysis {
            Some(analysis) if analysis.context_id == node.context_id() => {}
            Some(_) => {
                warn!(context_id = node.context_id(), "New node has a different audio context, recreating analysis node");
                self.analysis = Some(AnalysisNode::new(node.context_id()));
            }
            None => {
                self.analysis = Some(AnalysisNode::new(node.context_id()));
            }
        }

        if node.is_torn_down() {
            error!(context_id = node.context_id(), "Failed to connect analyzer: audio node is torn down");
            return;
        }
        debug!(context_id = node.context_id(), "Analyzer connected to new node");
        self.source = Some(node.clone());
    }

    /// Refresh the snapshot from the newest samples of the source node.
    ///
    /// With no source the analysis node sees silence, so the magnitudes
    /// decay toward zero. With no analysis node the snapshot is zeroed.
    pub fn update(&mut self) {
        let Some(analysis) = self.analysis.as_mut() else {
            self.data = [0; FREQUENCY_BIN_COUNT];
            return;
        };

        let mut samples = [0.0f32; ANALYZER_FFT_SIZE];
        if let Some(source) = self.source.as_ref().filter(|s| !s.is_torn_down()) {
            source.read_latest(&mut samples);
        }
        analysis.analyze(&samples, &mut self.data);
    }

    /// Last computed snapshot.
    pub fn data(&self) -> &AnalyzerSnapshot {
        &self.data
    }

    pub fn is_connected(&self) -> bool {
        self.source.is_some()
    }

    /// Release the source wiring. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.source.take().is_some() {
            debug!("Analyzer disconnected");
        }
    }
}

impl std::fmt::Debug for AmplitudeAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmplitudeAnalyzer")
            .field("context_id", &self.analysis.as_ref().map(|a| a.context_id))
            .field("connected", &self.is_connected())
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::graph::AudioContext;

    fn sine(cycles: f32, amplitude: f32) -> Vec<f32> {
        (0..ANALYZER_FFT_SIZE)
            .map(|i| (2.0 * PI * cycles * i as f32 / ANALYZER_FFT_SIZE as f32).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_snapshot_has_sixteen_bins() {
        let ctx = AudioContext::new(16_000).unwrap();
        let analyzer = AmplitudeAnalyzer::new(&ctx.create_node().unwrap());
        assert_eq!(analyzer.data().len(), 16);
    }

    #[test]
    fn test_silence_reads_as_zero() {
        let ctx = AudioContext::new(16_000).unwrap();
        let node = ctx.create_node().unwrap();
        let mut analyzer = AmplitudeAnalyzer::new(&node);
        node.write(&[0.0; 64]);
        analyzer.update();
        assert!(analyzer.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_shows_up_in_its_bin() {
        let ctx = AudioContext::new(16_000).unwrap();
        let node = ctx.create_node().unwrap();
        let mut analyzer = AmplitudeAnalyzer::new(&node);
        node.write(&sine(4.0, 0.001));
        for _ in 0..20 {
            analyzer.update();
        }
        let data = analyzer.data();
        let peak = data.iter().enumerate().max_by_key(|(_, v)| **v).map(|(i, _)| i);
        assert_eq!(peak, Some(4));
        assert!(data[4] > 0);
    }

    #[test]
    fn test_torn_down_node_gives_zeros() {
        let ctx = AudioContext::new(16_000).unwrap();
        let node = ctx.create_node().unwrap();
        ctx.close();
        let mut analyzer = AmplitudeAnalyzer::new(&node);
        analyzer.update();
        assert!(!analyzer.is_connected());
        assert_eq!(analyzer.data(), &[0; FREQUENCY_BIN_COUNT]);
    }

    #[test]
    fn test_retarget_same_node_is_noop_and_across_contexts_recreates() {
        let first = AudioContext::new(16_000).unwrap();
        let node = first.create_node().unwrap();
        let mut analyzer = AmplitudeAnalyzer::new(&node);
        analyzer.retarget(&node.clone());
        assert!(analyzer.is_connected());

        first.close();
        let second = AudioContext::new(16_000).unwrap();
        let fresh = second.create_node().unwrap();
        analyzer.retarget(&fresh);
        assert!(analyzer.is_connected());
        assert_eq!(analyzer.analysis.as_ref().map(|a| a.context_id), Some(second.id()));

        fresh.write(&sine(2.0, 0.8));
        analyzer.update();
        assert!(analyzer.data().iter().any(|&b| b > 0));
    }

    #[test]
    fn test_retarget_to_torn_down_node_leaves_source_empty() {
        let ctx = AudioContext::new(16_000).unwrap();
        let mut analyzer = AmplitudeAnalyzer::new(&ctx.create_node().unwrap());
        let dead_ctx = AudioContext::new(16_000).unwrap();
        let dead = dead_ctx.create_node().unwrap();
        dead_ctx.close();

        analyzer.retarget(&dead);
        assert!(!analyzer.is_connected());
        analyzer.update();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let ctx = AudioContext::new(16_000).unwrap();
        let mut analyzer = AmplitudeAnalyzer::new(&ctx.create_node().unwrap());
        analyzer.disconnect();
        analyzer.disconnect();
        assert!(!analyzer.is_connected());
        analyzer.update();
        assert_eq!(analyzer.data(), &[0; FREQUENCY_BIN_COUNT]);
    }
}
