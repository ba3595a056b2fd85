//! Owner of the two audio contexts a session needs.
//!
//! Capture runs in a 16 kHz context, playback in a 24 kHz one. Each context
//! carries one visualizer node: capture frames are fed through the input
//! node, and every playback source is routed through the output node.

use std::sync::Arc;

use tracing::{debug, info};

use super::backend::AudioBackend;
use super::graph::{AudioContext, AudioNode, ContextState};
use super::{AudioError, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

struct ContextPair {
    context: AudioContext,
    visualizer: AudioNode,
}

impl ContextPair {
    fn create(backend: &dyn AudioBackend, sample_rate: u32) -> Result<Self, AudioError> {
        let context = backend.create_context(sample_rate)?;
        let visualizer = context.create_node()?;
        Ok(Self { context, visualizer })
    }

    fn usable(&self) -> bool {
        self.context.state() != ContextState::Closed
    }
}

/// Capture and playback contexts plus their visualizer nodes.
pub struct AudioContexts {
    backend: Arc<dyn AudioBackend>,
    input: Option<ContextPair>,
    output: Option<ContextPair>,
}

impl AudioContexts {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            input: None,
            output: None,
        }
    }

    /// Make sure both contexts exist and are running.
    ///
    /// Missing or closed contexts are recreated along with fresh visualizer
    /// nodes; suspended ones are resumed.
    pub fn ensure(&mut self) -> Result<(), AudioError> {
        if !self.input.as_ref().is_some_and(ContextPair::usable) {
            self.input = Some(ContextPair::create(self.backend.as_ref(), INPUT_SAMPLE_RATE)?);
            info!(sample_rate = INPUT_SAMPLE_RATE, "Input audio context created");
        }
        if !self.output.as_ref().is_some_and(ContextPair::usable) {
            self.output = Some(ContextPair::create(self.backend.as_ref(), OUTPUT_SAMPLE_RATE)?);
            info!(sample_rate = OUTPUT_SAMPLE_RATE, "Output audio context created");
        }

        for pair in [&self.input, &self.output].into_iter().flatten() {
            if pair.context.state() == ContextState::Suspended {
                pair.context.resume()?;
                debug!(context_id = pair.context.id(), "Resumed suspended audio context");
            }
        }
        Ok(())
    }

    /// Close both contexts. Their visualizer nodes become torn down.
    pub fn dispose(&mut self) {
        for pair in [self.input.take(), self.output.take()].into_iter().flatten() {
            pair.context.close();
            debug!(context_id = pair.context.id(), "Audio context closed");
        }
    }

    pub fn input(&self) -> Option<&AudioContext> {
        self.input.as_ref().map(|p| &p.context)
    }

    pub fn output(&self) -> Option<&AudioContext> {
        self.output.as_ref().map(|p| &p.context)
    }

    pub fn input_visualizer(&self) -> Option<&AudioNode> {
        self.input.as_ref().map(|p| &p.visualizer)
    }

    pub fn output_visualizer(&self) -> Option<&AudioNode> {
        self.output.as_ref().map(|p| &p.visualizer)
    }

    /// Audio clock of the playback context, or 0 when there is none.
    pub fn output_time(&self) -> f64 {
        self.output().map(AudioContext::current_time).unwrap_or(0.0)
    }

    pub fn backend(&self) -> Arc<dyn AudioBackend> {
        Arc::clone(&self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::HeadlessBackend;

    fn contexts() -> AudioContexts {
        AudioContexts::new(Arc::new(HeadlessBackend::manual_clock()))
    }

    #[test]
    fn test_ensure_creates_both_contexts_at_fixed_rates() {
        let mut contexts = contexts();
        assert!(contexts.input().is_none());
        contexts.ensure().unwrap();

        assert_eq!(contexts.input().unwrap().sample_rate(), 16_000);
        assert_eq!(contexts.output().unwrap().sample_rate(), 24_000);
        assert_eq!(
            contexts.input_visualizer().unwrap().context_id(),
            contexts.input().unwrap().id()
        );
    }

    #[test]
    fn test_ensure_keeps_live_contexts_and_resumes_suspended() {
        let mut contexts = contexts();
        contexts.ensure().unwrap();
        let id = contexts.output().unwrap().id();
        contexts.output().unwrap().suspend().unwrap();

        contexts.ensure().unwrap();
        assert_eq!(contexts.output().unwrap().id(), id);
        assert_eq!(contexts.output().unwrap().state(), ContextState::Running);
    }

    #[test]
    fn test_closed_context_is_recreated_with_new_node() {
        let mut contexts = contexts();
        contexts.ensure().unwrap();
        let old_node = contexts.input_visualizer().unwrap().clone();
        contexts.input().unwrap().close();

        contexts.ensure().unwrap();
        assert!(old_node.is_torn_down());
        assert!(!contexts.input_visualizer().unwrap().same_node(&old_node));
    }

    #[test]
    fn test_dispose_closes_everything() {
        let mut contexts = contexts();
        contexts.ensure().unwrap();
        let input = contexts.input().unwrap().clone();
        contexts.dispose();
        contexts.dispose();
        assert_eq!(input.state(), ContextState::Closed);
        assert!(contexts.output().is_none());
        assert_eq!(contexts.output_time(), 0.0);
    }
}
