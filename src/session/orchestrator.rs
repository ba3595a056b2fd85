//! The live voice session state machine.
//!
//! `LiveVoiceSession` is a plain `&mut self` state machine. Everything that
//! happens to it arrives as a call: UI commands (`activate`, `stop`, ...) or
//! a [`SessionInput`] handed to [`LiveVoiceSession::handle`]. Device threads,
//! the remote reader and the audio render thread never touch it directly;
//! they post `SessionInput`s into the inbox, and whoever owns the session
//! (normally the [`SessionDriver`](super::SessionDriver)) feeds them back in
//! one at a time.
//!
//! Long-latency steps (microphone grant, remote handshake) are returned as
//! [`PendingWork`] futures. The owner runs them and hands the resulting
//! input back. Every input carries the generation it was created under;
//! `activate()` and every teardown bump the generation, so results that
//! arrive after a `stop()` are released instead of applied.

use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::events::{AnalyzerFrame, SessionEvent, SpeechEvent, StatusEvent};
use super::schedule::{ActiveSourceSet, PlaybackSchedule};
use super::state::{ErrorCode, SessionState};
use super::{ConnectorFactory, SessionError, SessionSettings, SessionSnapshot, SessionStats};
use crate::audio::codec::{decode_inline_audio, encode_float_to_pcm_blob};
use crate::audio::{
    AmplitudeAnalyzer, AudioContexts, AudioError, AudioFrame, Microphone, SourceId, AUDIO_CHANNELS,
    OUTPUT_SAMPLE_RATE,
};
use crate::remote::{
    connect_with_policy, RealtimeInput, RemoteConnector, RemoteError, RemoteEvent, RemoteEventSink, RemoteSession,
    ServerEvent, ServerMessage,
};

/// Something that happened outside the session and must be applied to it.
pub enum SessionInput {
    /// One fixed-size capture frame from the microphone
    CaptureFrame { generation: u64, frame: AudioFrame },

    /// A callback from the remote connection
    Remote { generation: u64, event: RemoteEvent },

    /// A playback source finished on its own
    PlaybackEnded { generation: u64, source: SourceId },

    /// Outcome of the microphone request
    MicrophoneReady {
        generation: u64,
        result: Result<Box<dyn Microphone>, AudioError>,
    },

    /// Outcome of the remote handshake
    Connected {
        generation: u64,
        result: Result<Box<dyn RemoteSession>, RemoteError>,
    },
}

impl SessionInput {
    pub fn generation(&self) -> u64 {
        match self {
            SessionInput::CaptureFrame { generation, .. }
            | SessionInput::Remote { generation, .. }
            | SessionInput::PlaybackEnded { generation, .. }
            | SessionInput::MicrophoneReady { generation, .. }
            | SessionInput::Connected { generation, .. } => *generation,
        }
    }
}

impl fmt::Debug for SessionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionInput::CaptureFrame { generation, frame } => f
                .debug_struct("CaptureFrame")
                .field("generation", generation)
                .field("samples", &frame.len())
                .finish(),
            SessionInput::Remote { generation, event } => f
                .debug_struct("Remote")
                .field("generation", generation)
                .field("event", event)
                .finish(),
            SessionInput::PlaybackEnded { generation, source } => f
                .debug_struct("PlaybackEnded")
                .field("generation", generation)
                .field("source", source)
                .finish(),
            SessionInput::MicrophoneReady { generation, result } => f
                .debug_struct("MicrophoneReady")
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
            SessionInput::Connected { generation, result } => f
                .debug_struct("Connected")
                .field("generation", generation)
                .field("ok", &result.is_ok())
                .finish(),
        }
    }
}

/// A long-running step whose result goes back into [`LiveVoiceSession::handle`].
pub type PendingWork = BoxFuture<'static, SessionInput>;

pub struct LiveVoiceSession {
    settings: SessionSettings,
    state: SessionState,
    contexts: AudioContexts,
    connector_factory: ConnectorFactory,
    connector: Option<Arc<dyn RemoteConnector>>,
    microphone: Option<Box<dyn Microphone>>,
    remote: Option<Box<dyn RemoteSession>>,
    recording: bool,
    open_pending: bool,
    schedule: PlaybackSchedule,
    active_sources: ActiveSourceSet,
    input_analyzer: Option<AmplitudeAnalyzer>,
    output_analyzer: Option<AmplitudeAnalyzer>,
    generation: u64,
    inbox: mpsc::UnboundedSender<SessionInput>,
    events: broadcast::Sender<SessionEvent>,
    last_status: Option<StatusEvent>,
    stats: SessionStats,
}

impl LiveVoiceSession {
    /// Build an idle session and initialise the remote connector.
    ///
    /// A missing API key leaves the session in `Error(ApiKeyMissing)`.
    pub fn new(
        settings: SessionSettings,
        contexts: AudioContexts,
        connector_factory: ConnectorFactory,
        inbox: mpsc::UnboundedSender<SessionInput>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let mut session = Self {
            settings,
            state: SessionState::Idle,
            contexts,
            connector_factory,
            connector: None,
            microphone: None,
            remote: None,
            recording: false,
            open_pending: false,
            schedule: PlaybackSchedule::default(),
            active_sources: ActiveSourceSet::default(),
            input_analyzer: None,
            output_analyzer: None,
            generation: 0,
            inbox,
            events,
            last_status: None,
            stats: SessionStats::default(),
        };
        session.init_connector();
        session
    }

    // ---- observers ----

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn next_start_time(&self) -> f64 {
        self.schedule.next_start_time()
    }

    pub fn active_source_count(&self) -> usize {
        self.active_sources.len()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn has_microphone(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn contexts(&self) -> &AudioContexts {
        &self.contexts
    }

    pub fn initial_system_prompt(&self) -> Option<&str> {
        self.settings.initial_prompt.as_deref()
    }

    pub fn analyzer_frame(&self) -> AnalyzerFrame {
        AnalyzerFrame {
            input: self.input_analyzer.as_ref().map(|a| *a.data()).unwrap_or_default(),
            output: self.output_analyzer.as_ref().map(|a| *a.data()).unwrap_or_default(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            error_code: self.state.error_code(),
            last_status: self.last_status.clone(),
            stats: self.stats,
            analyzers: self.analyzer_frame(),
            active_sources: self.active_sources.len(),
            next_start_time: self.schedule.next_start_time(),
            has_initial_prompt: self.settings.initial_prompt.is_some(),
        }
    }

    /// How the activation started under `generation` turned out, or `None`
    /// while it is still in flight.
    pub fn activation_outcome(&self, generation: u64) -> Option<Result<SessionState, SessionError>> {
        match &self.state {
            SessionState::Error { code, message } => Some(Err(SessionError::from_state(*code, message))),
            state if state.is_activating() => {
                if self.generation == generation {
                    None
                } else {
                    Some(Err(SessionError::Cancelled))
                }
            }
            state if state.is_streaming_eligible() || *state == SessionState::ProcessingMessage => {
                Some(Ok(state.clone()))
            }
            _ => Some(Err(SessionError::Cancelled)),
        }
    }

    // ---- commands ----

    /// Start a session: audio contexts, microphone, remote connection.
    ///
    /// Returns the microphone request; its result must be fed back through
    /// [`handle`](Self::handle).
    pub fn activate(&mut self) -> Result<PendingWork, SessionError> {
        if self.state.is_busy() {
            warn!(state = %self.state, "Activation rejected: session already active");
            return Err(SessionError::AlreadyActive);
        }
        if self.connector.is_none() {
            self.fail_missing_key();
            return Err(SessionError::ApiKeyMissing);
        }
        if let Err(e) = self.contexts.ensure() {
            let err = SessionError::AudioContext(e.clone());
            self.set_error(ErrorCode::AudioContextFailure, err.to_string(), e.to_string());
            return Err(err);
        }
        self.attach_analyzers();
        self.schedule.reset(self.contexts.output_time());

        self.generation += 1;
        self.stats.activations += 1;
        info!(generation = self.generation, "Activating live voice session");
        self.set_state(SessionState::RequestingMic, None);

        let generation = self.generation;
        let request = self.contexts.backend().request_microphone(self.settings.microphone.clone());
        Ok(async move {
            SessionInput::MicrophoneReady {
                generation,
                result: request.await,
            }
        }
        .boxed())
    }

    /// Stop capture, playback and the remote session. Safe from any state.
    pub fn stop(&mut self) {
        info!(state = %self.state, "Stopping live voice session");
        self.teardown(true);
    }

    /// `stop()`, then close both audio contexts and release the analyzers.
    pub fn dispose(&mut self) {
        self.stop();
        self.contexts.dispose();
        for mut analyzer in [self.input_analyzer.take(), self.output_analyzer.take()].into_iter().flatten() {
            analyzer.disconnect();
        }
        info!("Live voice session disposed");
    }

    /// Prompt sent as realtime text when the next session opens.
    pub fn set_initial_system_prompt(&mut self, prompt: Option<String>) {
        self.settings.initial_prompt = prompt.filter(|p| !p.trim().is_empty());
        debug!(has_prompt = self.settings.initial_prompt.is_some(), "Initial system prompt updated");
    }

    /// `stop()`, then rebuild the connector. A session stuck in `Error` goes
    /// back to `Idle` when the connector is usable again.
    pub fn reset_connection(&mut self) -> bool {
        info!("Resetting connection and session");
        self.teardown(true);
        let ready = self.init_connector();
        if ready && self.state.is_error() {
            self.set_state(SessionState::Idle, Some("Connection reset.".to_string()));
        }
        ready
    }

    /// Refresh both analyzer snapshots. Call on the visualization cadence.
    pub fn update_analyzers(&mut self) -> AnalyzerFrame {
        for analyzer in [self.input_analyzer.as_mut(), self.output_analyzer.as_mut()].into_iter().flatten() {
            analyzer.update();
        }
        self.analyzer_frame()
    }

    // ---- inputs ----

    /// Apply one input. May return follow-up work to run.
    pub fn handle(&mut self, input: SessionInput) -> Option<PendingWork> {
        match input {
            SessionInput::MicrophoneReady { generation, result } => return self.on_microphone(generation, result),
            SessionInput::Connected { generation, result } => self.on_connected(generation, result),
            other if other.generation() != self.generation => {
                debug!(input = ?other, current = self.generation, "Dropping stale session input");
            }
            SessionInput::CaptureFrame { frame, .. } => self.on_capture_frame(frame),
            SessionInput::Remote { event, .. } => self.on_remote_event(event),
            SessionInput::PlaybackEnded { source, .. } => self.on_playback_ended(source),
        }
        None
    }

    fn on_microphone(&mut self, generation: u64, result: Result<Box<dyn Microphone>, AudioError>) -> Option<PendingWork> {
        if generation != self.generation || self.state != SessionState::RequestingMic {
            if let Ok(mut microphone) = result {
                microphone.stop();
                debug!("Released microphone from a cancelled activation");
            }
            return None;
        }

        let mut microphone = match result {
            Ok(microphone) => microphone,
            Err(e) => {
                self.fail_microphone(e);
                return None;
            }
        };
        self.set_state(SessionState::MicGranted, None);

        let inbox = self.inbox.clone();
        let visualizer = self.contexts.input_visualizer().cloned();
        let started = microphone.start(Box::new(move |frame: AudioFrame| {
            if let Some(node) = &visualizer {
                node.write(frame.samples());
            }
            let _ = inbox.send(SessionInput::CaptureFrame { generation, frame });
        }));
        if let Err(e) = started {
            microphone.stop();
            self.fail_microphone(e);
            return None;
        }
        info!(device = %microphone.label(), "Microphone capture started");
        self.microphone = Some(microphone);

        let Some(connector) = self.connector.clone() else {
            self.fail_missing_key();
            self.teardown(false);
            return None;
        };

        self.set_state(SessionState::Connecting, None);
        let inbox = self.inbox.clone();
        let events: RemoteEventSink = Arc::new(move |event| {
            let _ = inbox.send(SessionInput::Remote { generation, event });
        });
        let connecting = connect_with_policy(
            connector,
            self.settings.connect.clone(),
            events,
            self.settings.connect_policy.clone(),
        );
        Some(async move {
            SessionInput::Connected {
                generation,
                result: connecting.await,
            }
        }
        .boxed())
    }

    fn fail_microphone(&mut self, e: AudioError) {
        let err = SessionError::MicAccessDenied(e.to_string());
        self.set_error(ErrorCode::MicAccessDenied, err.to_string(), e.to_string());
        self.teardown(false);
    }

    fn on_connected(&mut self, generation: u64, result: Result<Box<dyn RemoteSession>, RemoteError>) {
        if generation != self.generation || self.state != SessionState::Connecting {
            if let Ok(mut session) = result {
                session.close();
                debug!("Closed remote session from a cancelled activation");
            }
            return;
        }

        match result {
            Ok(session) => {
                info!("Live API session established");
                self.remote = Some(session);
                if std::mem::take(&mut self.open_pending) {
                    self.on_open();
                }
            }
            Err(e) => {
                let err = SessionError::ConnectFailed(e.to_string());
                self.set_error(ErrorCode::ConnectFailed, err.to_string(), e.to_string());
                self.teardown(false);
            }
        }
    }

    fn on_remote_event(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Open => match self.state {
                SessionState::Connecting if self.remote.is_none() => self.open_pending = true,
                SessionState::Connecting => self.on_open(),
                _ => debug!(state = %self.state, "Ignoring open callback"),
            },
            RemoteEvent::Message(message) => self.on_server_message(message),
            RemoteEvent::Error(message) => {
                let err = SessionError::Remote(message.clone());
                self.set_error(ErrorCode::SessionErrorCallback, err.to_string(), message);
                self.teardown(true);
            }
            RemoteEvent::Close(reason) => {
                let reason = reason.unwrap_or_else(|| "No reason provided".to_string());
                self.set_state(SessionState::Idle, Some(format!("Live API session closed: {}", reason)));
                self.teardown(false);
            }
        }
    }

    fn on_open(&mut self) {
        self.set_state(SessionState::SessionOpen, Some("Live API session opened.".to_string()));
        self.recording = true;
        self.set_state(SessionState::StreamingUser, Some("Capturing audio for the Live API.".to_string()));

        if let Some(prompt) = self.settings.initial_prompt.clone() {
            if let Err(e) = self.send(RealtimeInput::Text(prompt)) {
                self.fail_send(e);
            }
        }
    }

    fn on_capture_frame(&mut self, frame: AudioFrame) {
        if !self.recording || !self.state.is_streaming_eligible() || self.remote.is_none() {
            return;
        }
        let blob = encode_float_to_pcm_blob(frame.samples());
        match self.send(RealtimeInput::Media(blob)) {
            Ok(()) => self.stats.frames_sent += 1,
            Err(e) => self.fail_send(e),
        }
    }

    fn send(&mut self, input: RealtimeInput) -> Result<(), RemoteError> {
        self.remote
            .as_mut()
            .ok_or(RemoteError::Closed)?
            .send_realtime_input(input)
    }

    fn fail_send(&mut self, e: RemoteError) {
        let err = SessionError::AudioSend(e.to_string());
        self.set_error(ErrorCode::AudioSendError, err.to_string(), e.to_string());
        self.teardown(true);
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        if !self.state.is_streaming_eligible() {
            debug!(state = %self.state, "Ignoring server message outside an open session");
            return;
        }
        self.set_state(
            SessionState::ProcessingMessage,
            Some(format!("Processing {}", message.description())),
        );

        for event in message.events {
            match event {
                ServerEvent::Audio { mime_type, data } => self.play_audio(&mime_type, &data),
                ServerEvent::Interrupted => self.interrupt(),
                ServerEvent::Text { text } => {
                    let _ = self.events.send(SessionEvent::Speech(SpeechEvent::text(text)));
                }
                ServerEvent::TurnComplete => debug!("Model turn complete"),
                ServerEvent::SetupComplete => {}
            }
        }
        self.settle();
    }

    fn play_audio(&mut self, mime_type: &str, data: &str) {
        let (Some(output), Some(node)) = (self.contexts.output().cloned(), self.contexts.output_visualizer().cloned())
        else {
            self.report_playback_error("Output audio context is not ready".to_string());
            return;
        };
        self.set_state(SessionState::PlayingAiAudio, None);

        let buffer = match decode_inline_audio(data, OUTPUT_SAMPLE_RATE, AUDIO_CHANNELS) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.report_playback_error(e.to_string());
                return;
            }
        };

        let start = self.schedule.start_time(output.current_time());
        let inbox = self.inbox.clone();
        let generation = self.generation;
        let on_ended = Box::new(move |source| {
            let _ = inbox.send(SessionInput::PlaybackEnded { generation, source });
        });

        match output.start_source(&buffer, &node, start, on_ended) {
            Ok(id) => {
                self.schedule.advance(start, buffer.duration());
                self.active_sources.insert(id);
                self.stats.chunks_scheduled += 1;
                debug!(mime_type, start, duration = buffer.duration(), "Scheduled AI audio chunk");
            }
            Err(e) => self.report_playback_error(e.to_string()),
        }
    }

    fn interrupt(&mut self) {
        let stopped = self.active_sources.drain();
        if let Some(output) = self.contexts.output() {
            for id in &stopped {
                output.stop_source(*id);
            }
        }
        let now = self.contexts.output_time();
        self.schedule.reset(now);
        self.stats.interruptions += 1;
        info!(stopped = stopped.len(), now, "AI speech interrupted");
    }

    fn on_playback_ended(&mut self, source: SourceId) {
        if self.active_sources.remove(&source) && self.active_sources.is_empty() {
            self.settle();
        }
    }

    /// Return to the resting state for the current playback situation.
    fn settle(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Closing | SessionState::Error { .. }) {
            return;
        }
        let next = if !self.active_sources.is_empty() {
            SessionState::PlayingAiAudio
        } else if self.recording {
            SessionState::StreamingUser
        } else {
            SessionState::SessionOpen
        };
        if self.state != next {
            self.set_state(next, None);
        }
    }

    // ---- internals ----

    fn init_connector(&mut self) -> bool {
        match (self.connector_factory)() {
            Ok(connector) => {
                info!(connector = connector.name(), "Remote connector ready");
                self.connector = Some(connector);
                true
            }
            Err(RemoteError::MissingApiKey) => {
                self.connector = None;
                self.fail_missing_key();
                false
            }
            Err(e) => {
                self.connector = None;
                let err = SessionError::SdkInit(e.to_string());
                self.set_error(ErrorCode::SdkInitFailed, err.to_string(), e.to_string());
                false
            }
        }
    }

    fn attach_analyzers(&mut self) {
        if let Some(node) = self.contexts.input_visualizer() {
            match self.input_analyzer.as_mut() {
                Some(analyzer) => analyzer.retarget(node),
                None => self.input_analyzer = Some(AmplitudeAnalyzer::new(node)),
            }
        }
        if let Some(node) = self.contexts.output_visualizer() {
            match self.output_analyzer.as_mut() {
                Some(analyzer) => analyzer.retarget(node),
                None => self.output_analyzer = Some(AmplitudeAnalyzer::new(node)),
            }
        }
    }

    /// Release microphone, playback and remote. Emits `Closing` first when
    /// asked to and a session was active; ends in `Idle` unless in `Error`.
    fn teardown(&mut self, announce_closing: bool) {
        self.generation += 1;
        self.recording = false;
        self.open_pending = false;

        let released_microphone = match self.microphone.take() {
            Some(mut microphone) => {
                microphone.stop();
                true
            }
            None => false,
        };

        let stopped = self.active_sources.drain();
        if let Some(output) = self.contexts.output() {
            for id in &stopped {
                output.stop_source(*id);
            }
        }
        self.schedule.reset(self.contexts.output_time());

        if announce_closing && self.state.is_busy() && self.state != SessionState::Closing {
            self.set_state(SessionState::Closing, None);
        }
        let closed_remote = match self.remote.take() {
            Some(mut remote) => {
                remote.close();
                true
            }
            None => false,
        };

        if !self.state.is_error() && self.state != SessionState::Idle {
            self.set_state(SessionState::Idle, None);
        }
        debug!(
            released_microphone,
            closed_remote,
            stopped_sources = stopped.len(),
            "Session resources released"
        );
    }

    fn set_state(&mut self, new_state: SessionState, status: Option<String>) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        let (code, error) = match &self.state {
            SessionState::Error { code, message } => (code.as_str().to_string(), Some(message.clone())),
            state => (state.as_str().to_string(), None),
        };
        let event = StatusEvent {
            status: status.unwrap_or_else(|| self.state.default_status_text().to_string()),
            code,
            error,
            old_state,
        };
        debug!(from = %event.old_state.as_str(), to = %self.state.as_str(), status = %event.status, "Session state transition");
        self.publish_status(event);
    }

    fn set_error(&mut self, code: ErrorCode, status: String, detail: String) {
        error!(code = %code, detail = %detail, "Live voice session error");
        self.set_state(SessionState::Error { code, message: detail }, Some(status));
    }

    fn fail_missing_key(&mut self) {
        let message = SessionError::ApiKeyMissing.to_string();
        self.set_error(ErrorCode::ApiKeyMissing, message.clone(), message);
    }

    /// Non-fatal playback problem: reported, state unchanged.
    fn report_playback_error(&mut self, detail: String) {
        warn!(detail = %detail, "Failed to play AI audio chunk");
        self.stats.playback_errors += 1;
        self.publish_status(StatusEvent {
            status: format!("Error playing AI audio: {}", detail),
            code: ErrorCode::AiAudioPlayError.as_str().to_string(),
            error: Some(detail),
            old_state: self.state.clone(),
        });
    }

    fn publish_status(&mut self, event: StatusEvent) {
        self.last_status = Some(event.clone());
        let _ = self.events.send(SessionEvent::Status(event));
    }
}

impl fmt::Debug for LiveVoiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveVoiceSession")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("recording", &self.recording)
            .field("active_sources", &self.active_sources.len())
            .field("next_start_time", &self.schedule.next_start_time())
            .finish()
    }
}
