//! The task that owns a [`LiveVoiceSession`].
//!
//! Commands from the HTTP layer, inputs posted by device threads and the
//! remote reader, pending microphone/handshake work and the visualizer tick
//! are all multiplexed onto one task, so the session only ever sees one
//! thing at a time.

use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::events::SessionEvent;
use super::orchestrator::{LiveVoiceSession, PendingWork};
use super::state::SessionState;
use super::{ConnectorFactory, SessionError, SessionSettings, SessionSnapshot};
use crate::audio::AudioContexts;

/// Capacity of the event broadcast; slow observers lose the oldest events.
const EVENT_CAPACITY: usize = 256;

type ActivationReply = oneshot::Sender<Result<SessionState, SessionError>>;

#[derive(Debug)]
enum SessionCommand {
    Activate(ActivationReply),
    Stop,
    SetPrompt(Option<String>),
    Reset(oneshot::Sender<bool>),
    Shutdown,
}

/// Cloneable handle to a running session driver.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Start a session and wait until it is streaming, or failed.
    pub async fn activate(&self) -> Result<SessionState, SessionError> {
        let (reply, outcome) = oneshot::channel();
        self.send(SessionCommand::Activate(reply))?;
        outcome.await.map_err(|_| SessionError::DriverUnavailable)?
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop)
    }

    pub fn set_initial_prompt(&self, prompt: Option<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SetPrompt(prompt))
    }

    /// Stop and rebuild the remote connector. Resolves to whether a connector
    /// is available afterwards.
    pub async fn reset(&self) -> Result<bool, SessionError> {
        let (reply, outcome) = oneshot::channel();
        self.send(SessionCommand::Reset(reply))?;
        outcome.await.map_err(|_| SessionError::DriverUnavailable)
    }

    /// Stop the session, dispose its audio contexts, and end the driver task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::DriverUnavailable)
    }
}

pub struct SessionDriver;

impl SessionDriver {
    /// Build the session and spawn its driver task on the current runtime.
    pub fn spawn(
        settings: SessionSettings,
        contexts: AudioContexts,
        connector_factory: ConnectorFactory,
        analyzer_interval: Duration,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = LiveVoiceSession::new(settings, contexts, connector_factory, inbox_tx, events.clone());
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());

        let handle = SessionHandle {
            commands: commands_tx,
            events: events.clone(),
            snapshot,
        };
        let task = tokio::spawn(run(session, commands, inbox, events, snapshot_tx, analyzer_interval));
        (handle, task)
    }
}

async fn run(
    mut session: LiveVoiceSession,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut inbox: mpsc::UnboundedReceiver<super::SessionInput>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    analyzer_interval: Duration,
) {
    info!("Session driver started");
    let mut pending: FuturesUnordered<PendingWork> = FuturesUnordered::new();
    let mut waiting: Option<(u64, ActivationReply)> = None;
    let mut tick = tokio::time::interval(analyzer_interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(SessionCommand::Shutdown) => break,
                Some(SessionCommand::Activate(reply)) => match session.activate() {
                    Ok(work) => {
                        if let Some((_, superseded)) = waiting.take() {
                            let _ = superseded.send(Err(SessionError::Cancelled));
                        }
                        waiting = Some((session.generation(), reply));
                        pending.push(work);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Some(SessionCommand::Stop) => session.stop(),
                Some(SessionCommand::SetPrompt(prompt)) => session.set_initial_system_prompt(prompt),
                Some(SessionCommand::Reset(reply)) => {
                    let _ = reply.send(session.reset_connection());
                }
            },
            Some(input) = inbox.recv() => {
                if let Some(work) = session.handle(input) {
                    pending.push(work);
                }
            }
            Some(input) = pending.next(), if !pending.is_empty() => {
                if let Some(work) = session.handle(input) {
                    pending.push(work);
                }
            }
            _ = tick.tick() => {
                let frame = session.update_analyzers();
                if session.state().is_busy() || !frame.is_silent() {
                    let _ = events.send(SessionEvent::Analyzers(frame));
                }
            }
        }

        if let Some((generation, _)) = &waiting {
            if let Some(outcome) = session.activation_outcome(*generation) {
                debug!(ok = outcome.is_ok(), "Activation settled");
                if let Some((_, reply)) = waiting.take() {
                    let _ = reply.send(outcome);
                }
            }
        }
        snapshot.send_replace(session.snapshot());
    }

    session.dispose();
    if let Some((_, reply)) = waiting.take() {
        let _ = reply.send(Err(SessionError::Cancelled));
    }
    snapshot.send_replace(session.snapshot());
    info!("Session driver stopped");
}
