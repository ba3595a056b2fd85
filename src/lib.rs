//! # Live Voice
//!
//! A duplex voice session against a realtime speech model: microphone audio
//! streams up as PCM16, the model's audio streams back and is played without
//! gaps, and barge-in interruptions cancel whatever is still queued.
//!
//! - **audio**: codec, audio graph, capture, amplitude analysis, backends
//! - **remote**: the realtime service connection (protocol, client, retry)
//! - **session**: the state machine tying both together, and its driver task
//!
//! The HTTP/WebSocket server in `main.rs` is one host for a session; the
//! library can be embedded anywhere a tokio runtime is available.

pub mod audio;
pub mod remote;
pub mod session;
