//! # Configuration Management
//!
//! Loads the server and live-session settings from several layers:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix
//! - A few well-known variables used by deployment platforms and API clients
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are read from TOML/env and written back as JSON
//! - **Nested structs**: one struct per concern (server, live session, audio)
//! - **Result<T, E>**: every loading step can fail and is propagated with `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY` / `API_KEY`
//! 2. `APP_*` variables, nested keys joined with a double underscore
//!    (`APP_LIVE__CONNECT_TIMEOUT_MS=5000` sets `live.connect_timeout_ms`)
//! 3. `config.toml`
//! 4. Defaults

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use live_voice::audio::MicConstraints;
use live_voice::remote::{self, ConnectParams, ConnectPolicy, Modality};
use live_voice::session::SessionSettings;

/// Placeholder shown instead of the API key whenever the config is exposed.
pub const REDACTED: &str = "********";

/// Main application configuration.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Serialize`/`Deserialize` let the `config` crate build
///   this struct from layered sources and let the HTTP layer return it as JSON
/// - **Clone**: handlers take a copy so they never hold the lock while working
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
}

/// Where the control surface listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote live-session settings.
///
/// ## Fields:
/// - `model` / `voice`: passed to the service in the setup message
/// - `api_key`: empty means "not configured"; the session then starts in the
///   `api_key_missing` error state instead of refusing to boot
/// - `initial_prompt`: empty means none
/// - `connect_timeout_ms`: 0 disables the handshake timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub api_key: String,
    pub endpoint: String,
    pub initial_prompt: String,
    pub connect_timeout_ms: u64,
    pub retry: RetryConfig,
}

/// Bounded retry for the remote handshake. One attempt disables retrying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Local audio settings.
///
/// ## Fields:
/// - `backend`: `"headless"` (null sink + silent microphone) or `"device"`
///   (sound card through cpal, needs the `device-audio` feature)
/// - `visualizer_interval_ms`: how often analyzer frames are computed and
///   pushed to `/ws/events`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub backend: String,
    pub visualizer_interval_ms: u64,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                model: remote::DEFAULT_MODEL.to_string(),
                voice: remote::DEFAULT_VOICE.to_string(),
                api_key: String::new(),
                endpoint: remote::gemini::DEFAULT_ENDPOINT.to_string(),
                initial_prompt: String::new(),
                connect_timeout_ms: 0,
                retry: RetryConfig {
                    max_attempts: 1,
                    base_delay_ms: 250,
                    max_delay_ms: 4_000,
                },
            },
            audio: AudioConfig {
                backend: "headless".to_string(),
                visualizer_interval_ms: 50, // 20 frames per second
                echo_cancellation: true,
                noise_suppression: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every layer, highest priority last.
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: each `add_source` stacks a layer on the previous ones
    /// - **set_override**: wins over every source, used for the platform variables
    /// - **try_deserialize**: turns the merged key/value tree back into `AppConfig`
    ///
    /// ## Why a double underscore:
    /// Field names such as `connect_timeout_ms` contain single underscores, so
    /// the nesting separator has to be something else.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model name cannot be empty"));
        }
        if self.live.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Live voice name cannot be empty"));
        }
        let endpoint = url::Url::parse(&self.live.endpoint)
            .map_err(|e| anyhow::anyhow!("Live endpoint '{}' is not a valid URL: {}", self.live.endpoint, e))?;
        if endpoint.scheme() != "ws" && endpoint.scheme() != "wss" {
            return Err(anyhow::anyhow!(
                "Live endpoint must be a ws:// or wss:// URL, got '{}'",
                self.live.endpoint
            ));
        }
        if self.live.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("Retry max_attempts must be at least 1"));
        }
        if self.live.retry.base_delay_ms > self.live.retry.max_delay_ms {
            return Err(anyhow::anyhow!("Retry base_delay_ms cannot exceed max_delay_ms"));
        }
        if self.audio.visualizer_interval_ms == 0 {
            return Err(anyhow::anyhow!("Visualizer interval must be greater than 0"));
        }
        match self.audio.backend.as_str() {
            "headless" | "device" => {}
            other => return Err(anyhow::anyhow!("Unknown audio backend '{}'", other)),
        }

        Ok(())
    }

    /// Apply a partial JSON update (runtime config changes).
    ///
    /// Only keys that are present are changed, e.g.
    /// `{"live": {"initial_prompt": "Be brief."}}`. The API key cannot be set
    /// this way.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            match live.get("initial_prompt") {
                Some(serde_json::Value::Null) => self.live.initial_prompt.clear(),
                Some(value) => {
                    if let Some(prompt) = value.as_str() {
                        self.live.initial_prompt = prompt.to_string();
                    }
                }
                None => {}
            }
            if let Some(timeout) = live.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.live.connect_timeout_ms = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(interval) = audio.get("visualizer_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.visualizer_interval_ms = interval;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Copy safe to hand out over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.live.api_key.is_empty() {
            copy.live.api_key = REDACTED.to_string();
        }
        copy
    }

    pub fn initial_prompt(&self) -> Option<String> {
        let prompt = self.live.initial_prompt.trim();
        (!prompt.is_empty()).then(|| prompt.to_string())
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: self.live.retry.max_attempts,
            base_delay: Duration::from_millis(self.live.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.live.retry.max_delay_ms),
            timeout: (self.live.connect_timeout_ms > 0).then(|| Duration::from_millis(self.live.connect_timeout_ms)),
        }
    }

    /// Everything the session needs from the configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect: ConnectParams {
                model: self.live.model.clone(),
                voice_name: self.live.voice.clone(),
                response_modalities: vec![Modality::Audio],
            },
            initial_prompt: self.initial_prompt(),
            connect_policy: self.connect_policy(),
            microphone: MicConstraints {
                echo_cancellation: self.audio.echo_cancellation,
                noise_suppression: self.audio.noise_suppression,
                ..MicConstraints::default()
            },
        }
    }

    pub fn visualizer_interval(&self) -> Duration {
        Duration::from_millis(self.audio.visualizer_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.live.model, "gemini-2.5-flash-preview-native-audio-dialog");
        assert_eq!(config.live.voice, "Orus");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.visualizer_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.backend = "alsa".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "ws://127.0.0.1:9000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "live": {"initial_prompt": "Be brief."}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.initial_prompt().as_deref(), Some("Be brief."));

        assert!(config.update_from_json(r#"{"live": {"initial_prompt": null}}"#).is_ok());
        assert_eq!(config.initial_prompt(), None);

        // Out of range port is rejected rather than truncated
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        assert_eq!(config.redacted().live.api_key, "");
        config.live.api_key = "secret".to_string();
        assert_eq!(config.redacted().live.api_key, REDACTED);
        assert_eq!(config.live.api_key, "secret");
    }

    #[test]
    fn test_session_settings_mapping() {
        let mut config = AppConfig::default();
        config.live.connect_timeout_ms = 1500;
        config.live.retry.max_attempts = 3;
        config.audio.echo_cancellation = false;

        let settings = config.session_settings();
        assert_eq!(settings.connect.voice_name, "Orus");
        assert_eq!(settings.connect.response_modalities, vec![Modality::Audio]);
        assert_eq!(settings.connect_policy.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(settings.connect_policy.max_attempts, 3);
        assert!(!settings.microphone.echo_cancellation);
        assert_eq!(settings.microphone.sample_rate, 16_000);
        assert_eq!(settings.initial_prompt, None);

        assert_eq!(AppConfig::default().connect_policy().timeout, None);
    }
}
