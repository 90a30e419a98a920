//! Worker configuration: file + environment, validated before any session starts.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. `config/agent.toml` (or the path in `OPS_AGENT_CONFIG`), if present
//! 3. `OPS_*` environment variables, `__` between nested keys
//!    (e.g. `OPS_SESSION__LANGUAGE=ko-KR`, `OPS_TTS__VOICE=nova`)
//!
//! API keys fall back to `OPENAI_API_KEY` when not set explicitly.

use crate::error::{VoiceError, VoiceResult};
use crate::openai::DEFAULT_BASE_URL;
use crate::session::SessionConfig;
use crate::tts::OPENAI_VOICES;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Which capability implementations the worker wires up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Offline placeholders (no network)
    #[default]
    Placeholder,
    /// OpenAI-compatible HTTP APIs
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_stt_model")]
    pub model: String,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_stt_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Speaking rate; the default is slightly slower than normal speech
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_tts_model(),
            voice: default_voice(),
            speed: default_speed(),
        }
    }
}

/// Top-level worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// WebSocket listen address (default: 127.0.0.1:8765)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Concurrent sessions accepted before new rooms are refused (default: 32)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub stt: SttSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub tts: TtsSettings,

    #[serde(default)]
    pub session: SessionConfig,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_stt_model() -> String {
    "whisper-1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}
fn default_tts_model() -> String {
    "tts-1".to_string()
}
fn default_voice() -> String {
    "nova".to_string()
}
fn default_speed() -> f32 {
    0.9
}
fn default_listen_addr() -> String {
    "127.0.0.1:8765".to_string()
}
fn default_max_sessions() -> usize {
    32
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_sessions: default_max_sessions(),
            backend: BackendKind::default(),
            stt: SttSettings::default(),
            llm: LlmSettings::default(),
            tts: TtsSettings::default(),
            session: SessionConfig::default(),
        }
    }
}

const CONFIG_PATH_VAR: &str = "OPS_AGENT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/agent";

impl WorkerConfig {
    /// Load from the optional config file and `OPS_*` environment variables.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("OPS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::build(builder)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(toml: &str) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> VoiceResult<Self> {
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Fill unset API keys from `OPENAI_API_KEY`.
    pub fn resolve_credentials(&mut self) {
        let fallback = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty());
        self.apply_fallback_key(fallback);
    }

    fn apply_fallback_key(&mut self, fallback: Option<String>) {
        for key in [
            &mut self.stt.api_key,
            &mut self.llm.api_key,
            &mut self.tts.api_key,
        ] {
            if key.is_none() {
                key.clone_from(&fallback);
            }
        }
    }

    pub fn socket_addr(&self) -> VoiceResult<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| VoiceError::Config(format!("listen_addr {:?}: {}", self.listen_addr, e)))
    }

    /// Reject configurations no session could start with.
    pub fn validate(&self) -> VoiceResult<()> {
        self.socket_addr()?;
        if self.max_sessions == 0 {
            return Err(VoiceError::Config("max_sessions must be at least 1".to_string()));
        }
        self.session.validate()?;

        if self.backend == BackendKind::OpenAi {
            for (service, key) in [
                ("stt", &self.stt.api_key),
                ("llm", &self.llm.api_key),
                ("tts", &self.tts.api_key),
            ] {
                if key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                    return Err(VoiceError::Config(format!(
                        "{} api_key is required for the openai backend (set OPS_{}__API_KEY or OPENAI_API_KEY)",
                        service,
                        service.to_uppercase()
                    )));
                }
            }
            if !OPENAI_VOICES.contains(&self.tts.voice.as_str()) {
                return Err(VoiceError::UnsupportedVoice(self.tts.voice.clone()));
            }
            if !(0.25..=4.0).contains(&self.tts.speed) {
                return Err(VoiceError::Config(format!(
                    "tts.speed must be within 0.25..=4.0, got {}",
                    self.tts.speed
                )));
            }
        }
        Ok(())
    }
}
