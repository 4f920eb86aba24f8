use config::{Config, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Language tags accepted by the XTTS family of models
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "es", "fr", "de", "it", "pt", "pl", "tr", "ru", "nl", "cs", "ar", "zh-cn", "ja", "hu",
    "ko", "hi",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Profile storage
    pub data_dir: String,
    pub canonical_sample_rate: u32,
    pub max_sample_mb: u64,
    // Synthesis engine
    pub synthesis_backend: String, // "xtts-http" or "coqui-cli"
    pub xtts_url: String,
    pub xtts_timeout_secs: u64,
    pub tts_binary: String,
    pub tts_model: String,
    pub tts_timeout_secs: u64,
    pub default_language: String,
    pub warm_on_start: bool,
    // Scheduler
    pub queue_wait_secs: u64,
    // Surfaces
    pub enable_dbus: bool,
    pub enable_http: bool,
    pub http_host: String,
    pub http_port: u16,
    // Voice loop
    pub enable_voice_loop: bool,
    pub capture_mode: String, // "vad" or "push_to_talk"
    pub active_profile: String,
    pub stop_phrases: Vec<String>,
    pub vad_speech_threshold: i16,
    pub vad_silence_threshold: i16,
    pub vad_silence_duration_ms: u64,
    pub vad_max_duration_ms: u64,
    // STT
    pub whisper_model_path: String,
    pub whisper_language: String,
    // Playback
    pub playback_volume: f32,
    pub playback_device: String, // empty = default sink
    // Feedback
    pub led_backend: String, // "log" or "sysfs"
    pub led_sysfs_prefix: String,
    // Responder
    pub responder: String, // "echo" or "ollama"
    pub ollama_url: String,
    pub ollama_model: String,
}

fn home() -> String {
    dirs::home_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

impl Settings {
    /// Load defaults, config files and `VOXCLONE_*` environment overrides.
    ///
    /// `explicit` is an extra file (from `--config`) that must exist.
    pub fn new(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Profile storage
            .set_default(
                "data_dir",
                format!("{}/.local/share/voxclone/voice_profiles", home()),
            )?
            .set_default("canonical_sample_rate", 22050)?
            .set_default("max_sample_mb", 100)?
            // Synthesis engine
            .set_default("synthesis_backend", "xtts-http")?
            .set_default("xtts_url", "http://127.0.0.1:8020")?
            .set_default("xtts_timeout_secs", 120)?
            .set_default("tts_binary", "tts")?
            .set_default("tts_model", "tts_models/multilingual/multi-dataset/xtts_v2")?
            .set_default("tts_timeout_secs", 300)?
            .set_default("default_language", "en")?
            .set_default("warm_on_start", true)?
            // Scheduler
            .set_default("queue_wait_secs", 180)?
            // Surfaces
            .set_default("enable_dbus", true)?
            .set_default("enable_http", true)?
            .set_default("http_host", "0.0.0.0")?
            .set_default("http_port", 5001)?
            // Voice loop
            .set_default("enable_voice_loop", false)?
            .set_default("capture_mode", "vad")?
            .set_default("active_profile", "")?
            .set_default("stop_phrases", vec!["stop listening", "goodbye"])?
            .set_default("vad_speech_threshold", 500)?
            .set_default("vad_silence_threshold", 400)?
            .set_default("vad_silence_duration_ms", 1500)?
            .set_default("vad_max_duration_ms", 15000)?
            // STT
            .set_default(
                "whisper_model_path",
                format!("{}/.cache/whisper/ggml-base.en.bin", home()),
            )?
            .set_default("whisper_language", "en")?
            // Playback
            .set_default("playback_volume", 1.0)?
            .set_default("playback_device", "")?
            // Feedback
            .set_default("led_backend", "log")?
            .set_default("led_sysfs_prefix", "/sys/class/leds/rgb:")?
            // Responder
            .set_default("responder", "echo")?
            .set_default("ollama_url", "http://localhost:11434")?
            .set_default("ollama_model", "llama3")?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Voxclone").required(false))
            .add_source(
                File::with_name(&format!("{}/.config/voxclone/Voxclone", home())).required(false),
            );

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Environment wins (e.g. VOXCLONE_HTTP_PORT)
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("VOXCLONE")
                    .list_separator(",")
                    .with_list_parse_key("stop_phrases")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.playback_volume) {
            return Err(Error::Config(format!(
                "Invalid playback_volume: {}. Must be between 0.0 and 1.0",
                self.playback_volume
            )));
        }
        if self.queue_wait_secs == 0 {
            return Err(Error::Config(
                "queue_wait_secs must be greater than 0".to_string(),
            ));
        }
        if self.canonical_sample_rate == 0 {
            return Err(Error::Config(
                "canonical_sample_rate must be greater than 0".to_string(),
            ));
        }
        if !matches!(self.synthesis_backend.as_str(), "xtts-http" | "coqui-cli") {
            return Err(Error::Config(format!(
                "Unknown synthesis_backend: {}",
                self.synthesis_backend
            )));
        }
        if !matches!(self.capture_mode.as_str(), "vad" | "push_to_talk") {
            return Err(Error::Config(format!(
                "Unknown capture_mode: {}",
                self.capture_mode
            )));
        }
        if !matches!(self.led_backend.as_str(), "log" | "sysfs") {
            return Err(Error::Config(format!(
                "Unknown led_backend: {}",
                self.led_backend
            )));
        }
        if !matches!(self.responder.as_str(), "echo" | "ollama") {
            return Err(Error::Config(format!(
                "Unknown responder: {}",
                self.responder
            )));
        }
        if !SUPPORTED_LANGUAGES.contains(&self.default_language.as_str()) {
            return Err(Error::Config(format!(
                "Unsupported default_language: {}",
                self.default_language
            )));
        }
        if self.vad_speech_threshold <= 0 || self.vad_silence_threshold <= 0 {
            return Err(Error::Config(
                "VAD thresholds must be positive".to_string(),
            ));
        }
        if self.vad_silence_threshold > self.vad_speech_threshold {
            return Err(Error::Config(
                "vad_silence_threshold must not exceed vad_speech_threshold".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_path(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => PathBuf::from(home()).join(rest),
            None => PathBuf::from(&self.data_dir),
        }
    }

    pub fn max_sample_bytes(&self) -> usize {
        (self.max_sample_mb as usize).saturating_mul(1024 * 1024)
    }
}
