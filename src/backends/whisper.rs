//! Native Whisper transcriber using whisper.cpp via whisper-rs bindings
//!
//! The model is loaded on first use and stays resident in the transcriber.

use std::sync::{Mutex, OnceLock};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::Transcriber;
use crate::audio;
use crate::error::{Error, Result};

const WHISPER_RATE: u32 = 16000;

pub struct WhisperBackend {
    model_path: String,
    language: String,
    ctx: OnceLock<Mutex<WhisperContext>>,
}

impl WhisperBackend {
    pub fn new(model_path: &str, language: &str) -> Self {
        Self {
            model_path: model_path.to_string(),
            language: language.to_string(),
            ctx: OnceLock::new(),
        }
    }

    /// Get or initialize the whisper context (lazy-loaded, stays in memory)
    fn context(&self) -> Result<&Mutex<WhisperContext>> {
        if let Some(ctx) = self.ctx.get() {
            return Ok(ctx);
        }

        // Expand ~ to home directory
        let expanded_path = match self.model_path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| ".".into())
                .join(rest)
                .to_string_lossy()
                .into_owned(),
            None => self.model_path.clone(),
        };

        tracing::info!(path = %expanded_path, "loading Whisper model");
        let ctx = WhisperContext::new_with_params(&expanded_path, WhisperContextParameters::default())
            .map_err(|e| Error::Recognition(format!("Failed to load Whisper model: {:?}", e)))?;
        tracing::info!("Whisper model loaded");

        // A concurrent first call may have won the race; either context is fine
        Ok(self.ctx.get_or_init(|| Mutex::new(ctx)))
    }

    /// Convert WAV bytes to f32 mono 16kHz
    fn load_audio(&self, wav: &[u8]) -> Result<Vec<f32>> {
        let decoded = audio::decode(wav).map_err(|e| Error::Recognition(e.to_string()))?;
        Ok(audio::normalize(&decoded, WHISPER_RATE).samples)
    }
}

impl Transcriber for WhisperBackend {
    fn transcribe(&self, wav: &[u8]) -> Result<String> {
        let start = std::time::Instant::now();
        let audio_data = self.load_audio(wav)?;
        if audio_data.is_empty() {
            return Ok(String::new());
        }

        let ctx = self.context()?;
        let ctx_guard = ctx
            .lock()
            .map_err(|_| Error::Recognition("Whisper context lock poisoned".to_string()))?;

        let mut state = ctx_guard
            .create_state()
            .map_err(|e| Error::Recognition(format!("Failed to create state: {:?}", e)))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        // Empty string = auto-detect
        if !self.language.is_empty() && self.language != "auto" {
            params.set_language(Some(&self.language));
        }

        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_single_segment(true);

        state
            .full(params, &audio_data)
            .map_err(|e| Error::Recognition(format!("Transcription failed: {:?}", e)))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            if let Ok(segment_text) = segment.to_str() {
                text.push_str(segment_text);
                text.push(' ');
            }
        }

        let result = clean_transcript(&text);
        tracing::debug!(text = %result, elapsed = ?start.elapsed(), "Whisper transcribed");
        Ok(result)
    }
}

/// Whisper marks silence and noise with bracketed tags; they are not speech
fn clean_transcript(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|w| !(w.starts_with('[') && w.ends_with(']')) && !(w.starts_with('(') && w.ends_with(')')))
        .collect::<Vec<_>>()
        .join(" ")
}
