//! Shared handles behind the D-Bus and HTTP adapters.
//!
//! Both surfaces translate their requests into the calls below and nothing
//! else; no adapter touches the registry or the engine directly.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::ear::{CaptureFactory, PushToTalkHandle};
use crate::engine::PlaybackDevice;
use crate::error::{Error, Result};
use crate::gateway::{EngineStatus, SynthesisGateway};
use crate::profiles::{ProfileStore, SampleAsset};
use crate::samples::SampleManager;
use crate::scheduler::{GenerationRequest, GenerationScheduler};
use crate::session::{Session, SessionMachine};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ProfileStore>,
    pub samples: Arc<SampleManager>,
    pub gateway: Arc<SynthesisGateway>,
    pub scheduler: Arc<GenerationScheduler>,
    pub session: Arc<SessionMachine>,
    pub playback: Option<Arc<dyn PlaybackDevice>>,
    pub push_to_talk: Option<PushToTalkHandle>,
    /// Opens the microphone for reference recordings
    pub capture: Option<CaptureFactory>,
    pub default_language: String,
}

/// Reference recording length when the caller names none
pub const DEFAULT_RECORDING_SECS: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub backend: &'static str,
    pub engine: EngineStatus,
    pub queue_depth: usize,
    pub profiles: usize,
    pub session: Session,
}

/// Run blocking work (file I/O, decoding, model loads) off the async workers
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(format!("blocking task failed: {}", e)))?
}

impl AppState {
    pub fn status(&self) -> StatusReport {
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            backend: self.gateway.backend_id(),
            engine: self.gateway.status(),
            queue_depth: self.scheduler.pending(),
            profiles: self.store.list().len(),
            session: self.session.snapshot(),
        }
    }

    /// Generate audio for a profile given by id or name.
    /// An empty language selects the configured default.
    pub async fn generate(&self, profile: &str, text: &str, language: &str) -> Result<Vec<u8>> {
        let profile = self.store.find(profile)?;
        let language = if language.trim().is_empty() {
            self.default_language.as_str()
        } else {
            language
        };
        self.scheduler
            .submit(GenerationRequest::new(&profile.profile_id, text, language))
            .await
    }

    /// Generate, then play on this machine
    pub async fn speak(
        &self,
        profile: &str,
        text: &str,
        language: &str,
        volume: f32,
        device: Option<String>,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::Validation(format!(
                "volume {} outside 0.0..=1.0",
                volume
            )));
        }
        let playback = self
            .playback
            .clone()
            .ok_or_else(|| Error::Playback("no playback device configured".to_string()))?;

        let audio = self.generate(profile, text, language).await?;
        blocking(move || playback.play(&audio, volume, device.as_deref())).await
    }

    /// Record a reference sample from this machine's microphone
    pub async fn record_sample(&self, profile_id: &str, seconds: f64) -> Result<SampleAsset> {
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|_| Error::Validation(format!("invalid recording length {}", seconds)))?;
        let open = self
            .capture
            .clone()
            .ok_or_else(|| Error::Capture("no capture device configured".to_string()))?;

        let samples = self.samples.clone();
        let profile_id = profile_id.to_string();
        blocking(move || {
            let mut device = open()?;
            samples.record(&profile_id, device.as_mut(), duration)
        })
        .await
    }

    pub async fn warm_engine(&self) -> Result<EngineStatus> {
        let gateway = self.gateway.clone();
        blocking(move || gateway.warm()).await?;
        Ok(self.gateway.status())
    }

    pub async fn reload_engine(&self) -> Result<EngineStatus> {
        let gateway = self.gateway.clone();
        blocking(move || gateway.reload()).await?;
        Ok(self.gateway.status())
    }
}
