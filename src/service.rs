use std::path::PathBuf;
use zbus::interface;

use crate::app::{blocking, AppState};
use crate::engine;
use crate::error::Error;
use crate::profiles::SampleAsset;
use crate::samples::SampleUpload;

pub const BUS_NAME: &str = "org.voxclone.Service";
pub const OBJECT_PATH: &str = "/org/voxclone/Service";

pub struct VoxcloneService {
    pub app: AppState,
}

/// `kind: message`, inside the closest standard D-Bus error
fn to_fdo(e: Error) -> zbus::fdo::Error {
    let msg = format!("{}: {}", e.kind(), e);
    match e {
        Error::NotFound(_) => zbus::fdo::Error::FileNotFound(msg),
        Error::Validation(_) | Error::UnsupportedFormat(_) => zbus::fdo::Error::InvalidArgs(msg),
        _ => zbus::fdo::Error::Failed(msg),
    }
}

fn sample_tuple(s: &SampleAsset) -> (String, f64, u32, u32) {
    (
        s.filename.clone(),
        s.duration_secs as f64,
        s.sample_rate,
        s.channels as u32,
    )
}

fn read_upload(path: &str) -> Result<SampleUpload, Error> {
    let path = PathBuf::from(path);
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::Validation(format!("cannot read {}: {}", path.display(), e)))?;
    let hint_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(SampleUpload { bytes, hint_name })
}

#[interface(name = "org.voxclone.Service")]
impl VoxcloneService {
    #[zbus(name = "Ping")]
    async fn ping(&self) -> String {
        "pong".to_string()
    }

    #[zbus(name = "GetVersion")]
    async fn get_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// (profile_id, name, sample_count, created_at)
    #[zbus(name = "ListProfiles")]
    async fn list_profiles(&self) -> Vec<(String, String, u32, String)> {
        self.app
            .store
            .list()
            .into_iter()
            .map(|p| {
                let count = p.sample_count() as u32;
                let created = p.created_at.to_rfc3339();
                (p.profile_id, p.name, count, created)
            })
            .collect()
    }

    /// Full profile document as JSON
    #[zbus(name = "GetProfile")]
    async fn get_profile(&self, profile: String) -> zbus::fdo::Result<String> {
        let profile = self.app.store.find(&profile).map_err(to_fdo)?;
        serde_json::to_string(&profile).map_err(|e| to_fdo(e.into()))
    }

    /// Create a profile from zero or more audio files on this machine
    #[zbus(name = "CreateProfile")]
    async fn create_profile(&self, name: String, sample_paths: Vec<String>) -> zbus::fdo::Result<String> {
        let samples = self.app.samples.clone();
        let profile = blocking(move || {
            let uploads = sample_paths
                .iter()
                .map(|p| read_upload(p))
                .collect::<Result<Vec<_>, _>>()?;
            samples.create_profile(&name, None, uploads)
        })
        .await
        .map_err(to_fdo)?;

        tracing::info!(profile_id = %profile.profile_id, samples = profile.sample_count(), "profile created over D-Bus");
        Ok(profile.profile_id)
    }

    #[zbus(name = "RenameProfile")]
    async fn rename_profile(&self, profile_id: String, name: String) -> zbus::fdo::Result<()> {
        let store = self.app.store.clone();
        blocking(move || store.rename(&profile_id, &name).map(|_| ()))
            .await
            .map_err(to_fdo)
    }

    /// An empty prompt clears it
    #[zbus(name = "SetPrompt")]
    async fn set_prompt(&self, profile_id: String, prompt: String) -> zbus::fdo::Result<()> {
        let store = self.app.store.clone();
        blocking(move || store.update_prompt(&profile_id, Some(prompt)).map(|_| ()))
            .await
            .map_err(to_fdo)
    }

    #[zbus(name = "DeleteProfile")]
    async fn delete_profile(&self, profile_id: String) -> zbus::fdo::Result<()> {
        let store = self.app.store.clone();
        blocking(move || store.delete(&profile_id))
            .await
            .map_err(to_fdo)
    }

    /// Returns the stored filename
    #[zbus(name = "AddSample")]
    async fn add_sample(&self, profile_id: String, path: String) -> zbus::fdo::Result<String> {
        let samples = self.app.samples.clone();
        blocking(move || {
            let upload = read_upload(&path)?;
            samples.add(&profile_id, &upload.bytes, &upload.hint_name)
        })
        .await
        .map(|asset| asset.filename)
        .map_err(to_fdo)
    }

    /// Record from the local microphone; returns the stored filename
    #[zbus(name = "RecordSample")]
    async fn record_sample(&self, profile_id: String, seconds: f64) -> zbus::fdo::Result<String> {
        self.app
            .record_sample(&profile_id, seconds)
            .await
            .map(|asset| asset.filename)
            .map_err(to_fdo)
    }

    #[zbus(name = "RemoveSample")]
    async fn remove_sample(&self, profile_id: String, filename: String) -> zbus::fdo::Result<()> {
        let samples = self.app.samples.clone();
        blocking(move || samples.remove(&profile_id, &filename))
            .await
            .map_err(to_fdo)
    }

    /// (filename, duration_secs, sample_rate, channels)
    #[zbus(name = "ListSamples")]
    async fn list_samples(&self, profile: String) -> zbus::fdo::Result<Vec<(String, f64, u32, u32)>> {
        let profile = self.app.store.find(&profile).map_err(to_fdo)?;
        Ok(profile.samples.iter().map(sample_tuple).collect())
    }

    /// Generate into `output_path` (a temp file when empty) and return the path
    #[zbus(name = "Generate")]
    async fn generate(
        &self,
        profile: String,
        text: String,
        language: String,
        output_path: String,
    ) -> zbus::fdo::Result<String> {
        let audio = self
            .app
            .generate(&profile, &text, &language)
            .await
            .map_err(to_fdo)?;

        let path = if output_path.is_empty() {
            std::env::temp_dir().join(format!("voxclone-{}.wav", uuid::Uuid::new_v4().simple()))
        } else {
            PathBuf::from(output_path)
        };
        let written = path.clone();
        blocking(move || std::fs::write(&written, audio).map_err(Error::from))
            .await
            .map_err(to_fdo)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Generate and play on this machine. An empty device uses the default.
    #[zbus(name = "Speak")]
    async fn speak(
        &self,
        profile: String,
        text: String,
        language: String,
        volume: f64,
        device: String,
    ) -> zbus::fdo::Result<()> {
        let device = (!device.is_empty()).then_some(device);
        self.app
            .speak(&profile, &text, &language, volume as f32, device)
            .await
            .map_err(to_fdo)
    }

    #[zbus(name = "ListOutputDevices")]
    async fn list_output_devices(&self) -> zbus::fdo::Result<Vec<String>> {
        blocking(|| Ok(engine::output_device_names()))
            .await
            .map_err(to_fdo)
    }

    /// (status, failure detail, backend id)
    #[zbus(name = "EngineStatus")]
    async fn engine_status(&self) -> (String, String, String) {
        let status = self.app.gateway.status();
        let detail = match &status {
            crate::gateway::EngineStatus::Failed(reason) => reason.clone(),
            _ => String::new(),
        };
        (
            status.label().to_string(),
            detail,
            self.app.gateway.backend_id().to_string(),
        )
    }

    #[zbus(name = "WarmEngine")]
    async fn warm_engine(&self) -> zbus::fdo::Result<String> {
        let status = self.app.warm_engine().await.map_err(to_fdo)?;
        Ok(status.label().to_string())
    }

    #[zbus(name = "ReloadEngine")]
    async fn reload_engine(&self) -> zbus::fdo::Result<String> {
        let status = self.app.reload_engine().await.map_err(to_fdo)?;
        Ok(status.label().to_string())
    }

    #[zbus(name = "QueueDepth")]
    async fn queue_depth(&self) -> u32 {
        self.app.scheduler.pending() as u32
    }

    /// (state, error detail, completed cycles)
    #[zbus(name = "GetSessionState")]
    async fn get_session_state(&self) -> (String, String, u64) {
        let session = self.app.session.snapshot();
        (
            session.state.as_str().to_string(),
            session.error.unwrap_or_default(),
            session.cycle,
        )
    }

    #[zbus(name = "GetStatus")]
    async fn get_status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.app.status()).map_err(|e| to_fdo(e.into()))
    }

    /// Push-to-talk press; false when the voice loop is not in that mode
    #[zbus(name = "StartListening")]
    async fn start_listening(&self) -> bool {
        self.app.push_to_talk.as_ref().is_some_and(|h| h.press())
    }

    #[zbus(name = "StopListening")]
    async fn stop_listening(&self) -> bool {
        self.app.push_to_talk.as_ref().is_some_and(|h| h.release())
    }
}
