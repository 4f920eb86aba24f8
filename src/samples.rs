//! Sample Asset Manager: validates and normalizes uploaded reference audio
//! before handing it to the profile store.

use chrono::Utc;
use deunicode::deunicode;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::audio;
use crate::ear::{self, CaptureDevice};
use crate::error::{Error, Result};
use crate::profiles::{PreparedSample, Profile, ProfileStore, SampleAsset};

/// Longest reference recording taken in one go
pub const MAX_RECORDING: Duration = Duration::from_secs(60);

/// Raw upload as received from a caller
#[derive(Debug, Clone)]
pub struct SampleUpload {
    pub bytes: Vec<u8>,
    pub hint_name: String,
}

pub struct SampleManager {
    store: Arc<ProfileStore>,
    canonical_rate: u32,
    max_bytes: usize,
}

impl SampleManager {
    pub fn new(store: Arc<ProfileStore>, canonical_rate: u32, max_bytes: usize) -> Self {
        Self {
            store,
            canonical_rate,
            max_bytes,
        }
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    /// Decode, downmix and resample an upload without touching the disk
    pub fn prepare(&self, bytes: &[u8], hint_name: &str) -> Result<PreparedSample> {
        if bytes.is_empty() {
            return Err(Error::Validation("audio upload is empty".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(Error::Validation(format!(
                "audio upload is {} bytes, limit is {}",
                bytes.len(),
                self.max_bytes
            )));
        }

        let decoded = audio::decode(bytes)?;
        if decoded.frames() == 0 {
            return Err(Error::UnsupportedFormat(
                "audio contains no samples".to_string(),
            ));
        }
        let normalized = audio::normalize(&decoded, self.canonical_rate);
        let wav = audio::encode_wav(&normalized)?;

        Ok(PreparedSample {
            filename: sanitize_filename(hint_name),
            wav,
            duration_secs: normalized.duration_secs(),
            sample_rate: normalized.sample_rate,
            channels: normalized.channels,
        })
    }

    /// Create a profile with zero or more initial samples. Every upload is
    /// validated before anything is written.
    pub fn create_profile(
        &self,
        name: &str,
        assistant_prompt: Option<String>,
        uploads: Vec<SampleUpload>,
    ) -> Result<Profile> {
        let prepared = uploads
            .iter()
            .map(|u| self.prepare(&u.bytes, &u.hint_name))
            .collect::<Result<Vec<_>>>()?;
        self.store.create(name, assistant_prompt, prepared)
    }

    /// Add one reference sample to a profile and return its asset reference
    pub fn add(&self, profile_id: &str, raw_audio: &[u8], hint_name: &str) -> Result<SampleAsset> {
        // Fail fast on a missing profile before decoding a large upload
        if !self.store.contains(profile_id) {
            return Err(Error::NotFound(format!("profile {}", profile_id)));
        }
        let prepared = self.prepare(raw_audio, hint_name)?;
        self.store.attach_sample(profile_id, prepared)
    }

    /// Record `duration` from a capture device and add it as a sample
    pub fn record(
        &self,
        profile_id: &str,
        device: &mut dyn CaptureDevice,
        duration: Duration,
    ) -> Result<SampleAsset> {
        if duration.is_zero() || duration > MAX_RECORDING {
            return Err(Error::Validation(format!(
                "recording length must be between 0 and {}s",
                MAX_RECORDING.as_secs()
            )));
        }
        if !self.store.contains(profile_id) {
            return Err(Error::NotFound(format!("profile {}", profile_id)));
        }

        tracing::info!(profile_id = %profile_id, secs = duration.as_secs_f32(), "recording reference sample");
        let wav = ear::record(device, duration)?.to_wav()?;
        let hint = format!("reference_{}.wav", Utc::now().timestamp());
        self.add(profile_id, &wav, &hint)
    }

    /// Remove a sample. Removing an asset the profile does not list succeeds.
    pub fn remove(&self, profile_id: &str, asset_ref: &str) -> Result<()> {
        self.store.detach_sample(profile_id, asset_ref)
    }
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_-]+").expect("static regex"))
}

/// ASCII, lowercase, `[a-z0-9_-]` stem with a `.wav` extension
pub fn sanitize_filename(hint: &str) -> String {
    let base = hint.rsplit(['/', '\\']).next().unwrap_or(hint);
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base,
    };
    let ascii = deunicode(stem).to_lowercase();
    let cleaned = unsafe_chars().replace_all(&ascii, "_");
    let cleaned = cleaned.trim_matches('_');

    if cleaned.is_empty() {
        "sample.wav".to_string()
    } else {
        format!("{}.wav", cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_paths_and_unicode() {
        assert_eq!(sanitize_filename("a.wav"), "a.wav");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd.wav");
        assert_eq!(sanitize_filename("Grüße Oma.MP3"), "grusse_oma.wav");
        assert_eq!(sanitize_filename("C:\\Users\\me\\take 1.flac"), "take_1.wav");
        assert_eq!(sanitize_filename("..."), "sample.wav");
        assert_eq!(sanitize_filename(""), "sample.wav");
    }

    fn manager() -> (tempfile::TempDir, SampleManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::open(dir.path()).unwrap());
        (dir, SampleManager::new(store, 22050, 1024 * 1024))
    }

    use crate::ear::MockCaptureDevice;

    fn microphone(rate: u32) -> MockCaptureDevice {
        let mut device = MockCaptureDevice::new();
        device.expect_sample_rate().return_const(rate);
        device.expect_start().times(1).returning(|| Ok(()));
        device.expect_stop().times(1).return_const(());
        device
            .expect_read_chunk()
            .returning(|| Ok(Some(vec![1200i16; 160])));
        device
    }

    #[test]
    fn recording_lands_as_a_canonical_sample() {
        let (_dir, samples) = manager();
        let profile = samples.create_profile("Mic", None, Vec::new()).unwrap();

        let mut device = microphone(16000);
        let asset = samples
            .record(&profile.profile_id, &mut device, Duration::from_millis(500))
            .unwrap();

        assert!(asset.filename.starts_with("reference_"));
        assert!(asset.filename.ends_with(".wav"));
        let stored = samples.store().get(&profile.profile_id).unwrap();
        assert_eq!(stored.sample_count(), 1);

        let paths = samples.store().sample_paths(&stored);
        let bytes = std::fs::read(&paths[0]).unwrap();
        let decoded = audio::decode(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.channels, 1);
        assert!((decoded.duration_secs() - 0.5).abs() < 0.01);
    }

    #[test]
    fn recording_checks_length_and_profile_before_capturing() {
        let (_dir, samples) = manager();
        let profile = samples.create_profile("Mic", None, Vec::new()).unwrap();

        let mut idle = MockCaptureDevice::new();
        idle.expect_start().never();
        idle.expect_sample_rate().return_const(16000u32);

        assert!(matches!(
            samples.record(&profile.profile_id, &mut idle, Duration::ZERO),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            samples.record(&profile.profile_id, &mut idle, Duration::from_secs(600)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            samples.record("profile_missing", &mut idle, Duration::from_secs(1)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn failed_recording_leaves_profile_untouched() {
        let (_dir, samples) = manager();
        let profile = samples.create_profile("Mic", None, Vec::new()).unwrap();

        let mut device = MockCaptureDevice::new();
        device.expect_sample_rate().return_const(16000u32);
        device.expect_start().returning(|| Ok(()));
        device.expect_stop().return_const(());
        device
            .expect_read_chunk()
            .returning(|| Err(Error::Capture("unplugged".into())));

        assert!(matches!(
            samples.record(&profile.profile_id, &mut device, Duration::from_secs(1)),
            Err(Error::Capture(_))
        ));
        assert_eq!(samples.store().get(&profile.profile_id).unwrap().sample_count(), 0);
    }
}
