//! Durable registry of voice profiles and the sample files they own.
//!
//! The registry is one JSON document. Every mutation runs under a single
//! writer lock, writes the next document to a temporary file next to the
//! registry and renames it into place, then publishes the new snapshot.
//! Readers clone the last committed snapshot and never wait on a writer's I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{Error, Result};

const REGISTRY_FILE: &str = "profiles.json";
pub(crate) const STAGING_PREFIX: &str = ".staging-";

/// One normalized reference recording owned by a profile
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SampleAsset {
    pub filename: String,
    pub duration_secs: f32,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Sample ready to be written: already decoded and normalized
#[derive(Debug, Clone)]
pub struct PreparedSample {
    pub filename: String,
    pub wav: Vec<u8>,
    pub duration_secs: f32,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Profile {
    pub profile_id: String,
    pub name: String,
    #[serde(default)]
    pub samples: Vec<SampleAsset>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_prompt: Option<String>,
}

impl Profile {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn has_sample(&self, filename: &str) -> bool {
        self.samples.iter().any(|s| s.filename == filename)
    }
}

/// Full `profile_id -> Profile` mapping. Ordered so listings are deterministic.
pub type Registry = BTreeMap<String, Profile>;

pub struct ProfileStore {
    root: PathBuf,
    registry_path: PathBuf,
    committed: RwLock<Arc<Registry>>,
    writer: Mutex<()>,
}

impl ProfileStore {
    /// Open (or create) the store rooted at `root` and reconcile disk state
    /// left behind by an interrupted operation.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let registry_path = root.join(REGISTRY_FILE);

        let registry: Registry = if registry_path.exists() {
            let content = fs::read_to_string(&registry_path)?;
            serde_json::from_str(&content)?
        } else {
            Registry::new()
        };

        let store = Self {
            root,
            registry_path,
            committed: RwLock::new(Arc::new(registry)),
            writer: Mutex::new(()),
        };
        store.reconcile()?;

        tracing::info!(
            root = %store.root.display(),
            profiles = store.snapshot().len(),
            "profile store opened"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage area for one profile, named after its id
    pub fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.root.join(profile_id)
    }

    fn snapshot(&self) -> Arc<Registry> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write `next` atomically and publish it to readers
    fn commit(&self, next: Registry) -> Result<()> {
        let content = serde_json::to_vec_pretty(&next)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".profiles-")
            .suffix(".tmp")
            .tempfile_in(&self.root)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.registry_path)?;

        *self.committed.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(())
    }

    pub fn get(&self, profile_id: &str) -> Result<Profile> {
        self.snapshot()
            .get(profile_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))
    }

    pub fn contains(&self, profile_id: &str) -> bool {
        self.snapshot().contains_key(profile_id)
    }

    /// Resolve by id first, then by exact name
    pub fn find(&self, key: &str) -> Result<Profile> {
        let registry = self.snapshot();
        registry
            .get(key)
            .or_else(|| registry.values().find(|p| p.name == key))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("profile {}", key)))
    }

    pub fn list(&self) -> Vec<Profile> {
        self.snapshot().values().cloned().collect()
    }

    /// Absolute paths of the profile's samples that exist on disk, in order
    pub fn sample_paths(&self, profile: &Profile) -> Vec<PathBuf> {
        let dir = self.profile_dir(&profile.profile_id);
        profile
            .samples
            .iter()
            .map(|s| dir.join(&s.filename))
            .filter(|p| p.is_file())
            .collect()
    }

    /// Create a profile and write its initial samples. The profile, its
    /// prompt and its samples land in a single registry commit.
    ///
    /// Nothing is registered unless every sample was written.
    pub fn create(
        &self,
        name: &str,
        assistant_prompt: Option<String>,
        initial_samples: Vec<PreparedSample>,
    ) -> Result<Profile> {
        let name = validate_name(name)?;

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();

        let profile_id = new_profile_id();
        let dir = self.profile_dir(&profile_id);
        fs::create_dir_all(&dir)?;

        let mut profile = Profile {
            profile_id: profile_id.clone(),
            name,
            samples: Vec::with_capacity(initial_samples.len()),
            created_at: Utc::now(),
            assistant_prompt: clean_prompt(assistant_prompt),
        };

        let written = initial_samples.into_iter().try_for_each(|sample| {
            let asset = write_sample_file(&dir, &profile, sample)?;
            profile.samples.push(asset);
            Ok::<_, Error>(())
        });

        let result = written.and_then(|()| {
            next.insert(profile_id.clone(), profile.clone());
            self.commit(next)
        });

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                tracing::warn!(profile_id = %profile_id, error = %cleanup, "cleanup after failed create");
            }
            return Err(e);
        }

        tracing::info!(profile_id = %profile.profile_id, name = %profile.name, samples = profile.sample_count(), "profile created");
        Ok(profile)
    }

    pub fn rename(&self, profile_id: &str, new_name: &str) -> Result<Profile> {
        let new_name = validate_name(new_name)?;
        self.update(profile_id, |profile| {
            profile.name = new_name;
            Ok(())
        })
    }

    /// Set or clear (empty / `None`) the assistant directive
    pub fn update_prompt(&self, profile_id: &str, prompt: Option<String>) -> Result<Profile> {
        let prompt = clean_prompt(prompt);
        self.update(profile_id, |profile| {
            profile.assistant_prompt = prompt;
            Ok(())
        })
    }

    fn update<F>(&self, profile_id: &str, apply: F) -> Result<Profile>
    where
        F: FnOnce(&mut Profile) -> Result<()>,
    {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let profile = next
            .get_mut(profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;
        apply(profile)?;
        let updated = profile.clone();
        self.commit(next)?;
        Ok(updated)
    }

    /// Remove a profile and every asset it owns.
    ///
    /// Assets go first. If any cannot be removed the registry entry stays,
    /// listing exactly the assets still on disk, and `PartialDelete` is
    /// returned so the caller can retry.
    pub fn delete(&self, profile_id: &str) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let profile = next
            .get(profile_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;

        let dir = self.profile_dir(profile_id);
        let mut failures = Vec::new();
        let mut remaining = Vec::new();
        for sample in &profile.samples {
            match remove_if_present(&dir.join(&sample.filename)) {
                Ok(()) => {}
                Err(e) => {
                    failures.push(format!("{}: {}", sample.filename, e));
                    remaining.push(sample.clone());
                }
            }
        }

        if failures.is_empty() {
            if let Err(e) = remove_dir_if_present(&dir) {
                failures.push(format!("{}: {}", dir.display(), e));
            }
        }

        if !failures.is_empty() {
            if let Some(entry) = next.get_mut(profile_id) {
                entry.samples = remaining;
            }
            self.commit(next)?;
            tracing::warn!(profile_id, failures = failures.len(), "profile delete incomplete");
            return Err(Error::PartialDelete {
                profile_id: profile_id.to_string(),
                reason: failures.join("; "),
            });
        }

        next.remove(profile_id);
        self.commit(next)?;
        tracing::info!(profile_id, "profile deleted");
        Ok(())
    }

    /// Write one prepared sample under the profile and register it.
    ///
    /// The file is staged under a temporary name and only takes its final,
    /// collision-free name right before the registry commit; if the commit
    /// fails the file is removed again.
    pub(crate) fn attach_sample(
        &self,
        profile_id: &str,
        sample: PreparedSample,
    ) -> Result<SampleAsset> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let profile = next
            .get_mut(profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;

        let dir = self.profile_dir(profile_id);
        fs::create_dir_all(&dir)?;
        let asset = write_sample_file(&dir, profile, sample)?;
        profile.samples.push(asset.clone());

        if let Err(e) = self.commit(next) {
            if let Err(cleanup) = remove_if_present(&dir.join(&asset.filename)) {
                tracing::warn!(profile_id, file = %asset.filename, error = %cleanup, "could not remove unregistered sample");
            }
            return Err(e);
        }

        tracing::info!(profile_id, file = %asset.filename, duration = asset.duration_secs, "sample added");
        Ok(asset)
    }

    /// Unregister and delete one sample. Unknown filenames are a no-op.
    ///
    /// The file is first moved aside to a staging name so a failed registry
    /// commit can put it back.
    pub(crate) fn detach_sample(&self, profile_id: &str, filename: &str) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let profile = next
            .get_mut(profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;

        let Some(index) = profile.samples.iter().position(|s| s.filename == filename) else {
            tracing::debug!(profile_id, file = filename, "sample not listed, nothing to remove");
            return Ok(());
        };
        profile.samples.remove(index);

        let dir = self.profile_dir(profile_id);
        let path = dir.join(filename);
        let parked = dir.join(format!("{}{}", STAGING_PREFIX, filename));
        let moved = match fs::rename(&path, &parked) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.commit(next) {
            if moved {
                if let Err(restore) = fs::rename(&parked, &path) {
                    tracing::warn!(profile_id, file = filename, error = %restore, "could not restore sample");
                }
            }
            return Err(e);
        }

        if moved {
            if let Err(e) = fs::remove_file(&parked) {
                // Startup reconciliation sweeps staging files
                tracing::warn!(profile_id, file = filename, error = %e, "staged sample left on disk");
            }
        }
        tracing::info!(profile_id, file = filename, "sample removed");
        Ok(())
    }

    /// Restore the invariant that files on disk and listed samples agree.
    fn reconcile(&self) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let mut changed = false;

        for entry in fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if !next.contains_key(&name) {
                    tracing::warn!(dir = %path.display(), "removing directory of unknown profile");
                    fs::remove_dir_all(&path)?;
                }
            } else if name.starts_with(".profiles-") && name.ends_with(".tmp") {
                fs::remove_file(&path)?;
            }
        }

        for profile in next.values_mut() {
            let dir = self.profile_dir(&profile.profile_id);
            fs::create_dir_all(&dir)?;

            let before = profile.samples.len();
            profile.samples.retain(|s| dir.join(&s.filename).is_file());
            if profile.samples.len() != before {
                tracing::warn!(
                    profile_id = %profile.profile_id,
                    pruned = before - profile.samples.len(),
                    "pruned samples missing on disk"
                );
                changed = true;
            }

            for entry in fs::read_dir(&dir)?.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !profile.has_sample(&name) {
                    tracing::warn!(profile_id = %profile.profile_id, file = %name, "removing orphaned file");
                    let path = entry.path();
                    if path.is_dir() {
                        fs::remove_dir_all(&path)?;
                    } else {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }

        if changed {
            self.commit(next)?;
        }
        Ok(())
    }
}

/// Blank prompts are stored as none
fn clean_prompt(prompt: Option<String>) -> Option<String> {
    prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("profile name must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Time-based id with a random suffix so two creations in the same second
/// cannot collide
fn new_profile_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "profile_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Pick a filename not used by the profile nor present on disk
fn unique_filename(dir: &Path, profile: &Profile, wanted: &str) -> String {
    let (stem, ext) = match wanted.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{}", ext)),
        _ => (wanted.to_string(), String::new()),
    };
    let taken = |candidate: &str| profile.has_sample(candidate) || dir.join(candidate).exists();

    if !taken(wanted) {
        return wanted.to_string();
    }
    (2u32..)
        .map(|n| format!("{}_{}{}", stem, n, ext))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| format!("{}_{}{}", stem, uuid::Uuid::new_v4().simple(), ext))
}

fn write_sample_file(dir: &Path, profile: &Profile, sample: PreparedSample) -> Result<SampleAsset> {
    let filename = unique_filename(dir, profile, &sample.filename);

    let mut staged = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    staged.write_all(&sample.wav)?;
    staged.as_file().sync_all()?;
    staged.persist_noclobber(dir.join(&filename))?;

    Ok(SampleAsset {
        filename,
        duration_secs: sample.duration_secs,
        sample_rate: sample.sample_rate,
        channels: sample.channels,
    })
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
