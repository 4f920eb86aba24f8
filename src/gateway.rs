//! Synthesis Engine Gateway: owns the one loaded voice-cloning model.
//!
//! The model loads lazily on first use (or eagerly through `warm`) and stays
//! resident. A failed load is remembered and every later call fails fast with
//! `EngineUnavailable` until `reload` is requested.

use serde::Serialize;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Instant;

use crate::backends::{SynthesisBackend, SynthesisRequest};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum EngineStatus {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

impl EngineStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct SynthesisGateway {
    backend: Mutex<Box<dyn SynthesisBackend>>,
    // Kept apart from the backend lock so status() never waits on inference
    status: RwLock<EngineStatus>,
    backend_id: &'static str,
}

impl SynthesisGateway {
    pub fn new(backend: Box<dyn SynthesisBackend>) -> Self {
        let backend_id = backend.id();
        Self {
            backend: Mutex::new(backend),
            status: RwLock::new(EngineStatus::Unloaded),
            backend_id,
        }
    }

    pub fn backend_id(&self) -> &'static str {
        self.backend_id
    }

    pub fn status(&self) -> EngineStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Load now instead of on the first request
    pub fn warm(&self) -> Result<()> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_loaded(backend.as_mut())
    }

    /// Clear a recorded failure (or a loaded model) and load again
    pub fn reload(&self) -> Result<()> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(backend = self.backend_id, "reloading synthesis engine");
        backend.unload();
        self.set_status(EngineStatus::Unloaded);
        self.ensure_loaded(backend.as_mut())
    }

    /// Must be called with the backend lock held
    fn ensure_loaded(&self, backend: &mut dyn SynthesisBackend) -> Result<()> {
        match self.status() {
            EngineStatus::Ready => return Ok(()),
            EngineStatus::Failed(reason) => return Err(Error::EngineUnavailable(reason)),
            EngineStatus::Unloaded | EngineStatus::Loading => {}
        }

        self.set_status(EngineStatus::Loading);
        let start = Instant::now();
        tracing::info!(backend = self.backend_id, "loading synthesis engine");

        match backend.load() {
            Ok(()) => {
                self.set_status(EngineStatus::Ready);
                tracing::info!(backend = self.backend_id, elapsed = ?start.elapsed(), "synthesis engine ready");
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    Error::EngineUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                tracing::error!(backend = self.backend_id, error = %reason, "synthesis engine failed to load");
                self.set_status(EngineStatus::Failed(reason.clone()));
                Err(Error::EngineUnavailable(reason))
            }
        }
    }

    /// Run one inference. Not meant to be called concurrently; the
    /// generation scheduler's worker is the only caller in the daemon.
    pub fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_loaded(backend.as_mut())?;

        let start = Instant::now();
        let audio = backend.synthesize(request)?;
        tracing::debug!(
            backend = self.backend_id,
            references = request.references.len(),
            chars = request.text.len(),
            bytes = audio.len(),
            elapsed = ?start.elapsed(),
            "synthesized"
        );
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyBackend {
        loads: Arc<AtomicUsize>,
        fail_loads: usize,
    }

    impl SynthesisBackend for FlakyBackend {
        fn id(&self) -> &'static str {
            "flaky"
        }

        fn load(&mut self) -> Result<()> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_loads {
                Err(Error::EngineUnavailable("weights missing".into()))
            } else {
                Ok(())
            }
        }

        fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Vec<u8>> {
            Ok(request.text.as_bytes().to_vec())
        }
    }

    fn request() -> SynthesisRequest {
        SynthesisRequest {
            references: vec![],
            text: "hi".into(),
            language: "en".into(),
        }
    }

    #[test]
    fn loads_lazily_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let gateway = SynthesisGateway::new(Box::new(FlakyBackend {
            loads: loads.clone(),
            fail_loads: 0,
        }));
        assert_eq!(gateway.status(), EngineStatus::Unloaded);

        gateway.synthesize(&request()).unwrap();
        gateway.synthesize(&request()).unwrap();
        gateway.warm().unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.status(), EngineStatus::Ready);
    }

    #[test]
    fn failed_load_is_sticky_until_reload() {
        let loads = Arc::new(AtomicUsize::new(0));
        let gateway = SynthesisGateway::new(Box::new(FlakyBackend {
            loads: loads.clone(),
            fail_loads: 1,
        }));

        assert!(matches!(gateway.warm(), Err(Error::EngineUnavailable(_))));
        assert!(matches!(
            gateway.synthesize(&request()),
            Err(Error::EngineUnavailable(_))
        ));
        assert!(matches!(gateway.status(), EngineStatus::Failed(ref r) if r == "weights missing"));
        // No silent retry
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        gateway.reload().unwrap();
        assert_eq!(gateway.status(), EngineStatus::Ready);
        assert_eq!(gateway.synthesize(&request()).unwrap(), b"hi");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
