pub mod coqui;
pub mod whisper;
pub mod xtts;

use std::path::PathBuf;

use crate::error::Result;

/// Everything one inference needs. Transient, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Reference recordings; all of them condition the cloned voice
    pub references: Vec<PathBuf>,
    pub text: String,
    pub language: String,
}

/// Trait that every voice-cloning backend must implement.
/// Compatibility shims for a particular model runtime live behind it.
///
/// Implementations are not expected to be reentrant: the gateway calls
/// them from one thread at a time.
pub trait SynthesisBackend: Send {
    /// Returns the unique ID of the backend (e.g., "xtts-http")
    fn id(&self) -> &'static str;

    /// Bring the model into memory. Expensive; called once per load cycle.
    fn load(&mut self) -> Result<()>;

    /// Drop whatever `load` acquired so the next `load` starts clean
    fn unload(&mut self) {}

    /// Returns WAV bytes spoken in the cloned voice
    fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Vec<u8>>;
}

/// Speech-to-text capability used by the voice loop
pub trait Transcriber: Send + Sync {
    /// `wav` is a complete WAV file; an empty string means nothing was said
    fn transcribe(&self, wav: &[u8]) -> Result<String>;
}
