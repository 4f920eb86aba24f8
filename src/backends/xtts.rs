//! Backend for a resident XTTS v2 inference server reached over HTTP.
//!
//! The server keeps the model in memory; this side ships the reference
//! recordings base64-encoded with every request so the server needs no
//! access to the profile store.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{SynthesisBackend, SynthesisRequest};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct CloneRequest<'a> {
    text: &'a str,
    language: &'a str,
    speaker_wavs: Vec<String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    model_loaded: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct XttsHttpBackend {
    base_url: String,
    timeout: Duration,
    client: Option<reqwest::blocking::Client>,
}

impl XttsHttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client: None,
        }
    }
}

impl SynthesisBackend for XttsHttpBackend {
    fn id(&self) -> &'static str {
        "xtts-http"
    }

    fn load(&mut self) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::EngineUnavailable(format!("HTTP client: {}", e)))?;

        // The server loads its model on startup and reports readiness here
        let health: HealthResponse = client
            .post(format!("{}/api/load", self.base_url))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| {
                Error::EngineUnavailable(format!("XTTS server at {}: {}", self.base_url, e))
            })?;

        if !health.model_loaded {
            return Err(Error::EngineUnavailable(
                health
                    .error
                    .unwrap_or_else(|| "XTTS server reports model not loaded".to_string()),
            ));
        }

        tracing::info!(url = %self.base_url, "XTTS server ready");
        self.client = Some(client);
        Ok(())
    }

    fn unload(&mut self) {
        self.client = None;
    }

    fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::EngineUnavailable("XTTS backend not loaded".to_string()))?;

        let speaker_wavs = request
            .references
            .iter()
            .map(|path| std::fs::read(path).map(|bytes| STANDARD.encode(bytes)))
            .collect::<std::io::Result<Vec<_>>>()?;

        let body = CloneRequest {
            text: &request.text,
            language: &request.language,
            speaker_wavs,
        };

        let response = client
            .post(format!("{}/api/clone", self.base_url))
            .json(&body)
            .send()
            .map_err(|e| Error::Synthesis(format!("XTTS request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(Error::Synthesis(format!("XTTS server returned {}: {}", status, detail)));
        }

        let audio = response
            .bytes()
            .map_err(|e| Error::Synthesis(format!("XTTS response body: {}", e)))?;
        Ok(audio.to_vec())
    }
}
