//! Composes the reply the voice loop speaks back.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{Error, Result};

pub trait Responder: Send + Sync {
    /// `directive` is the active profile's assistant prompt, if any
    fn respond(&self, heard: &str, directive: Option<&str>) -> Result<String>;
}

/// Repeats what was heard
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn respond(&self, heard: &str, _directive: Option<&str>) -> Result<String> {
        Ok(format!("You said: {}", heard))
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Asks a local Ollama model, with the profile prompt as system directive
pub struct OllamaResponder {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
}

impl OllamaResponder {
    pub fn new(url: &str, model: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

impl Responder for OllamaResponder {
    fn respond(&self, heard: &str, directive: Option<&str>) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "prompt": heard,
            "stream": false,
        });
        if let Some(system) = directive.filter(|d| !d.trim().is_empty()) {
            body["system"] = json!(system);
        }

        let reply: GenerateResponse = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| Error::Synthesis(format!("Could not contact Ollama: {}", e)))?;

        let text = reply.response.trim();
        if text.is_empty() {
            return Err(Error::Synthesis("Ollama returned an empty reply".to_string()));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_repeats() {
        assert_eq!(
            EchoResponder.respond("hello", Some("be terse")).unwrap(),
            "You said: hello"
        );
    }

    #[test]
    fn ollama_sends_prompt_as_system() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "llama3",
                "prompt": "what time is it",
                "system": "You are a pirate.",
                "stream": false
            })))
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": " Arr, noon. "}"#)
            .create();

        let responder = OllamaResponder::new(&server.url(), "llama3").unwrap();
        let reply = responder
            .respond("what time is it", Some("You are a pirate."))
            .unwrap();
        assert_eq!(reply, "Arr, noon.");
        mock.assert();
    }

    #[test]
    fn ollama_down_is_an_error() {
        let responder = OllamaResponder::new("http://127.0.0.1:9", "llama3").unwrap();
        assert!(responder.respond("hi", None).is_err());
    }
}
