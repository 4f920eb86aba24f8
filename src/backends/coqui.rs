//! Fallback backend that shells out to the Coqui `tts` command line tool.
//!
//! Every invocation pays the model load, so this is only meant for devices
//! without a resident XTTS server.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

use super::{SynthesisBackend, SynthesisRequest};
use crate::error::{Error, Result};

pub struct CoquiCliBackend {
    binary_path: String,
    model_name: String,
    timeout: Duration,
    output_dir: Option<tempfile::TempDir>,
}

impl CoquiCliBackend {
    pub fn new(binary_path: &str, model_name: &str, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.to_string(),
            model_name: model_name.to_string(),
            timeout,
            output_dir: None,
        }
    }

    fn build_command(&self, request: &SynthesisRequest, out_path: &PathBuf) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--model_name")
            .arg(&self.model_name)
            .arg("--text")
            .arg(&request.text)
            .arg("--language_idx")
            .arg(&request.language)
            .arg("--speaker_wav")
            .args(&request.references)
            .arg("--out_path")
            .arg(out_path)
            .env("COQUI_TOS_AGREED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl SynthesisBackend for CoquiCliBackend {
    fn id(&self) -> &'static str {
        "coqui-cli"
    }

    fn load(&mut self) -> Result<()> {
        let mut child = Command::new(&self.binary_path)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::EngineUnavailable(format!("cannot run {}: {}", self.binary_path, e))
            })?;

        match child.wait_timeout(Duration::from_secs(30))? {
            Some(status) if status.success() => {}
            Some(status) => {
                return Err(Error::EngineUnavailable(format!(
                    "{} --help exited with {}",
                    self.binary_path, status
                )))
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::EngineUnavailable(format!(
                    "{} did not respond",
                    self.binary_path
                )));
            }
        }

        self.output_dir = Some(tempfile::Builder::new().prefix("voxclone-tts").tempdir()?);
        tracing::info!(binary = %self.binary_path, model = %self.model_name, "Coqui CLI backend ready");
        Ok(())
    }

    fn unload(&mut self) {
        self.output_dir = None;
    }

    fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let out_dir = self
            .output_dir
            .as_ref()
            .ok_or_else(|| Error::EngineUnavailable("Coqui CLI backend not loaded".to_string()))?;
        let out_path = out_dir.path().join("output.wav");

        let mut child = self.build_command(request, &out_path).spawn()?;

        match child.wait_timeout(self.timeout)? {
            Some(status) if status.success() => {
                let audio = std::fs::read(&out_path)?;
                std::fs::remove_file(&out_path).ok();
                Ok(audio)
            }
            Some(status) => {
                let mut err = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    stderr.read_to_string(&mut err).ok();
                }
                Err(Error::Synthesis(format!(
                    "tts exited with {}: {}",
                    status,
                    err.lines().last().unwrap_or_default()
                )))
            }
            None => {
                // Timeout occurred, kill the process
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::Synthesis(format!(
                    "tts timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}
