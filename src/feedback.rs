//! Visual feedback devices driven by session transitions.
//!
//! Devices only react to the states the session machine hands them; nothing
//! else in the daemon touches them.

use std::fs;
use std::path::PathBuf;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::session::SessionState;

#[cfg_attr(test, automock)]
pub trait FeedbackDevice: Send + Sync {
    /// Best effort; the caller logs failures and moves on
    fn apply(&self, state: SessionState) -> Result<()>;
}

/// Writes state changes to the log. Used when no LED is wired up.
pub struct LogFeedback;

impl FeedbackDevice for LogFeedback {
    fn apply(&self, state: SessionState) -> Result<()> {
        tracing::info!(state = state.as_str(), "feedback");
        Ok(())
    }
}

/// RGB LED exposed through the kernel LED class, one brightness file per
/// channel: `{prefix}red/brightness`, `{prefix}green/brightness`,
/// `{prefix}blue/brightness`.
pub struct SysfsRgbLed {
    prefix: String,
}

impl SysfsRgbLed {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        PathBuf::from(format!("{}{}/brightness", self.prefix, channel))
    }
}

/// (red, green, blue) per state
pub fn color_for(state: SessionState) -> (u8, u8, u8) {
    match state {
        SessionState::Idle => (0, 16, 0),
        SessionState::Listening => (0, 255, 0),
        SessionState::Transcribing | SessionState::Generating => (0, 0, 255),
        SessionState::Speaking => (0, 255, 255),
        SessionState::Error => (255, 0, 0),
    }
}

impl FeedbackDevice for SysfsRgbLed {
    fn apply(&self, state: SessionState) -> Result<()> {
        let (r, g, b) = color_for(state);
        for (channel, value) in [("red", r), ("green", g), ("blue", b)] {
            let path = self.channel_path(channel);
            fs::write(&path, value.to_string()).map_err(|e| {
                Error::Storage(format!("LED {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}
