//! Voice profile registry and cloned-voice generation daemon.

pub mod app;
pub mod audio;
pub mod backends;
pub mod config_loader;
pub mod cortex;
pub mod ear;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod gateway;
pub mod http;
pub mod profiles;
pub mod samples;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod voice_loop;

pub use error::{Error, Result};
