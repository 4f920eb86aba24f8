//! Audio playback device backed by rodio.

use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

#[cfg_attr(test, automock)]
pub trait PlaybackDevice: Send + Sync {
    /// Play a complete WAV file and return once it has finished.
    /// `device_hint` selects an output whose name contains it.
    fn play<'a>(&self, wav: &[u8], volume: f32, device_hint: Option<&'a str>) -> Result<()>;
}

struct PlayJob {
    wav: Vec<u8>,
    volume: f32,
    device_hint: Option<String>,
    done: Sender<Result<()>>,
}

/// Owns the output streams on a dedicated thread; rodio streams are not `Send`.
pub struct RodioPlayback {
    tx: Mutex<Sender<PlayJob>>,
}

impl RodioPlayback {
    pub fn new() -> Result<Self> {
        let (tx, rx) = channel::<PlayJob>();

        thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                // Audio streams must live on this thread
                let mut streams: HashMap<String, (OutputStream, OutputStreamHandle)> =
                    HashMap::new();

                while let Ok(job) = rx.recv() {
                    let key = job.device_hint.clone().unwrap_or_default();
                    let result = match streams.get(&key) {
                        Some((_, handle)) => play_on(handle, job.wav, job.volume),
                        None => match open_stream(job.device_hint.as_deref()) {
                            Ok((stream, handle)) => {
                                let result = play_on(&handle, job.wav, job.volume);
                                streams.insert(key, (stream, handle));
                                result
                            }
                            Err(e) => Err(e),
                        },
                    };

                    if let Err(e) = &result {
                        tracing::warn!(error = %e, "playback failed");
                    }
                    let _ = job.done.send(result);
                }
            })?;

        Ok(Self { tx: Mutex::new(tx) })
    }
}

fn open_stream(device_hint: Option<&str>) -> Result<(OutputStream, OutputStreamHandle)> {
    let Some(hint) = device_hint.filter(|h| !h.is_empty()) else {
        return OutputStream::try_default()
            .map_err(|e| Error::Playback(format!("no audio output device: {}", e)));
    };

    let host = rodio::cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| Error::Playback(format!("listing output devices: {}", e)))?;
    for device in devices {
        if device.name().map(|n| n.contains(hint)).unwrap_or(false) {
            tracing::debug!(device = hint, "opening output device");
            return OutputStream::try_from_device(&device)
                .map_err(|e| Error::Playback(format!("opening {}: {}", hint, e)));
        }
    }
    Err(Error::Playback(format!("no output device matching '{}'", hint)))
}

fn play_on(handle: &OutputStreamHandle, wav: Vec<u8>, volume: f32) -> Result<()> {
    let sink = Sink::try_new(handle).map_err(|e| Error::Playback(e.to_string()))?;
    let source =
        Decoder::new(Cursor::new(wav)).map_err(|e| Error::Playback(format!("decode: {}", e)))?;
    sink.set_volume(volume.clamp(0.0, 1.0));
    sink.append(source);
    sink.sleep_until_end();
    Ok(())
}

impl PlaybackDevice for RodioPlayback {
    fn play(&self, wav: &[u8], volume: f32, device_hint: Option<&str>) -> Result<()> {
        let (done_tx, done_rx) = channel();
        let job = PlayJob {
            wav: wav.to_vec(),
            volume,
            device_hint: device_hint.map(str::to_string),
            done: done_tx,
        };
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(job)
            .map_err(|_| Error::Playback("playback thread stopped".to_string()))?;
        done_rx
            .recv()
            .map_err(|_| Error::Playback("playback thread stopped".to_string()))?
    }
}

/// Names of the available output devices
pub fn output_device_names() -> Vec<String> {
    rodio::cpal::default_host()
        .output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}
