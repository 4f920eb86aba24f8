//! Microphone capture and the utterance producers built on top of it.
//!
//! A `CaptureDevice` yields raw 16-bit mono chunks. An `UtteranceProducer`
//! turns that stream into bounded utterances, either on explicit
//! push-to-talk signals or by voice activity.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;

use crate::audio;
use crate::error::{Error, Result};

/// Chunk size handed to producers, in milliseconds of audio
const CHUNK_MS: u32 = 30;
/// Ring buffer capacity, in seconds of audio
const BUFFER_SECS: u32 = 10;
/// Longest `read_chunk` waits for audio before handing back an empty chunk
const POLL_WINDOW: Duration = Duration::from_millis(200);
/// How often a push-to-talk producer rechecks for cancellation while idle
const SIGNAL_POLL: Duration = Duration::from_millis(50);

#[cfg_attr(test, automock)]
pub trait CaptureDevice: Send {
    fn start(&mut self) -> Result<()>;
    /// Next chunk of mono samples; `Ok(None)` means the stream ended.
    /// May return an empty chunk when no audio arrived for a while.
    fn read_chunk(&mut self) -> Result<Option<Vec<i16>>>;
    fn stop(&mut self);
    /// Level of the most recent chunk, 0.0 (silence) to 1.0 (full scale)
    fn level(&self) -> f32;
    fn sample_rate(&self) -> u32;
}

/// One bounded span of captured speech
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn to_wav(&self) -> Result<Vec<u8>> {
        audio::pcm16_to_wav(&self.samples, self.sample_rate)
    }
}

/// Opens a capture device on demand, e.g. for one recording
pub type CaptureFactory = Arc<dyn Fn() -> Result<Box<dyn CaptureDevice>> + Send + Sync>;

/// The consumer's side of one `next_utterance` call
pub trait CaptureWatch {
    /// Capture went live for the utterance being produced
    fn capturing(&mut self) {}

    /// Polled between chunks; `true` makes the producer give up and end
    /// the sequence, discarding any partial utterance
    fn cancelled(&self) -> bool {
        false
    }
}

impl CaptureWatch for () {}

/// Clone to stop a running capture sequence from another thread
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl CaptureWatch for StopHandle {
    fn cancelled(&self) -> bool {
        self.is_stopped()
    }
}

pub trait UtteranceProducer: Send {
    /// Block until the next utterance. `Ok(None)` ends the sequence; an
    /// error is a capture fault.
    fn next_utterance(&mut self, watch: &mut dyn CaptureWatch) -> Result<Option<Utterance>>;
}

/// Capture exactly `duration` of audio, e.g. a reference recording
pub fn record(device: &mut dyn CaptureDevice, duration: Duration) -> Result<Utterance> {
    let sample_rate = device.sample_rate();
    let wanted = samples_for(duration, sample_rate);
    // Room for device start-up before calling the device stalled
    let deadline = Instant::now() + duration + Duration::from_secs(5);

    device.start()?;
    let mut samples = Vec::with_capacity(wanted);
    let outcome = loop {
        if samples.len() >= wanted {
            break Ok(());
        }
        if Instant::now() >= deadline {
            break Err(Error::Capture(format!(
                "capture stalled after {} of {} samples",
                samples.len(),
                wanted
            )));
        }
        match device.read_chunk() {
            Ok(Some(chunk)) => samples.extend_from_slice(&chunk),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    device.stop();
    outcome?;

    samples.truncate(wanted);
    if samples.is_empty() {
        return Err(Error::Capture("no audio was captured".to_string()));
    }
    tracing::debug!(samples = samples.len(), sample_rate, "recording captured");
    Ok(Utterance {
        samples,
        sample_rate,
    })
}

/// Mean absolute amplitude of a chunk
pub fn chunk_energy(chunk: &[i16]) -> i16 {
    if chunk.is_empty() {
        return 0;
    }
    let sum: u64 = chunk.iter().map(|&s| (s as i32).unsigned_abs() as u64).sum();
    (sum / chunk.len() as u64).min(i16::MAX as u64) as i16
}

// ---------------------------------------------------------------------------
// cpal capture
// ---------------------------------------------------------------------------

/// Default input device through cpal.
///
/// The cpal stream is not `Send`, so it lives on its own thread and feeds a
/// lock-free ring buffer that `read_chunk` drains.
pub struct CpalCapture {
    sample_rate: u32,
    channels: u16,
    consumer: Option<HeapCons<i16>>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    fault: Arc<Mutex<Option<String>>>,
    level: f32,
}

impl CpalCapture {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Capture("no input device available".to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| Error::Capture(format!("input config: {}", e)))?;

        tracing::debug!(
            sample_rate = config.sample_rate(),
            channels = config.channels(),
            format = ?config.sample_format(),
            "audio capture initialized"
        );

        Ok(Self {
            sample_rate: config.sample_rate(),
            channels: config.channels(),
            consumer: None,
            stop_tx: None,
            worker: None,
            fault: Arc::new(Mutex::new(None)),
            level: 0.0,
        })
    }

    fn chunk_len(&self) -> usize {
        (self.sample_rate * CHUNK_MS / 1000).max(1) as usize
    }

    fn take_fault(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn downmix_f32(data: &[f32], channels: usize, out: &mut Vec<i16>) {
    out.clear();
    for frame in data.chunks(channels) {
        let v = frame.iter().sum::<f32>() / frame.len() as f32;
        out.push((v * 32767.0).clamp(-32768.0, 32767.0) as i16);
    }
}

fn downmix_i16(data: &[i16], channels: usize, out: &mut Vec<i16>) {
    out.clear();
    for frame in data.chunks(channels) {
        let v = frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32;
        out.push(v as i16);
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let rb = HeapRb::<i16>::new((self.sample_rate * BUFFER_SECS) as usize);
        let (mut producer, consumer) = rb.split();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let fault = self.fault.clone();
        let channels = self.channels.max(1) as usize;

        let worker = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                // Stream must live on this thread
                let opened = (|| -> Result<cpal::Stream> {
                    let host = cpal::default_host();
                    let device = host
                        .default_input_device()
                        .ok_or_else(|| Error::Capture("no input device".to_string()))?;
                    let config = device
                        .default_input_config()
                        .map_err(|e| Error::Capture(e.to_string()))?;

                    let err_fault = fault.clone();
                    let err_fn = move |err: cpal::StreamError| {
                        tracing::error!(error = %err, "audio capture stream error");
                        *err_fault.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(err.to_string());
                    };

                    let mut scratch = Vec::new();
                    let stream = match config.sample_format() {
                        cpal::SampleFormat::F32 => device.build_input_stream(
                            &config.into(),
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                downmix_f32(data, channels, &mut scratch);
                                producer.push_slice(&scratch);
                            },
                            err_fn,
                            None,
                        ),
                        cpal::SampleFormat::I16 => device.build_input_stream(
                            &config.into(),
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                downmix_i16(data, channels, &mut scratch);
                                producer.push_slice(&scratch);
                            },
                            err_fn,
                            None,
                        ),
                        other => {
                            return Err(Error::Capture(format!(
                                "unsupported sample format {:?}",
                                other
                            )))
                        }
                    }
                    .map_err(|e| Error::Capture(format!("building stream: {}", e)))?;

                    stream
                        .play()
                        .map_err(|e| Error::Capture(format!("starting stream: {}", e)))?;
                    Ok(stream)
                })();

                match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Blocks until stop() sends or drops the sender
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(Error::Capture("capture thread exited".to_string()));
            }
        }

        self.consumer = Some(consumer);
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        tracing::debug!("audio capture started");
        Ok(())
    }

    fn read_chunk(&mut self) -> Result<Option<Vec<i16>>> {
        let chunk_len = self.chunk_len();
        let waited = Instant::now();
        loop {
            if let Some(fault) = self.take_fault() {
                return Err(Error::Capture(fault));
            }

            let finished = self.worker.as_ref().map_or(true, |w| w.is_finished());
            let Some(consumer) = self.consumer.as_mut() else {
                return Ok(None);
            };

            let available = consumer.occupied_len();
            if available >= chunk_len || (finished && available > 0) {
                let mut chunk = vec![0i16; available.min(chunk_len)];
                let n = consumer.pop_slice(&mut chunk);
                chunk.truncate(n);
                self.level = chunk_energy(&chunk) as f32 / i16::MAX as f32;
                return Ok(Some(chunk));
            }
            if finished {
                return Ok(None);
            }
            if waited.elapsed() >= POLL_WINDOW {
                self.level = 0.0;
                return Ok(Some(Vec::new()));
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            tracing::debug!("audio capture stopped");
        }
        self.consumer = None;
        self.level = 0.0;
    }

    fn level(&self) -> f32 {
        self.level
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Push-to-talk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PttSignal {
    Press,
    Release,
}

/// Operator side of push-to-talk. Dropping every handle ends the sequence.
#[derive(Clone)]
pub struct PushToTalkHandle {
    tx: Sender<PttSignal>,
}

impl PushToTalkHandle {
    pub fn press(&self) -> bool {
        self.tx.send(PttSignal::Press).is_ok()
    }

    pub fn release(&self) -> bool {
        self.tx.send(PttSignal::Release).is_ok()
    }
}

/// One utterance per press/release pair
pub struct PushToTalk<C: CaptureDevice> {
    device: C,
    signals: Receiver<PttSignal>,
    max_duration: Duration,
}

impl<C: CaptureDevice> PushToTalk<C> {
    pub fn new(device: C, max_duration: Duration) -> (Self, PushToTalkHandle) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                device,
                signals: rx,
                max_duration,
            },
            PushToTalkHandle { tx },
        )
    }
}

impl<C: CaptureDevice> UtteranceProducer for PushToTalk<C> {
    fn next_utterance(&mut self, watch: &mut dyn CaptureWatch) -> Result<Option<Utterance>> {
        // Wait for the operator; stray releases are ignored
        loop {
            if watch.cancelled() {
                return Ok(None);
            }
            match self.signals.recv_timeout(SIGNAL_POLL) {
                Ok(PttSignal::Press) => break,
                Ok(PttSignal::Release) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }

        self.device.start()?;
        watch.capturing();
        let started = Instant::now();
        let mut samples = Vec::new();

        // Ok(false): cancelled mid-utterance
        let outcome = loop {
            if watch.cancelled() {
                break Ok(false);
            }
            match self.signals.try_recv() {
                Ok(PttSignal::Release) => break Ok(true),
                Ok(PttSignal::Press) => {}
                Err(mpsc::TryRecvError::Disconnected) => break Ok(true),
                Err(mpsc::TryRecvError::Empty) => {}
            }
            if started.elapsed() >= self.max_duration {
                tracing::debug!("push-to-talk hit max duration");
                break Ok(true);
            }
            match self.device.read_chunk() {
                Ok(Some(chunk)) => samples.extend_from_slice(&chunk),
                Ok(None) => break Ok(true),
                Err(e) => break Err(e),
            }
        };
        self.device.stop();
        if !outcome? {
            return Ok(None);
        }

        Ok(Some(Utterance {
            samples,
            sample_rate: self.device.sample_rate(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Voice activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Chunk energy that marks speech onset
    pub speech_threshold: i16,
    /// Chunk energy below which a chunk counts as silence
    pub silence_threshold: i16,
    pub silence_duration: Duration,
    pub max_duration: Duration,
    /// Audio kept from before the onset so the first syllable is not clipped
    pub pre_roll: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 500,
            silence_threshold: 400,
            silence_duration: Duration::from_millis(1500),
            max_duration: Duration::from_millis(15000),
            pre_roll: Duration::from_millis(300),
        }
    }
}

fn samples_for(d: Duration, rate: u32) -> usize {
    (d.as_secs_f64() * rate as f64) as usize
}

/// Splits a chunk stream into utterances by energy. Pure; no I/O.
pub struct SpeechSegmenter {
    config: VadConfig,
    sample_rate: u32,
    pre_roll: VecDeque<i16>,
    current: Option<Vec<i16>>,
    silent_samples: usize,
}

impl SpeechSegmenter {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            pre_roll: VecDeque::new(),
            current: None,
            silent_samples: 0,
        }
    }

    pub fn in_speech(&self) -> bool {
        self.current.is_some()
    }

    pub fn reset(&mut self) {
        self.pre_roll.clear();
        self.current = None;
        self.silent_samples = 0;
    }

    /// Feed one chunk; returns a finished utterance when one closes
    pub fn feed(&mut self, chunk: &[i16]) -> Option<Vec<i16>> {
        let energy = chunk_energy(chunk);

        let Some(current) = self.current.as_mut() else {
            if energy >= self.config.speech_threshold {
                let mut speech: Vec<i16> = self.pre_roll.drain(..).collect();
                speech.extend_from_slice(chunk);
                self.current = Some(speech);
                self.silent_samples = 0;
            } else {
                self.pre_roll.extend(chunk.iter().copied());
                let keep = samples_for(self.config.pre_roll, self.sample_rate);
                while self.pre_roll.len() > keep {
                    self.pre_roll.pop_front();
                }
            }
            return None;
        };

        current.extend_from_slice(chunk);
        if energy < self.config.silence_threshold {
            self.silent_samples += chunk.len();
        } else {
            self.silent_samples = 0;
        }

        let ended = self.silent_samples
            >= samples_for(self.config.silence_duration, self.sample_rate);
        let too_long = current.len() >= samples_for(self.config.max_duration, self.sample_rate);
        if ended || too_long {
            self.silent_samples = 0;
            return self.current.take();
        }
        None
    }

    /// Close whatever is in progress, e.g. when the stream ends
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        self.silent_samples = 0;
        self.pre_roll.clear();
        self.current.take()
    }
}

/// Lazy, unbounded sequence of utterances demarcated by voice activity.
///
/// Not resumable mid-utterance: after an error or `restart` capture starts
/// over from scratch.
pub struct VadProducer<C: CaptureDevice> {
    device: C,
    segmenter: SpeechSegmenter,
    running: bool,
}

impl<C: CaptureDevice> VadProducer<C> {
    pub fn new(device: C, config: VadConfig) -> Self {
        let rate = device.sample_rate();
        Self {
            device,
            segmenter: SpeechSegmenter::new(config, rate),
            running: false,
        }
    }

    pub fn restart(&mut self) {
        self.device.stop();
        self.segmenter.reset();
        self.running = false;
    }
}

impl<C: CaptureDevice> UtteranceProducer for VadProducer<C> {
    fn next_utterance(&mut self, watch: &mut dyn CaptureWatch) -> Result<Option<Utterance>> {
        if !self.running {
            self.device.start()?;
            self.running = true;
        }
        watch.capturing();
        let sample_rate = self.device.sample_rate();

        loop {
            if watch.cancelled() {
                self.restart();
                return Ok(None);
            }
            match self.device.read_chunk() {
                Ok(Some(chunk)) => {
                    if let Some(samples) = self.segmenter.feed(&chunk) {
                        return Ok(Some(Utterance { samples, sample_rate }));
                    }
                }
                Ok(None) => {
                    let rest = self.segmenter.flush();
                    self.restart();
                    return Ok(rest.map(|samples| Utterance { samples, sample_rate }));
                }
                Err(e) => {
                    self.restart();
                    return Err(e);
                }
            }
        }
    }
}

impl<C: CaptureDevice> Iterator for VadProducer<C> {
    type Item = Result<Utterance>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_utterance(&mut ()).transpose()
    }
}
