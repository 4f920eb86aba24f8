//! Voice Interaction Loop: capture -> transcribe -> generate -> play.
//!
//! Runs on its own thread. Generation goes through the scheduler like any
//! other caller, so API traffic and the loop share one FIFO queue.

use std::sync::Arc;
use std::time::Duration;

use crate::backends::Transcriber;
use crate::cortex::Responder;
use crate::ear::{CaptureWatch, Utterance, UtteranceProducer};
pub use crate::ear::StopHandle;
use crate::engine::PlaybackDevice;
use crate::error::{Error, Result};
use crate::profiles::ProfileStore;
use crate::scheduler::{GenerationRequest, GenerationScheduler};
use crate::session::{SessionMachine, SessionState};

#[derive(Debug, Clone)]
pub struct VoiceLoopConfig {
    pub profile_id: String,
    pub language: String,
    pub volume: f32,
    pub device: Option<String>,
    pub stop_phrases: Vec<String>,
    /// How long the `Error` state stays visible before returning to `Idle`
    pub error_hold: Duration,
}

/// Why `run` returned
#[derive(Debug)]
pub enum LoopExit {
    /// The stop flag was raised
    Stopped,
    /// A transcription matched a stop phrase
    StopPhrase(String),
    /// The utterance producer ended its sequence
    Exhausted,
    /// The capture device failed; the session is left in `Error`
    CaptureFault(Error),
}

/// Shows `Listening` once the producer actually captures, and cancels it
/// when the loop is stopped
struct TurnWatch<'a> {
    session: &'a SessionMachine,
    stop: &'a StopHandle,
}

impl CaptureWatch for TurnWatch<'_> {
    fn capturing(&mut self) {
        self.session
            .transition_from(SessionState::Idle, SessionState::Listening);
    }

    fn cancelled(&self) -> bool {
        self.stop.is_stopped()
    }
}

pub struct VoiceLoop {
    transcriber: Arc<dyn Transcriber>,
    scheduler: Arc<GenerationScheduler>,
    session: Arc<SessionMachine>,
    playback: Arc<dyn PlaybackDevice>,
    responder: Arc<dyn Responder>,
    store: Arc<ProfileStore>,
    config: VoiceLoopConfig,
    stop: StopHandle,
    runtime: tokio::runtime::Handle,
}

impl VoiceLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        scheduler: Arc<GenerationScheduler>,
        session: Arc<SessionMachine>,
        playback: Arc<dyn PlaybackDevice>,
        responder: Arc<dyn Responder>,
        store: Arc<ProfileStore>,
        config: VoiceLoopConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            transcriber,
            scheduler,
            session,
            playback,
            responder,
            store,
            config,
            stop: StopHandle::default(),
            runtime,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Drive utterances until stopped. Must not be called from an async
    /// context; it blocks on the scheduler.
    pub fn run(&self, producer: &mut dyn UtteranceProducer) -> LoopExit {
        tracing::info!(profile_id = %self.config.profile_id, "voice loop started");

        let exit = loop {
            if self.stop.is_stopped() {
                break LoopExit::Stopped;
            }

            let mut watch = TurnWatch {
                session: self.session.as_ref(),
                stop: &self.stop,
            };
            let utterance = match producer.next_utterance(&mut watch) {
                Ok(Some(u)) => u,
                Ok(None) => {
                    self.settle_empty();
                    if self.stop.is_stopped() {
                        break LoopExit::Stopped;
                    }
                    break LoopExit::Exhausted;
                }
                Err(e) => {
                    tracing::error!(error = %e, "capture device fault; halting voice loop");
                    self.session.fail(e.to_string());
                    break LoopExit::CaptureFault(e);
                }
            };

            // Producers that never report capture still pass through Listening
            self.session
                .transition_from(SessionState::Idle, SessionState::Listening);

            // Cooperative stop at the utterance boundary
            if self.stop.is_stopped() {
                self.settle_empty();
                break LoopExit::Stopped;
            }

            if let Some(exit) = self.turn(&utterance) {
                break exit;
            }
        };

        tracing::info!(exit = ?exit, "voice loop ended");
        exit
    }

    /// One listen -> respond cycle. Returns an exit reason to end the loop.
    fn turn(&self, utterance: &Utterance) -> Option<LoopExit> {
        self.session.transition(SessionState::Transcribing);
        let text = self.transcribe(utterance);
        if text.is_empty() {
            self.session.transition(SessionState::Idle);
            return None;
        }
        tracing::info!(text = %text, "heard");

        if let Some(phrase) = self.matching_stop_phrase(&text) {
            tracing::info!(phrase = %phrase, "stop phrase recognized");
            self.session.transition(SessionState::Idle);
            return Some(LoopExit::StopPhrase(phrase));
        }

        self.session.transition(SessionState::Generating);
        let audio = match self.generate(&text) {
            Ok(audio) => audio,
            Err(e) => {
                self.recover(&e.to_string());
                return None;
            }
        };

        // The in-flight call finished; a cancelled session discards it
        if self.stop.is_stopped() {
            tracing::debug!("session cancelled during generation; result discarded");
            self.session.fail("session cancelled");
            self.session.transition(SessionState::Idle);
            return Some(LoopExit::Stopped);
        }

        self.session.transition(SessionState::Speaking);
        if let Err(e) = self
            .playback
            .play(&audio, self.config.volume, self.config.device.as_deref())
        {
            self.recover(&e.to_string());
            return None;
        }
        self.session.transition(SessionState::Idle);
        None
    }

    /// Recognition failures count as silence
    fn transcribe(&self, utterance: &Utterance) -> String {
        let result = utterance
            .to_wav()
            .and_then(|wav| self.transcriber.transcribe(&wav));
        match result {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed; treating as empty");
                String::new()
            }
        }
    }

    fn generate(&self, heard: &str) -> Result<Vec<u8>> {
        let profile = self.store.get(&self.config.profile_id)?;
        let reply = self
            .responder
            .respond(heard, profile.assistant_prompt.as_deref())?;
        let request = GenerationRequest::new(&profile.profile_id, &reply, &self.config.language);
        self.runtime.block_on(self.scheduler.submit(request))
    }

    fn recover(&self, detail: &str) {
        tracing::warn!(error = %detail, "turn failed");
        self.session.fail(detail);
        if !self.config.error_hold.is_zero() {
            std::thread::sleep(self.config.error_hold);
        }
        self.session.transition(SessionState::Idle);
    }

    /// Leave `Listening` without a result
    fn settle_empty(&self) {
        self.session
            .transition_from(SessionState::Listening, SessionState::Transcribing);
        self.session
            .transition_from(SessionState::Transcribing, SessionState::Idle);
    }

    fn matching_stop_phrase(&self, text: &str) -> Option<String> {
        let heard = format!(" {} ", normalize_phrase(text));
        self.config
            .stop_phrases
            .iter()
            .map(|p| normalize_phrase(p))
            .find(|p| !p.is_empty() && heard.contains(&format!(" {} ", p)))
    }
}

/// Lowercase, punctuation dropped, whitespace collapsed
pub fn normalize_phrase(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SynthesisBackend, SynthesisRequest};
    use crate::cortex::EchoResponder;
    use crate::engine::MockPlaybackDevice;
    use crate::feedback::MockFeedbackDevice;
    use crate::gateway::SynthesisGateway;
    use crate::profiles::PreparedSample;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    struct ScriptedProducer(VecDeque<Result<Option<Utterance>>>);

    impl UtteranceProducer for ScriptedProducer {
        fn next_utterance(&mut self, _watch: &mut dyn CaptureWatch) -> Result<Option<Utterance>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    /// Captures forever and only gives up when cancelled
    struct EndlessProducer;

    impl UtteranceProducer for EndlessProducer {
        fn next_utterance(&mut self, watch: &mut dyn CaptureWatch) -> Result<Option<Utterance>> {
            watch.capturing();
            while !watch.cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(None)
        }
    }

    /// Waits for a press that never comes
    struct UnpressedProducer;

    impl UtteranceProducer for UnpressedProducer {
        fn next_utterance(&mut self, watch: &mut dyn CaptureWatch) -> Result<Option<Utterance>> {
            while !watch.cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(None)
        }
    }

    /// Transcribes by sample count: 0 samples is silence
    struct TableTranscriber(Vec<(usize, &'static str)>);

    impl Transcriber for TableTranscriber {
        fn transcribe(&self, wav: &[u8]) -> Result<String> {
            let frames = crate::audio::decode(wav)?.frames();
            Ok(self
                .0
                .iter()
                .find(|(n, _)| *n == frames)
                .map(|(_, t)| t.to_string())
                .unwrap_or_default())
        }
    }

    struct CountingBackend(Arc<AtomicUsize>);

    impl SynthesisBackend for CountingBackend {
        fn id(&self) -> &'static str {
            "counting"
        }
        fn load(&mut self) -> Result<()> {
            Ok(())
        }
        fn synthesize(&mut self, request: &SynthesisRequest) -> Result<Vec<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(request.text.as_bytes().to_vec())
        }
    }

    fn utterance(frames: usize) -> Utterance {
        Utterance {
            samples: vec![0; frames],
            sample_rate: 16000,
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        _runtime: tokio::runtime::Runtime,
        voice: VoiceLoop,
        states: Arc<Mutex<Vec<SessionState>>>,
        calls: Arc<AtomicUsize>,
        session: Arc<SessionMachine>,
    }

    fn harness(playback: MockPlaybackDevice, table: Vec<(usize, &'static str)>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProfileStore::open(dir.path()).unwrap());
        let wav = crate::audio::pcm16_to_wav(&[100; 2205], 22050).unwrap();
        let profile = store
            .create(
                "Test",
                None,
                vec![PreparedSample {
                    filename: "a.wav".into(),
                    wav,
                    duration_secs: 0.1,
                    sample_rate: 22050,
                    channels: 1,
                }],
            )
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let gateway = Arc::new(SynthesisGateway::new(Box::new(CountingBackend(calls.clone()))));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let scheduler = Arc::new(
            GenerationScheduler::start(gateway, store.clone(), Duration::from_secs(5)).unwrap(),
        );

        let states = Arc::new(Mutex::new(Vec::new()));
        let mut led = MockFeedbackDevice::new();
        let seen = states.clone();
        led.expect_apply().returning(move |s| {
            seen.lock().unwrap().push(s);
            Ok(())
        });
        let session = Arc::new(SessionMachine::new(vec![Arc::new(led)]));

        let voice = VoiceLoop::new(
            Arc::new(TableTranscriber(table)),
            scheduler,
            session.clone(),
            Arc::new(playback),
            Arc::new(EchoResponder),
            store,
            VoiceLoopConfig {
                profile_id: profile.profile_id,
                language: "en".into(),
                volume: 0.8,
                device: None,
                stop_phrases: vec!["Stop listening".into()],
                error_hold: Duration::ZERO,
            },
            runtime.handle().clone(),
        );

        Harness {
            _dir: dir,
            _runtime: runtime,
            voice,
            states,
            calls,
            session,
        }
    }

    #[test]
    fn silence_returns_to_idle_without_generating() {
        let mut playback = MockPlaybackDevice::new();
        playback.expect_play().never();
        let h = harness(playback, vec![]);

        let mut producer = ScriptedProducer(VecDeque::from([Ok(Some(utterance(0)))]));
        let exit = h.voice.run(&mut producer);

        assert!(matches!(exit, LoopExit::Exhausted));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.states.lock().unwrap()[..4],
            [
                SessionState::Idle,
                SessionState::Listening,
                SessionState::Transcribing,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn speech_is_answered_in_the_cloned_voice() {
        let mut playback = MockPlaybackDevice::new();
        playback
            .expect_play()
            .withf(|wav, volume, device| {
                wav == b"You said: hello there" && *volume == 0.8 && device.is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let h = harness(playback, vec![(160, "hello there")]);

        let mut producer = ScriptedProducer(VecDeque::from([Ok(Some(utterance(160)))]));
        h.voice.run(&mut producer);

        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        let states = h.states.lock().unwrap();
        assert_eq!(
            states[1..6],
            [
                SessionState::Listening,
                SessionState::Transcribing,
                SessionState::Generating,
                SessionState::Speaking,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn playback_failure_shows_error_then_resumes() {
        let mut playback = MockPlaybackDevice::new();
        playback
            .expect_play()
            .times(2)
            .returning(|_, _, _| Err(Error::Playback("speaker gone".into())));
        let h = harness(playback, vec![(160, "one"), (320, "two")]);

        let mut producer = ScriptedProducer(VecDeque::from([
            Ok(Some(utterance(160))),
            Ok(Some(utterance(320))),
        ]));
        let exit = h.voice.run(&mut producer);

        assert!(matches!(exit, LoopExit::Exhausted));
        let errors = h
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == SessionState::Error)
            .count();
        assert_eq!(errors, 2);
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn stop_phrase_ends_the_loop() {
        let mut playback = MockPlaybackDevice::new();
        playback.expect_play().never();
        let h = harness(playback, vec![(160, "OK, stop listening!")]);

        let mut producer = ScriptedProducer(VecDeque::from([
            Ok(Some(utterance(160))),
            Ok(Some(utterance(160))),
        ]));
        let exit = h.voice.run(&mut producer);

        assert!(matches!(exit, LoopExit::StopPhrase(ref p) if p == "stop listening"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn capture_fault_halts_in_error() {
        let playback = MockPlaybackDevice::new();
        let h = harness(playback, vec![]);

        let mut producer = ScriptedProducer(VecDeque::from([Err(Error::Capture(
            "unplugged".into(),
        ))]));
        let exit = h.voice.run(&mut producer);

        assert!(matches!(exit, LoopExit::CaptureFault(Error::Capture(_))));
        assert_eq!(h.session.state(), SessionState::Error);
    }

    #[test]
    fn stop_handle_stops_before_next_utterance() {
        let playback = MockPlaybackDevice::new();
        let h = harness(playback, vec![]);
        h.voice.stop_handle().stop();

        let mut producer = ScriptedProducer(VecDeque::from([Ok(Some(utterance(160)))]));
        assert!(matches!(h.voice.run(&mut producer), LoopExit::Stopped));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn stop_interrupts_a_producer_blocked_in_capture() {
        let h = harness(MockPlaybackDevice::new(), vec![]);
        let stop = h.voice.stop_handle();
        let started = Instant::now();

        let exit = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                stop.stop();
            });
            h.voice.run(&mut EndlessProducer)
        });

        assert!(matches!(exit, LoopExit::Stopped));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.states.lock().unwrap().contains(&SessionState::Listening));
    }

    #[test]
    fn waiting_for_a_press_stays_idle() {
        let h = harness(MockPlaybackDevice::new(), vec![]);
        let stop = h.voice.stop_handle();

        let exit = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                stop.stop();
            });
            h.voice.run(&mut UnpressedProducer)
        });

        assert!(matches!(exit, LoopExit::Stopped));
        assert!(!h.states.lock().unwrap().contains(&SessionState::Listening));
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[test]
    fn stop_phrases_ignore_case_and_punctuation() {
        assert_eq!(normalize_phrase("  Good-bye,  World! "), "goodbye world");
    }
}
