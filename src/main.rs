use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use zbus::connection::Builder;

use voxclone::app::AppState;
use voxclone::backends::coqui::CoquiCliBackend;
use voxclone::backends::whisper::WhisperBackend;
use voxclone::backends::xtts::XttsHttpBackend;
use voxclone::backends::SynthesisBackend;
use voxclone::config_loader::Settings;
use voxclone::cortex::{EchoResponder, OllamaResponder, Responder};
use voxclone::ear::{
    CaptureDevice, CaptureFactory, CpalCapture, PushToTalk, PushToTalkHandle, UtteranceProducer,
    VadConfig, VadProducer,
};
use voxclone::engine::{PlaybackDevice, RodioPlayback};
use voxclone::feedback::{FeedbackDevice, LogFeedback, SysfsRgbLed};
use voxclone::gateway::SynthesisGateway;
use voxclone::profiles::ProfileStore;
use voxclone::samples::SampleManager;
use voxclone::scheduler::GenerationScheduler;
use voxclone::service::{VoxcloneService, BUS_NAME, OBJECT_PATH};
use voxclone::session::SessionMachine;
use voxclone::voice_loop::{StopHandle, VoiceLoop, VoiceLoopConfig};
use voxclone::{http, Error, Result};

/// How long shutdown waits for the voice loop to wind down
const VOICE_LOOP_SHUTDOWN: Duration = Duration::from_secs(2);

/// A running voice loop: raise `stop`, then await `done`
struct VoiceLoopHandle {
    stop: StopHandle,
    done: tokio::sync::oneshot::Receiver<()>,
}

/// Voice profile registry and cloned-voice generation daemon
#[derive(Parser)]
#[command(name = "voxclone", version, about)]
struct Cli {
    /// Extra configuration file, merged over the defaults
    #[arg(short, long, env = "VOXCLONE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voxclone=info",
        1 => "info,voxclone=debug",
        _ => "debug,voxclone=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dbus_err(e: zbus::Error) -> Error {
    Error::Config(format!("D-Bus: {}", e))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::new(cli.config.as_deref())?;

    let store = Arc::new(ProfileStore::open(settings.data_path())?);
    let samples = Arc::new(SampleManager::new(
        store.clone(),
        settings.canonical_sample_rate,
        settings.max_sample_bytes(),
    ));

    let backend: Box<dyn SynthesisBackend> = match settings.synthesis_backend.as_str() {
        "coqui-cli" => Box::new(CoquiCliBackend::new(
            &settings.tts_binary,
            &settings.tts_model,
            Duration::from_secs(settings.tts_timeout_secs),
        )),
        _ => Box::new(XttsHttpBackend::new(
            &settings.xtts_url,
            Duration::from_secs(settings.xtts_timeout_secs),
        )),
    };
    let gateway = Arc::new(SynthesisGateway::new(backend));
    if settings.warm_on_start {
        let gateway = gateway.clone();
        // Pay the load latency now, not on the first request
        tokio::task::spawn_blocking(move || {
            if let Err(e) = gateway.warm() {
                tracing::warn!(error = %e, "engine warm-up failed; use reload once fixed");
            }
        });
    }

    let scheduler = Arc::new(GenerationScheduler::start(
        gateway.clone(),
        store.clone(),
        Duration::from_secs(settings.queue_wait_secs),
    )?);

    let led: Arc<dyn FeedbackDevice> = match settings.led_backend.as_str() {
        "sysfs" => Arc::new(SysfsRgbLed::new(&settings.led_sysfs_prefix)),
        _ => Arc::new(LogFeedback),
    };
    let session = Arc::new(SessionMachine::new(vec![led]));

    let playback: Option<Arc<dyn PlaybackDevice>> = match RodioPlayback::new() {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            tracing::warn!(error = %e, "playback unavailable");
            None
        }
    };

    let mut voice_loop = None;
    let mut push_to_talk = None;
    if settings.enable_voice_loop {
        match start_voice_loop(&settings, &store, &scheduler, &session, playback.clone()) {
            Ok((handle, ptt)) => {
                voice_loop = Some(handle);
                push_to_talk = ptt;
            }
            Err(e) => tracing::warn!(error = %e, "voice loop not started"),
        }
    }

    let app = AppState {
        store,
        samples,
        gateway,
        scheduler,
        session,
        playback,
        push_to_talk,
        capture: Some(open_capture()),
        default_language: settings.default_language.clone(),
    };

    let _conn = if settings.enable_dbus {
        let conn = Builder::session()
            .map_err(dbus_err)?
            .name(BUS_NAME)
            .map_err(dbus_err)?
            .serve_at(OBJECT_PATH, VoxcloneService { app: app.clone() })
            .map_err(dbus_err)?
            .build()
            .await
            .map_err(dbus_err)?;
        tracing::info!(name = BUS_NAME, "D-Bus service running");
        Some(conn)
    } else {
        None
    };

    if settings.enable_http {
        let app = app.clone();
        let host = settings.http_host.clone();
        let port = settings.http_port;
        let max_upload = settings.max_sample_bytes();
        tokio::spawn(async move {
            if let Err(e) = http::serve(app, &host, port, max_upload).await {
                tracing::error!(error = %e, "HTTP API stopped");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    if let Some(VoiceLoopHandle { stop, done }) = voice_loop {
        stop.stop();
        if tokio::time::timeout(VOICE_LOOP_SHUTDOWN, done).await.is_err() {
            tracing::warn!("voice loop did not stop in time; exiting anyway");
        }
    }
    Ok(())
}

/// Microphone access for one-off recordings
fn open_capture() -> CaptureFactory {
    Arc::new(|| -> Result<Box<dyn CaptureDevice>> { Ok(Box::new(CpalCapture::new()?)) })
}

/// Wire capture, STT, responder and playback into a loop on its own thread
fn start_voice_loop(
    settings: &Settings,
    store: &Arc<ProfileStore>,
    scheduler: &Arc<GenerationScheduler>,
    session: &Arc<SessionMachine>,
    playback: Option<Arc<dyn PlaybackDevice>>,
) -> Result<(VoiceLoopHandle, Option<PushToTalkHandle>)> {
    let profile = store.find(&settings.active_profile)?;
    let playback =
        playback.ok_or_else(|| Error::Playback("voice loop needs a playback device".to_string()))?;

    let responder: Arc<dyn Responder> = match settings.responder.as_str() {
        "ollama" => Arc::new(OllamaResponder::new(&settings.ollama_url, &settings.ollama_model)?),
        _ => Arc::new(EchoResponder),
    };
    let transcriber = Arc::new(WhisperBackend::new(
        &settings.whisper_model_path,
        &settings.whisper_language,
    ));

    let capture = CpalCapture::new()?;
    let max_duration = Duration::from_millis(settings.vad_max_duration_ms);
    let mut ptt_handle = None;
    let mut producer: Box<dyn UtteranceProducer> = match settings.capture_mode.as_str() {
        "push_to_talk" => {
            let (ptt, handle) = PushToTalk::new(capture, max_duration);
            ptt_handle = Some(handle);
            Box::new(ptt)
        }
        _ => Box::new(VadProducer::new(
            capture,
            VadConfig {
                speech_threshold: settings.vad_speech_threshold,
                silence_threshold: settings.vad_silence_threshold,
                silence_duration: Duration::from_millis(settings.vad_silence_duration_ms),
                max_duration,
                ..VadConfig::default()
            },
        )),
    };

    let device = (!settings.playback_device.is_empty()).then(|| settings.playback_device.clone());
    let voice = VoiceLoop::new(
        transcriber,
        scheduler.clone(),
        session.clone(),
        playback,
        responder,
        store.clone(),
        VoiceLoopConfig {
            profile_id: profile.profile_id.clone(),
            language: settings.default_language.clone(),
            volume: settings.playback_volume,
            device,
            stop_phrases: settings.stop_phrases.clone(),
            error_hold: Duration::from_secs(1),
        },
        tokio::runtime::Handle::current(),
    );
    let stop = voice.stop_handle();

    tracing::info!(profile_id = %profile.profile_id, mode = %settings.capture_mode, "starting voice loop");
    // A plain thread, so a wedged capture never holds up runtime shutdown
    let (done_tx, done) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("voice-loop".to_string())
        .spawn(move || {
            voice.run(producer.as_mut());
            let _ = done_tx.send(());
        })
        .map_err(|e| Error::Capture(format!("failed to spawn voice loop thread: {}", e)))?;

    Ok((VoiceLoopHandle { stop, done }, ptt_handle))
}
