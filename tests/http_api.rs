use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

use voxclone::app::AppState;
use voxclone::audio;
use voxclone::backends::{SynthesisBackend, SynthesisRequest};
use voxclone::ear::CaptureDevice;
use voxclone::gateway::SynthesisGateway;
use voxclone::profiles::ProfileStore;
use voxclone::samples::SampleManager;
use voxclone::scheduler::GenerationScheduler;
use voxclone::session::SessionMachine;

/// Emits a short silent WAV per request
struct SilentBackend;

impl SynthesisBackend for SilentBackend {
    fn id(&self) -> &'static str {
        "silent"
    }

    fn load(&mut self) -> voxclone::Result<()> {
        Ok(())
    }

    fn synthesize(&mut self, request: &SynthesisRequest) -> voxclone::Result<Vec<u8>> {
        assert!(!request.references.is_empty());
        audio::pcm16_to_wav(&[0; 220], 22050)
    }
}

/// A microphone that hears a steady hum
struct HummingMic;

impl CaptureDevice for HummingMic {
    fn start(&mut self) -> voxclone::Result<()> {
        Ok(())
    }

    fn read_chunk(&mut self) -> voxclone::Result<Option<Vec<i16>>> {
        Ok(Some(vec![900; 1600]))
    }

    fn stop(&mut self) {}

    fn level(&self) -> f32 {
        0.03
    }

    fn sample_rate(&self) -> u32 {
        16000
    }
}

fn tone_wav() -> Vec<u8> {
    let samples: Vec<i16> = (0..4410).map(|i| ((i as f32 * 0.07).sin() * 6000.0) as i16).collect();
    audio::pcm16_to_wav(&samples, 22050).unwrap()
}

fn app() -> (TempDir, Router) {
    let dir = tempdir().unwrap();
    let store = Arc::new(ProfileStore::open(dir.path()).unwrap());
    let samples = Arc::new(SampleManager::new(store.clone(), 22050, 1024 * 1024));
    let gateway = Arc::new(SynthesisGateway::new(Box::new(SilentBackend)));
    let scheduler = Arc::new(
        GenerationScheduler::start(gateway.clone(), store.clone(), Duration::from_secs(5)).unwrap(),
    );
    let state = AppState {
        store,
        samples,
        gateway,
        scheduler,
        session: Arc::new(SessionMachine::new(Vec::new())),
        playback: None,
        push_to_talk: None,
        capture: Some(Arc::new(|| -> voxclone::Result<Box<dyn CaptureDevice>> {
            Ok(Box::new(HummingMic))
        })),
        default_language: "en".to_string(),
    };
    (dir, voxclone::http::router(state, 1024 * 1024))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn create(app: &Router, name: &str, with_sample: bool) -> String {
    let samples = if with_sample {
        json!([{ "filename": "ref.wav", "data": STANDARD.encode(tone_wav()) }])
    } else {
        json!([])
    };
    let (status, body) = send(
        app,
        Method::POST,
        "/api/profiles",
        Some(json!({ "name": name, "samples": samples })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["profile"]["profile_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn profile_crud_round_trip() {
    let (_dir, app) = app();
    let id = create(&app, "Narrator", true).await;

    let (status, body) = send(&app, Method::GET, "/api/profiles", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["profiles"][0]["name"], "Narrator");
    assert_eq!(body["profiles"][0]["sample_count"], 1);

    let (status, body) = send(
        &app,
        Method::PATCH,
        &format!("/api/profiles/{}", id),
        Some(json!({ "name": "Storyteller", "assistant_prompt": "Be brief." })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["profile"]["name"], "Storyteller");
    assert_eq!(body["profile"]["assistant_prompt"], "Be brief.");

    let (status, _) = send(&app, Method::DELETE, &format!("/api/profiles/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, &format!("/api/profiles/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn raw_sample_upload_and_removal() {
    let (_dir, app) = app();
    let id = create(&app, "Uploader", false).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/profiles/{}/samples?name=take%201.wav", id))
        .body(Body::from(tone_wav()))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let filename = body["sample"]["filename"].as_str().unwrap().to_string();
    assert!(filename.ends_with(".wav"));
    assert!(!filename.contains(' '));

    let uri = format!("/api/profiles/{}/samples/{}", id, filename);
    assert_eq!(send(&app, Method::DELETE, &uri, None).await.0, StatusCode::OK);
    // Removing again is still fine
    assert_eq!(send(&app, Method::DELETE, &uri, None).await.0, StatusCode::OK);

    let (_, body) = send(&app, Method::GET, &format!("/api/profiles/{}", id), None).await;
    assert_eq!(body["profile"]["sample_count"], 0);
}

#[tokio::test]
async fn failures_carry_error_kinds() {
    let (_dir, app) = app();
    let empty = create(&app, "Empty", false).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/profiles",
        Some(json!({ "name": "Bad", "samples": [{ "filename": "x.wav", "data": "!!!" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/api/profiles/{}/samples", empty))
        .body(Body::from("definitely not audio"))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/generate",
        Some(json!({ "profile_id": empty, "text": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "insufficient_samples");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/generate",
        Some(json!({ "profile_id": "profile_missing", "text": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn generate_returns_wav() {
    let (_dir, app) = app();
    create(&app, "Speaker", true).await;

    // Profiles resolve by name as well as id
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "profile_id": "Speaker", "text": "Hello there" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..4], b"RIFF");

    let (status, body) = send(&app, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["backend"], "silent");
    assert_eq!(body["status"]["engine"]["status"], "ready");
    assert_eq!(body["status"]["profiles"], 1);
}

#[tokio::test]
async fn create_with_prompt_and_record_a_sample() {
    let (dir, app) = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/profiles",
        Some(json!({ "name": "Host", "assistant_prompt": "  Keep it short.  " })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["profile"]["assistant_prompt"], "Keep it short.");
    let id = body["profile"]["profile_id"].as_str().unwrap().to_string();

    // Profile and prompt are on disk together after the one create call
    let reopened = ProfileStore::open(dir.path()).unwrap();
    assert_eq!(
        reopened.get(&id).unwrap().assistant_prompt.as_deref(),
        Some("Keep it short.")
    );

    let uri = format!("/api/profiles/{}/samples/record?seconds=0.5", id);
    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let filename = body["sample"]["filename"].as_str().unwrap();
    assert!(filename.starts_with("reference_"));

    let (_, body) = send(&app, Method::GET, &format!("/api/profiles/{}", id), None).await;
    assert_eq!(body["profile"]["sample_count"], 1);

    let uri = format!("/api/profiles/{}/samples/record?seconds=-1", id);
    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/profiles/profile_missing/samples/record",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
