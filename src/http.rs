//! HTTP surface: a thin adapter from routes onto the core operations.
//!
//! Every response is a JSON envelope with `success`; failures carry
//! `error.kind` from the shared error taxonomy. Generation returns raw WAV.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::app::{blocking, AppState, DEFAULT_RECORDING_SECS};
use crate::error::Error;
use crate::profiles::Profile;
use crate::samples::SampleUpload;

/// Build the API router
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/engine/warm", post(warm_engine))
        .route("/api/engine/reload", post(reload_engine))
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/profiles/{id}",
            get(get_profile).patch(update_profile).delete(delete_profile),
        )
        .route("/api/profiles/{id}/samples", post(add_sample))
        .route("/api/profiles/{id}/samples/record", post(record_sample))
        .route("/api/profiles/{id}/samples/{filename}", delete(remove_sample))
        .route("/api/generate", post(generate))
        // Base64 sample uploads inflate by a third
        .layer(DefaultBodyLimit::max(max_upload_bytes + max_upload_bytes / 2))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the task is dropped
pub async fn serve(state: AppState, host: &str, port: u16, max_upload_bytes: usize) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, router(state, max_upload_bytes)).await?;
    Ok(())
}

/// Error envelope for every route
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Validation(_) | Error::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InsufficientSamples(_) | Error::StaleProfile(_) | Error::PartialDelete { .. } => {
            StatusCode::CONFLICT
        }
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        let body = json!({
            "success": false,
            "error": { "kind": self.0.kind(), "message": self.0.to_string() },
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ProfileView {
    #[serde(flatten)]
    profile: Profile,
    sample_count: usize,
}

impl From<Profile> for ProfileView {
    fn from(profile: Profile) -> Self {
        let sample_count = profile.sample_count();
        Self {
            profile,
            sample_count,
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "status": state.status() }))
}

async fn warm_engine(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let engine = state.warm_engine().await?;
    Ok(Json(json!({ "success": true, "engine": engine })))
}

async fn reload_engine(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let engine = state.reload_engine().await?;
    Ok(Json(json!({ "success": true, "engine": engine })))
}

async fn list_profiles(State(state): State<AppState>) -> Json<serde_json::Value> {
    let profiles: Vec<ProfileView> = state.store.list().into_iter().map(Into::into).collect();
    Json(json!({ "success": true, "profiles": profiles }))
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub filename: String,
    /// Base64-encoded audio file
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProfileBody {
    pub name: String,
    #[serde(default)]
    pub assistant_prompt: Option<String>,
    #[serde(default)]
    pub samples: Vec<UploadBody>,
}

async fn create_profile(
    State(state): State<AppState>,
    Json(body): Json<CreateProfileBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let uploads = body
        .samples
        .into_iter()
        .map(|u| {
            STANDARD
                .decode(u.data.as_bytes())
                .map(|bytes| SampleUpload {
                    bytes,
                    hint_name: u.filename,
                })
                .map_err(|e| Error::Validation(format!("sample data is not base64: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let samples = state.samples.clone();
    let name = body.name;
    let prompt = body.assistant_prompt;
    let profile = blocking(move || samples.create_profile(&name, prompt, uploads)).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "profile": ProfileView::from(profile) })),
    ))
}

async fn get_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let profile = state.store.find(&id)?;
    Ok(Json(json!({ "success": true, "profile": ProfileView::from(profile) })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileBody {
    #[serde(default)]
    pub name: Option<String>,
    /// An empty string clears the prompt
    #[serde(default)]
    pub assistant_prompt: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateProfileBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let store = state.store.clone();
    let profile = blocking(move || {
        let mut profile = store.get(&id)?;
        if let Some(name) = body.name {
            profile = store.rename(&id, &name)?;
        }
        if let Some(prompt) = body.assistant_prompt {
            profile = store.update_prompt(&id, Some(prompt))?;
        }
        Ok(profile)
    })
    .await?;
    Ok(Json(json!({ "success": true, "profile": ProfileView::from(profile) })))
}

async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let store = state.store.clone();
    blocking(move || store.delete(&id)).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct SampleQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// Raw audio body; `?name=` is the suggested filename
async fn add_sample(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SampleQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let samples = state.samples.clone();
    let hint = query.name.unwrap_or_default();
    let asset = blocking(move || samples.add(&id, &body, &hint)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "sample": asset })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub seconds: Option<f64>,
}

/// Record from the server's microphone; `?seconds=` defaults to 10
async fn record_sample(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RecordQuery>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let seconds = query.seconds.unwrap_or(DEFAULT_RECORDING_SECS);
    let asset = state.record_sample(&id, seconds).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "sample": asset })),
    ))
}

async fn remove_sample(
    State(state): State<AppState>,
    Path((id, filename)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let samples = state.samples.clone();
    blocking(move || samples.remove(&id, &filename)).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    /// Profile id or name
    pub profile_id: String,
    pub text: String,
    #[serde(default)]
    pub language: String,
}

async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> ApiResult<Response> {
    let audio = state
        .generate(&body.profile_id, &body.text, &body.language)
        .await?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "audio/wav")], audio).into_response())
}
