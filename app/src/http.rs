use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use es_core::domain::error::AppError;
use es_core::domain::settings::PlayerSettings;
use es_core::domain::stt::AudioClip;
use es_core::domain::types::{Chapter, Genre, MusicTrack, NewStory, Story, Voice};
use es_core::infra::metrics::MetricsSummary;
use es_core::infra::stt::openai_whisper::MAX_UPLOAD_BYTES;
use es_core::usecase::story_service::StoryService;

use crate::error::ApiError;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StoryService>,
    pub music_dir: PathBuf,
}

pub fn router(state: AppState) -> Router {
    let music = ServeDir::new(&state.music_dir);

    Router::new()
        // Stories
        .route("/api/stories", post(create_story).get(list_stories))
        .route("/api/stories/:id", get(get_story))
        .route(
            "/api/stories/:id/chapters",
            post(create_chapter).get(list_chapters),
        )
        // Chapters
        .route("/api/chapters/:id", get(get_chapter).patch(record_choice))
        .route("/api/chapters/:id/audio", get(chapter_audio))
        // Voice / transcription
        .route("/api/voices", get(list_voices))
        .route(
            "/api/transcribe",
            post(transcribe).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1024 * 1024)),
        )
        // Settings / metrics / music
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/metrics", get(get_metrics))
        .route("/api/music", get(list_music))
        .nest_service("/music", music)
        .route("/health", get(health))
        .layer(middleware::from_fn(log_requests))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    if path.starts_with("/api") {
        log::info!(
            target: "http",
            "{method} {path} {} in {}ms",
            response.status().as_u16(),
            start.elapsed().as_millis()
        );
    }
    response
}

// ==================== Stories ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStoryBody {
    genre: String,
    #[serde(alias = "voice")]
    voice_id: String,
    #[serde(default)]
    title: Option<String>,
}

async fn create_story(
    State(state): State<AppState>,
    body: Result<Json<CreateStoryBody>, JsonRejection>,
) -> ApiResult<Story> {
    let Json(body) = body?;
    let genre: Genre = body.genre.parse()?;
    let story = state.service.create_story(NewStory {
        genre,
        voice_id: body.voice_id,
        title: body.title,
    })?;
    Ok(Json(story))
}

async fn list_stories(State(state): State<AppState>) -> ApiResult<Vec<Story>> {
    Ok(Json(state.service.list_stories()?))
}

async fn get_story(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
) -> ApiResult<Story> {
    let Path(id) = id?;
    Ok(Json(state.service.get_story(id)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChapterBody {
    #[serde(default)]
    previous_choice: Option<String>,
}

/// 本文は省略可
async fn create_chapter(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
    body: Bytes,
) -> ApiResult<Chapter> {
    let Path(id) = id?;
    let body: GenerateChapterBody = if body.iter().all(u8::is_ascii_whitespace) {
        GenerateChapterBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::validation(format!("invalid request body: {e}")))?
    };
    let chapter = state
        .service
        .generate_chapter(id, body.previous_choice)
        .await?;
    Ok(Json(chapter))
}

async fn list_chapters(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
) -> ApiResult<Vec<Chapter>> {
    let Path(id) = id?;
    Ok(Json(state.service.list_chapters(id)?))
}

// ==================== Chapters ====================

async fn get_chapter(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
) -> ApiResult<Chapter> {
    let Path(id) = id?;
    Ok(Json(state.service.get_chapter(id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordChoiceBody {
    user_choice: String,
}

async fn record_choice(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
    body: Result<Json<RecordChoiceBody>, JsonRejection>,
) -> ApiResult<Chapter> {
    let Path(id) = id?;
    let Json(body) = body?;
    Ok(Json(state.service.record_choice(id, &body.user_choice)?))
}

async fn chapter_audio(
    State(state): State<AppState>,
    id: Result<Path<u64>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = id?;
    let audio = state.service.chapter_audio(id)?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response())
}

// ==================== Voices / Transcription ====================

async fn list_voices(State(state): State<AppState>) -> Json<Vec<Voice>> {
    Json(state.service.voices())
}

#[derive(Debug, Serialize)]
struct TranscribeResponse {
    text: String,
    success: bool,
}

/// multipart の "audio" フィールド（audio/* のみ、25MBまで）
async fn transcribe(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<TranscribeResponse> {
    let mut multipart = multipart?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("audio") {
            continue;
        }
        let mime = field.content_type().unwrap_or_default().to_string();
        if !mime.starts_with("audio/") {
            return Err(AppError::validation("Only audio files are allowed").into());
        }
        let file_name = field.file_name().unwrap_or("recording.webm").to_string();
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(AppError::validation("No audio file provided").into());
        }
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(AppError::validation("Audio file exceeds 25MB").into());
        }

        let clip = AudioClip::from_encoded(bytes.to_vec(), mime, file_name);
        let transcript = state.service.transcribe(clip).await?;
        return Ok(Json(TranscribeResponse {
            text: transcript.text,
            success: true,
        }));
    }
    Err(AppError::validation("No audio file provided").into())
}

// ==================== Settings / Metrics / Music ====================

async fn get_settings(State(state): State<AppState>) -> ApiResult<PlayerSettings> {
    Ok(Json(state.service.get_settings()?))
}

async fn update_settings(
    State(state): State<AppState>,
    body: Result<Json<PlayerSettings>, JsonRejection>,
) -> ApiResult<PlayerSettings> {
    let Json(settings) = body?;
    Ok(Json(state.service.update_settings(settings)?))
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSummary> {
    Json(state.service.metrics())
}

async fn list_music(State(state): State<AppState>) -> Json<Vec<MusicTrack>> {
    Json(music_tracks(&state.music_dir).await)
}

const MUSIC_EXTENSIONS: [&str; 4] = ["mp3", "ogg", "wav", "m4a"];

/// 音楽ディレクトリの曲一覧（名前順）。ディレクトリがなければ空
pub async fn music_tracks(dir: &FsPath) -> Vec<MusicTrack> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Music directory {} unavailable: {e}", dir.display());
            return Vec::new();
        }
    };

    let mut tracks = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_audio = FsPath::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| MUSIC_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_audio {
            tracks.push(MusicTrack {
                url: format!("/music/{name}"),
                name,
            });
        }
    }
    tracks.sort_by(|a, b| a.name.cmp(&b.name));
    tracks
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use es_core::infra::narration::ScriptedNarrator;
    use es_core::infra::storage::MemoryStore;
    use es_core::infra::stt::FixedTranscriber;
    use es_core::infra::synthesis::SilentSynthesizer;
    use tower::ServiceExt;

    fn app() -> Router {
        let service = StoryService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedNarrator::new()),
            Arc::new(SilentSynthesizer::new()),
            Arc::new(FixedTranscriber::new("the first one")),
        );
        router(AppState {
            service: Arc::new(service),
            music_dir: PathBuf::from("does-not-exist"),
        })
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: Method, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_request(mime: &str, data: &[u8]) -> axum::http::Request<Body> {
        let boundary = "story-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"clip.webm\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/transcribe")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_story_and_chapter_flow() {
        let app = app();

        let res = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/stories",
                serde_json::json!({ "genre": "fantasy", "voice": "sarah" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let story = body_json(res).await;
        assert_eq!(story["voiceId"], "sarah");
        assert_eq!(story["currentChapterIndex"], 1);
        assert!(!story["title"].as_str().unwrap().is_empty());

        let res = app
            .clone()
            .oneshot(empty_request(Method::POST, "/api/stories/1/chapters"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let chapter = body_json(res).await;
        assert_eq!(chapter["choices"].as_array().unwrap().len(), 2);
        assert_eq!(chapter["audioRef"], "/api/chapters/1/audio");

        let res = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/chapters/1/audio"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "audio/mpeg");

        let label = chapter["choices"][0]["label"].as_str().unwrap().to_string();
        let res = app
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                "/api/chapters/1",
                serde_json::json!({ "userChoice": label }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["resolvedChoiceText"], label.as_str());

        let other = chapter["choices"][1]["label"].as_str().unwrap().to_string();
        let res = app
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                "/api/chapters/1",
                serde_json::json!({ "userChoice": other }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(res).await["code"], "E_INVALID_STATE");

        let res = app
            .oneshot(empty_request(Method::GET, "/api/stories/1/chapters"))
            .await
            .unwrap();
        assert_eq!(body_json(res).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_errors_are_json() {
        let app = app();
        let res = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/stories",
                serde_json::json!({ "genre": "horror", "voice": "sarah" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["code"], "E_VALIDATION");
        assert!(body["message"].as_str().unwrap().contains("horror"));

        let res = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/stories/99"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res).await["code"], "E_NOT_FOUND");

        let res = app
            .oneshot(empty_request(Method::GET, "/api/stories/abc"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_transcribe_accepts_audio_only() {
        let app = app();
        let res = app
            .clone()
            .oneshot(multipart_request("text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(multipart_request("audio/webm", &[1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["text"], "the first one");
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_settings_voices_and_health() {
        let app = app();
        let res = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/api/settings",
                serde_json::json!({ "choiceTimeoutSecs": 1000, "voiceChoiceEnabled": true }),
            ))
            .await
            .unwrap();
        let settings = body_json(res).await;
        assert_eq!(settings["choiceTimeoutSecs"], 600);
        assert_eq!(settings["voiceChoiceEnabled"], true);

        let res = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/voices"))
            .await
            .unwrap();
        assert_eq!(body_json(res).await.as_array().unwrap().len(), 3);

        let res = app
            .clone()
            .oneshot(empty_request(Method::GET, "/api/music"))
            .await
            .unwrap();
        assert_eq!(body_json(res).await, serde_json::json!([]));

        let res = app
            .oneshot(empty_request(Method::GET, "/health"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
