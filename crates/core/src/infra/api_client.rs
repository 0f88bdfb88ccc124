use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::domain::error::{AppError, ErrorCode};
use crate::domain::settings::PlayerSettings;
use crate::domain::story::StoryGateway;
use crate::domain::stt::{AudioClip, Transcript};
use crate::domain::types::{Chapter, MusicTrack, NewStory, Story, Voice};
use crate::infra::audio::wav::encode_wav;

/// 物語サーバーの HTTP クライアント
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    code: Option<ErrorCode>,
}

#[derive(Deserialize)]
struct TranscribeBody {
    text: String,
    #[serde(default)]
    success: bool,
}

impl ApiClient {
    /// チャプター生成は合成を含むので長めに待つ
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn list_voices(&self) -> Result<Vec<Voice>, AppError> {
        self.send_json(self.client.get(self.url("/api/voices"))).await
    }

    pub async fn list_music(&self) -> Result<Vec<MusicTrack>, AppError> {
        self.send_json(self.client.get(self.url("/api/music"))).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AppError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::timeout(format!("server request timed out: {e}"))
            } else {
                AppError::upstream(format!("server request failed: {e}"))
            }
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody {
                message,
                code: Some(code),
            }) => AppError::with_code(code, message),
            Ok(ErrorBody { message, code: None }) => status_error(status, message),
            Err(_) => status_error(status, format!("{status}: {body}")),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AppError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| AppError::upstream(format!("invalid server response: {e}")))
    }
}

fn status_error(status: reqwest::StatusCode, message: String) -> AppError {
    match status.as_u16() {
        400 | 413 | 415 => AppError::validation(message),
        404 => AppError::not_found(message),
        409 => AppError::invalid_state(message),
        504 => AppError::timeout(message),
        500..=599 => AppError::upstream(message),
        _ => AppError::internal(message),
    }
}

#[async_trait]
impl StoryGateway for ApiClient {
    async fn create_story(&self, req: NewStory) -> Result<Story, AppError> {
        self.send_json(self.client.post(self.url("/api/stories")).json(&req))
            .await
    }

    async fn generate_chapter(
        &self,
        story_id: u64,
        previous_choice: Option<String>,
    ) -> Result<Chapter, AppError> {
        let body = serde_json::json!({ "previousChoice": previous_choice });
        self.send_json(
            self.client
                .post(self.url(&format!("/api/stories/{story_id}/chapters")))
                .json(&body),
        )
        .await
    }

    async fn fetch_audio(&self, chapter: &Chapter) -> Result<Option<Vec<u8>>, AppError> {
        let Some(path) = &chapter.audio_ref else {
            return Ok(None);
        };
        let bytes = self
            .send(self.client.get(self.url(path)))
            .await?
            .bytes()
            .await
            .map_err(|e| AppError::upstream(format!("audio download failed: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn record_choice(&self, chapter_id: u64, choice: &str) -> Result<Chapter, AppError> {
        let body = serde_json::json!({ "userChoice": choice });
        self.send_json(
            self.client
                .patch(self.url(&format!("/api/chapters/{chapter_id}")))
                .json(&body),
        )
        .await
    }

    async fn settings(&self) -> Result<PlayerSettings, AppError> {
        self.send_json(self.client.get(self.url("/api/settings"))).await
    }

    async fn transcribe(&self, clip: AudioClip) -> Result<Transcript, AppError> {
        let (bytes, file_name, mime) = match (clip.encoded, clip.samples) {
            (Some(encoded), _) => (encoded.bytes, encoded.file_name, encoded.mime),
            (None, Some(samples)) => (
                encode_wav(&samples, clip.sample_rate).map_err(AppError::validation)?,
                format!("{}.wav", clip.id),
                "audio/wav".to_string(),
            ),
            (None, None) => return Err(AppError::validation("empty audio clip")),
        };

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&mime)
            .map_err(|e| AppError::validation(format!("invalid mime {mime}: {e}")))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let body: TranscribeBody = self
            .send_json(self.client.post(self.url("/api/transcribe")).multipart(form))
            .await?;
        if !body.success {
            return Err(AppError::transcription("server reported transcription failure"));
        }
        Ok(Transcript::new(body.text))
    }
}
