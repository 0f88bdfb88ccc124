pub mod config;
pub mod error;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use es_core::domain::error::AppError;
use es_core::domain::stt::SttEngine;
use es_core::infra::narration::{NarrationEngine, OpenAiNarrator, ScriptedNarrator};
use es_core::infra::storage::open_store;
use es_core::infra::stt::{FixedTranscriber, OpenAiWhisper};
use es_core::infra::synthesis::{ElevenLabsSynthesizer, SilentSynthesizer, VoiceSynthesizer};
use es_core::usecase::story_service::StoryService;

use crate::config::ServerConfig;
use crate::http::AppState;

/// 物語エンジンを構築する（APIキーがなければ定型文エンジン）
fn create_narrator(config: &ServerConfig) -> Result<Arc<dyn NarrationEngine>, AppError> {
    if let Some(key) = &config.openai_api_key {
        let mut narrator = OpenAiNarrator::new(key.clone(), Duration::from_secs(60))?;
        if let Some(model) = &config.narration_model {
            narrator = narrator.with_model(model.clone());
        }
        log::info!("OpenAI narrator selected");
        return Ok(Arc::new(narrator));
    }
    log::warn!("OPENAI_API_KEY not set, falling back to scripted narrator");
    Ok(Arc::new(ScriptedNarrator::new()))
}

fn create_synthesizer(config: &ServerConfig) -> Result<Arc<dyn VoiceSynthesizer>, AppError> {
    if let Some(key) = &config.elevenlabs_api_key {
        log::info!("ElevenLabs synthesizer selected");
        return Ok(Arc::new(ElevenLabsSynthesizer::new(
            key.clone(),
            Duration::from_secs(120),
        )?));
    }
    log::warn!("ELEVENLABS_API_KEY not set, falling back to silent synthesizer");
    Ok(Arc::new(SilentSynthesizer::new()))
}

fn create_transcriber(config: &ServerConfig) -> Result<Arc<dyn SttEngine>, AppError> {
    if let Some(key) = &config.openai_api_key {
        log::info!("Whisper transcription selected");
        return Ok(Arc::new(OpenAiWhisper::new(key.clone(), Duration::from_secs(30))?));
    }
    log::warn!("OPENAI_API_KEY not set, transcription returns empty text");
    Ok(Arc::new(FixedTranscriber::default()))
}

pub fn build_service(config: &ServerConfig) -> Result<StoryService, AppError> {
    let store = open_store(&config.db_path)?;
    Ok(StoryService::new(
        Arc::from(store),
        create_narrator(config)?,
        create_synthesizer(config)?,
        create_transcriber(config)?,
    )
    .with_contract_retries(config.contract_retries))
}

/// HTTP サーバーを起動し、終了まで待つ
pub async fn run(config: ServerConfig) -> Result<(), AppError> {
    let service = Arc::new(build_service(&config)?);
    let app = http::router(AppState {
        service,
        music_dir: config.music_dir.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| AppError::internal(format!("bind {}: {e}", config.bind_addr)))?;
    log::info!("Eternal Storyteller listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::internal(format!("server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_service_builds() {
        let config = ServerConfig::from_lookup(|key| match key {
            "ES_DB_PATH" => Some(":memory:".to_string()),
            _ => None,
        })
        .unwrap();
        let service = build_service(&config).unwrap();
        assert_eq!(service.voices().len(), 3);
    }
}
