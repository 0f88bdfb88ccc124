pub mod elevenlabs;
mod silent;
pub mod voices;

pub use elevenlabs::ElevenLabsSynthesizer;
pub use silent::SilentSynthesizer;

use async_trait::async_trait;

use crate::domain::error::AppError;

/// 音声合成エラー
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Synthesizer not available: {0}")]
    NotAvailable(String),
    #[error("Synthesis failed: {0}")]
    Failed(String),
    #[error("Synthesis timeout")]
    Timeout,
}

impl From<SynthesisError> for AppError {
    fn from(e: SynthesisError) -> Self {
        match e {
            SynthesisError::Timeout => AppError::timeout(e.to_string()),
            _ => AppError::upstream(e.to_string()),
        }
    }
}

/// 音声合成 trait。返り値は audio/mpeg のバイト列
#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, SynthesisError>;

    fn name(&self) -> &str;
}
