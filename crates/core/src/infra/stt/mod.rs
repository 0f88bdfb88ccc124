mod noop;
pub mod openai_whisper;

pub use noop::FixedTranscriber;
pub use openai_whisper::OpenAiWhisper;

pub use crate::domain::stt::{AudioClip, SttContext, SttEngine, SttError, Transcript};

use crate::domain::error::AppError;

impl From<SttError> for AppError {
    fn from(e: SttError) -> Self {
        match e.kind {
            crate::domain::stt::SttErrorKind::Timeout => AppError::timeout(e.to_string()),
            crate::domain::stt::SttErrorKind::AudioFormat => AppError::validation(e.to_string()),
            _ => AppError::transcription(e.to_string()),
        }
    }
}
