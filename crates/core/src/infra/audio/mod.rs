#[cfg(feature = "microphone")]
pub mod capture;
mod scripted;
pub mod speech_gate;
pub mod wav;

#[cfg(feature = "microphone")]
pub use capture::MicrophoneCapture;
pub use scripted::ScriptedCapture;
pub use speech_gate::{SpeechGate, SpeechGateConfig};

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::stt::AudioClip;

/// 音声キャプチャエラー
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoDevice,
    #[error("Audio device config error: {0}")]
    Config(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// 固定長の録音ウィンドウを取るマイク抽象
///
/// 返した future を drop すると録音は中断される。
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn record(&self, window: Duration) -> Result<AudioClip, CaptureError>;
}
