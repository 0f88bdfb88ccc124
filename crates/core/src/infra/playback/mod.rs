mod simulated;

pub use simulated::SimulatedPlayback;

use tokio::sync::mpsc;

use crate::domain::error::AppError;

/// 読み込んだ音源ごとに振られるトークン。古いトークンのイベントは捨てる
pub type SourceToken = u64;

/// 再生する音源
#[derive(Debug, Clone)]
pub enum AudioSource {
    Bytes { data: Vec<u8>, mime: String },
    Url(String),
}

impl AudioSource {
    pub fn mpeg(data: Vec<u8>) -> Self {
        Self::Bytes {
            data,
            mime: "audio/mpeg".to_string(),
        }
    }
}

/// バックエンドが発するイベント（すべてトークン付き）
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Ready { token: SourceToken, duration_secs: f64 },
    Progress { token: SourceToken, position_secs: f64 },
    /// 自然終了のみ。stop や load では発しない
    Ended { token: SourceToken },
    Error { token: SourceToken, message: String },
}

impl BackendEvent {
    pub fn token(&self) -> SourceToken {
        match self {
            Self::Ready { token, .. }
            | Self::Progress { token, .. }
            | Self::Ended { token }
            | Self::Error { token, .. } => *token,
        }
    }
}

/// 再生エラー
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    /// 自動再生が拒否された（ユーザー操作が必要）
    #[error("Playback blocked: {0}")]
    Blocked(String),
    #[error("No source loaded")]
    NotLoaded,
    #[error("Unsupported source: {0}")]
    Unsupported(String),
    #[error("Playback backend error: {0}")]
    Backend(String),
}

impl From<PlaybackError> for AppError {
    fn from(e: PlaybackError) -> Self {
        match e {
            PlaybackError::Blocked(msg) => AppError::playback_blocked(msg),
            PlaybackError::NotLoaded => AppError::invalid_state(e.to_string()),
            PlaybackError::Unsupported(_) => AppError::validation(e.to_string()),
            PlaybackError::Backend(_) => AppError::internal(e.to_string()),
        }
    }
}

/// プラットフォーム側の音声出力
pub trait AudioPlayback: Send + Sync {
    /// 音源を読み込む。以前の音源は破棄され、その後のイベントは新しいトークンで届く
    fn load(
        &self,
        token: SourceToken,
        source: AudioSource,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<(), PlaybackError>;

    fn play(&self) -> Result<(), PlaybackError>;

    fn pause(&self);

    fn seek(&self, position_secs: f64);

    /// 出力ゲイン (0.0〜1.0)。再生位置には影響しない
    fn set_gain(&self, gain: f32);

    /// 再生を止めて音源を外す
    fn stop(&self);
}
