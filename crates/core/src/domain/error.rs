use serde::{Deserialize, Serialize};

/// アプリケーション共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_UPSTREAM")]
    Upstream,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_TRANSCRIPTION")]
    Transcription,
    #[serde(rename = "E_PLAYBACK_BLOCKED")]
    PlaybackBlocked,
    #[serde(rename = "E_CONTRACT_VIOLATION")]
    ContractViolation,
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_VALIDATION")]
    Validation,
    #[serde(rename = "E_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "E_STORAGE")]
    Storage,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upstream => "E_UPSTREAM",
            Self::Timeout => "E_TIMEOUT",
            Self::Transcription => "E_TRANSCRIPTION",
            Self::PlaybackBlocked => "E_PLAYBACK_BLOCKED",
            Self::ContractViolation => "E_CONTRACT_VIOLATION",
            Self::NotFound => "E_NOT_FOUND",
            Self::Validation => "E_VALIDATION",
            Self::InvalidState => "E_INVALID_STATE",
            Self::Storage => "E_STORAGE",
            Self::Internal => "E_INTERNAL",
        }
    }
}

/// アプリケーションエラー（HTTPレスポンス / プレイヤーイベント兼用）
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl AppError {
    /// コードから復元する（HTTPクライアント側）
    pub fn with_code(code: ErrorCode, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            ErrorCode::Upstream => Self::upstream(msg),
            ErrorCode::Timeout => Self::timeout(msg),
            ErrorCode::Transcription => Self::transcription(msg),
            ErrorCode::PlaybackBlocked => Self::playback_blocked(msg),
            ErrorCode::ContractViolation => Self::contract_violation(msg),
            ErrorCode::NotFound => Self::not_found(msg),
            ErrorCode::Validation => Self::validation(msg),
            ErrorCode::InvalidState => Self::invalid_state(msg),
            ErrorCode::Storage => Self::storage(msg),
            ErrorCode::Internal => Self::internal(msg),
        }
    }

    /// 物語生成・音声合成の上流APIエラー
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Upstream,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Timeout,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn transcription(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Transcription,
            message: msg.into(),
            recoverable: true,
        }
    }

    /// 自動再生がブロックされた（ユーザー操作が必要）
    pub fn playback_blocked(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::PlaybackBlocked,
            message: msg.into(),
            recoverable: true,
        }
    }

    /// 物語エンジンの出力が契約（選択肢ちょうど2つ等）を満たさない
    pub fn contract_violation(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ContractViolation,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidState,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Storage,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: msg.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
