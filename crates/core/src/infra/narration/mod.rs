pub mod openai;
pub mod prompts;
mod scripted;

pub use openai::OpenAiNarrator;
pub use scripted::ScriptedNarrator;

use async_trait::async_trait;

use crate::domain::error::AppError;
use crate::domain::types::{Choice, Genre};

/// 物語生成エラー
#[derive(Debug, thiserror::Error)]
pub enum NarrationError {
    #[error("Narrator not available: {0}")]
    NotAvailable(String),
    #[error("Narration failed: {0}")]
    Failed(String),
    /// 応答は返ったが形式が期待と違う
    #[error("Malformed narration: {0}")]
    Malformed(String),
    #[error("Narration timeout")]
    Timeout,
}

impl From<NarrationError> for AppError {
    fn from(e: NarrationError) -> Self {
        match e {
            NarrationError::Timeout => AppError::timeout(e.to_string()),
            NarrationError::Malformed(_) => AppError::contract_violation(e.to_string()),
            NarrationError::NotAvailable(_) | NarrationError::Failed(_) => {
                AppError::upstream(e.to_string())
            }
        }
    }
}

/// 物語生成リクエスト
#[derive(Debug, Clone)]
pub struct NarrationRequest {
    pub genre: Genre,
    pub chapter_index: u32,
    pub previous_choice_text: Option<String>,
    pub prior_state: serde_json::Value,
    /// 再生成の回数（初回は 0）
    pub attempt: u32,
}

/// 物語生成結果（選択肢の個数はまだ検証していない）
#[derive(Debug, Clone)]
pub struct NarrationOutput {
    pub text: String,
    pub choices: Vec<Choice>,
}

/// 物語エンジン trait
#[async_trait]
pub trait NarrationEngine: Send + Sync {
    async fn narrate(&self, req: &NarrationRequest) -> Result<NarrationOutput, NarrationError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;

    #[test]
    fn test_error_mapping() {
        assert_eq!(AppError::from(NarrationError::Timeout).code, ErrorCode::Timeout);
        assert_eq!(
            AppError::from(NarrationError::Malformed("no choices".into())).code,
            ErrorCode::ContractViolation
        );
        assert_eq!(
            AppError::from(NarrationError::Failed("500".into())).code,
            ErrorCode::Upstream
        );
    }
}
