use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AudioClip, SttContext, SttEngine, SttError, Transcript};

/// FixedTranscriber: 積まれた結果を順に返すモック実装。
/// キューが空なら既定のテキストを返す。APIキー未設定時のフォールバック。
pub struct FixedTranscriber {
    default_text: String,
    queued: Mutex<VecDeque<Result<Transcript, SttError>>>,
}

impl FixedTranscriber {
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            default_text: default_text.into(),
            queued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, result: Result<Transcript, SttError>) {
        self.queued.lock().push_back(result);
    }
}

impl Default for FixedTranscriber {
    fn default() -> Self {
        Self::new("")
    }
}

#[async_trait]
impl SttEngine for FixedTranscriber {
    async fn transcribe(&self, _clip: &AudioClip, _ctx: &SttContext) -> Result<Transcript, SttError> {
        if let Some(result) = self.queued.lock().pop_front() {
            return result;
        }
        Ok(Transcript::new(self.default_text.clone()))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}
