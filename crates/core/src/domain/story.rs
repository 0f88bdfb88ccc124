use async_trait::async_trait;

use super::error::AppError;
use super::settings::PlayerSettings;
use super::stt::{AudioClip, Transcript};
use super::types::{Chapter, NewStory, Story};

/// プレイヤーから見た物語サーバーの窓口
///
/// HTTPクライアント (`infra::api_client`) とプロセス内の `StoryService` が実装する。
#[async_trait]
pub trait StoryGateway: Send + Sync {
    async fn create_story(&self, req: NewStory) -> Result<Story, AppError>;

    /// 次のチャプターを生成する。`previous_choice` は直前に確定した選択肢ラベル
    async fn generate_chapter(
        &self,
        story_id: u64,
        previous_choice: Option<String>,
    ) -> Result<Chapter, AppError>;

    /// チャプター音声を取得する。音声がなければ None
    async fn fetch_audio(&self, chapter: &Chapter) -> Result<Option<Vec<u8>>, AppError>;

    /// 確定した選択をチャプターに記録する
    async fn record_choice(&self, chapter_id: u64, choice: &str) -> Result<Chapter, AppError>;

    async fn settings(&self) -> Result<PlayerSettings, AppError>;

    async fn transcribe(&self, clip: AudioClip) -> Result<Transcript, AppError>;
}
