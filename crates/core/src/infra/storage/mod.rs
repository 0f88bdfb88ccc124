mod memory;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::SqliteStore;

use crate::domain::error::AppError;
use crate::domain::settings::PlayerSettings;
use crate::domain::types::{Chapter, ChapterPatch, NewChapter, NewStory, Story, StoryPatch};

/// 物語・チャプターの永続化
///
/// IDはバックエンドが1から単調増加で採番する。見つからない場合は `Ok(None)`。
pub trait ChapterStore: Send + Sync {
    /// 物語を作成する。`current_chapter_index` は 1、`state_blob` は空オブジェクトで始まる
    fn create_story(&self, req: &NewStory, now: &str) -> Result<Story, AppError>;

    fn get_story(&self, id: u64) -> Result<Option<Story>, AppError>;

    fn list_stories(&self) -> Result<Vec<Story>, AppError>;

    fn update_story(&self, id: u64, patch: &StoryPatch) -> Result<Option<Story>, AppError>;

    /// チャプターを作成する。音声があれば保存し `audio_ref` を設定する
    fn create_chapter(&self, req: &NewChapter, now: &str) -> Result<Chapter, AppError>;

    fn get_chapter(&self, id: u64) -> Result<Option<Chapter>, AppError>;

    /// チャプター番号順
    fn list_chapters_by_story(&self, story_id: u64) -> Result<Vec<Chapter>, AppError>;

    /// 選択肢は未設定のときだけ書き込む。設定済みなら変更せず現在の行を返す
    fn update_chapter(&self, id: u64, patch: &ChapterPatch) -> Result<Option<Chapter>, AppError>;

    fn chapter_audio(&self, id: u64) -> Result<Option<Vec<u8>>, AppError>;

    fn get_settings(&self) -> Result<PlayerSettings, AppError>;

    fn save_settings(&self, settings: &PlayerSettings) -> Result<(), AppError>;
}

/// 保存先パスからバックエンドを選ぶ。`:memory:` はプロセス内マップ
pub fn open_store(path: &str) -> Result<Box<dyn ChapterStore>, AppError> {
    if path == ":memory:" {
        log::info!("In-memory chapter store selected");
        return Ok(Box::new(MemoryStore::new()));
    }
    log::info!("SQLite chapter store: {path}");
    Ok(Box::new(SqliteStore::open(path)?))
}
