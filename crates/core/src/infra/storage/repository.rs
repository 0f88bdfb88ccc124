use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::ChapterStore;
use crate::domain::error::AppError;
use crate::domain::settings::PlayerSettings;
use crate::domain::types::{
    chapter_audio_ref, validate_choices, Chapter, ChapterPatch, Choice, Genre, NewChapter,
    NewStory, Story, StoryPatch,
};

const STORY_COLUMNS: &str =
    "id, genre, voice_id, title, current_chapter, story_state, created_at";

const CHAPTER_COLUMNS: &str =
    "id, story_id, chapter_number, content, audio IS NOT NULL, choices, user_choice, created_at";

/// SQLiteストレージ（stories + chapters + settings）
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// DBから読んだ生の物語行
struct StoryRow {
    id: i64,
    genre: String,
    voice_id: String,
    title: String,
    current_chapter: i64,
    story_state: String,
    created_at: String,
}

struct ChapterRow {
    id: i64,
    story_id: i64,
    chapter_number: i64,
    content: String,
    has_audio: bool,
    choices: String,
    user_choice: Option<String>,
    created_at: String,
}

impl SqliteStore {
    /// 新規接続（ファイルパス指定）
    pub fn open(path: &str) -> Result<Self, AppError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::storage(format!("DBディレクトリ作成に失敗: {e}")))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| AppError::storage(format!("DB接続に失敗: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::storage(format!("in-memory DB作成に失敗: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// スキーママイグレーション
    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .lock()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS stories (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    genre           TEXT NOT NULL,
                    voice_id        TEXT NOT NULL,
                    title           TEXT NOT NULL,
                    current_chapter INTEGER NOT NULL DEFAULT 1,
                    story_state     TEXT NOT NULL DEFAULT '{}',
                    created_at      TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chapters (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT,
                    story_id       INTEGER NOT NULL,
                    chapter_number INTEGER NOT NULL,
                    content        TEXT NOT NULL,
                    audio          BLOB,
                    choices        TEXT NOT NULL,
                    user_choice    TEXT,
                    created_at     TEXT NOT NULL,
                    FOREIGN KEY (story_id) REFERENCES stories(id)
                );

                CREATE INDEX IF NOT EXISTS idx_chapters_story
                    ON chapters(story_id, chapter_number);

                CREATE TABLE IF NOT EXISTS settings (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(|e| AppError::storage(format!("マイグレーション失敗: {e}")))?;
        Ok(())
    }

    fn map_story_row(row: &rusqlite::Row) -> rusqlite::Result<StoryRow> {
        Ok(StoryRow {
            id: row.get(0)?,
            genre: row.get(1)?,
            voice_id: row.get(2)?,
            title: row.get(3)?,
            current_chapter: row.get(4)?,
            story_state: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn map_chapter_row(row: &rusqlite::Row) -> rusqlite::Result<ChapterRow> {
        Ok(ChapterRow {
            id: row.get(0)?,
            story_id: row.get(1)?,
            chapter_number: row.get(2)?,
            content: row.get(3)?,
            has_audio: row.get(4)?,
            choices: row.get(5)?,
            user_choice: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn query_story(conn: &Connection, id: u64) -> Result<Option<Story>, AppError> {
        let row = conn
            .query_row(
                &format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1"),
                params![id as i64],
                Self::map_story_row,
            )
            .optional()
            .map_err(|e| AppError::storage(format!("物語取得失敗: {e}")))?;
        row.map(StoryRow::into_story).transpose()
    }

    fn query_chapter(conn: &Connection, id: u64) -> Result<Option<Chapter>, AppError> {
        let row = conn
            .query_row(
                &format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = ?1"),
                params![id as i64],
                Self::map_chapter_row,
            )
            .optional()
            .map_err(|e| AppError::storage(format!("チャプター取得失敗: {e}")))?;
        row.map(ChapterRow::into_chapter).transpose()
    }
}

impl StoryRow {
    fn into_story(self) -> Result<Story, AppError> {
        let genre: Genre = self
            .genre
            .parse()
            .map_err(|e: AppError| AppError::storage(format!("不正なジャンル: {}", e.message)))?;
        let state_blob = serde_json::from_str(&self.story_state)
            .map_err(|e| AppError::storage(format!("story_state 解析失敗: {e}")))?;
        Ok(Story {
            id: self.id as u64,
            genre,
            voice_id: self.voice_id,
            title: self.title,
            current_chapter_index: self.current_chapter as u32,
            state_blob,
            created_at: self.created_at,
        })
    }
}

impl ChapterRow {
    fn into_chapter(self) -> Result<Chapter, AppError> {
        let choices: Vec<Choice> = serde_json::from_str(&self.choices)
            .map_err(|e| AppError::storage(format!("choices 解析失敗: {e}")))?;
        let choices = validate_choices(choices)
            .map_err(|e| AppError::storage(format!("保存済み選択肢が不正: {}", e.message)))?;
        let id = self.id as u64;
        Ok(Chapter {
            id,
            story_id: self.story_id as u64,
            chapter_index: self.chapter_number as u32,
            text: self.content,
            audio_ref: self.has_audio.then(|| chapter_audio_ref(id)),
            choices,
            resolved_choice_text: self.user_choice,
            created_at: self.created_at,
        })
    }
}

impl ChapterStore for SqliteStore {
    fn create_story(&self, req: &NewStory, now: &str) -> Result<Story, AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stories (genre, voice_id, title, current_chapter, story_state, created_at)
             VALUES (?1, ?2, ?3, 1, '{}', ?4)",
            params![
                req.genre.as_str(),
                req.voice_id,
                req.title.clone().unwrap_or_default(),
                now
            ],
        )
        .map_err(|e| AppError::storage(format!("物語挿入失敗: {e}")))?;
        let id = conn.last_insert_rowid() as u64;
        Self::query_story(&conn, id)?
            .ok_or_else(|| AppError::storage(format!("挿入直後の物語 {id} が見つかりません")))
    }

    fn get_story(&self, id: u64) -> Result<Option<Story>, AppError> {
        Self::query_story(&self.conn.lock(), id)
    }

    fn list_stories(&self) -> Result<Vec<Story>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {STORY_COLUMNS} FROM stories ORDER BY id"))
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
        let rows = stmt
            .query_map([], Self::map_story_row)
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
        rows.into_iter().map(StoryRow::into_story).collect()
    }

    fn update_story(&self, id: u64, patch: &StoryPatch) -> Result<Option<Story>, AppError> {
        let conn = self.conn.lock();
        let state_json = patch
            .state_blob
            .as_ref()
            .map(|v| v.to_string());
        let affected = conn
            .execute(
                "UPDATE stories SET
                    title = COALESCE(?1, title),
                    current_chapter = COALESCE(?2, current_chapter),
                    story_state = COALESCE(?3, story_state)
                 WHERE id = ?4",
                params![
                    patch.title,
                    patch.current_chapter_index.map(i64::from),
                    state_json,
                    id as i64
                ],
            )
            .map_err(|e| AppError::storage(format!("物語更新失敗: {e}")))?;
        if affected == 0 {
            return Ok(None);
        }
        Self::query_story(&conn, id)
    }

    fn create_chapter(&self, req: &NewChapter, now: &str) -> Result<Chapter, AppError> {
        let conn = self.conn.lock();
        if Self::query_story(&conn, req.story_id)?.is_none() {
            return Err(AppError::not_found(format!("story {} not found", req.story_id)));
        }
        let choices = serde_json::to_string(&req.choices)
            .map_err(|e| AppError::internal(format!("choices serialize: {e}")))?;
        conn.execute(
            "INSERT INTO chapters (story_id, chapter_number, content, audio, choices, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                req.story_id as i64,
                i64::from(req.chapter_index),
                req.text,
                req.audio,
                choices,
                now
            ],
        )
        .map_err(|e| AppError::storage(format!("チャプター挿入失敗: {e}")))?;
        let id = conn.last_insert_rowid() as u64;
        Self::query_chapter(&conn, id)?
            .ok_or_else(|| AppError::storage(format!("挿入直後のチャプター {id} が見つかりません")))
    }

    fn get_chapter(&self, id: u64) -> Result<Option<Chapter>, AppError> {
        Self::query_chapter(&self.conn.lock(), id)
    }

    fn list_chapters_by_story(&self, story_id: u64) -> Result<Vec<Chapter>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE story_id = ?1 ORDER BY chapter_number, id"
            ))
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
        let rows = stmt
            .query_map(params![story_id as i64], Self::map_chapter_row)
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
        rows.into_iter().map(ChapterRow::into_chapter).collect()
    }

    fn update_chapter(&self, id: u64, patch: &ChapterPatch) -> Result<Option<Chapter>, AppError> {
        let conn = self.conn.lock();
        if let Some(text) = &patch.resolved_choice_text {
            conn.execute(
                "UPDATE chapters SET user_choice = ?1 WHERE id = ?2 AND user_choice IS NULL",
                params![text, id as i64],
            )
            .map_err(|e| AppError::storage(format!("チャプター更新失敗: {e}")))?;
        }
        Self::query_chapter(&conn, id)
    }

    fn chapter_audio(&self, id: u64) -> Result<Option<Vec<u8>>, AppError> {
        let conn = self.conn.lock();
        let audio: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT audio FROM chapters WHERE id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::storage(format!("音声取得失敗: {e}")))?;
        Ok(audio.flatten())
    }

    fn get_settings(&self) -> Result<PlayerSettings, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;

        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;

        if rows.is_empty() {
            return Ok(PlayerSettings::default());
        }

        // key-value をJSONに組み立て、欠けたキーはデフォルトで埋める
        let mut map = serde_json::Map::new();
        for (key, value) in rows {
            let v = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            map.insert(key, v);
        }

        match serde_json::from_value::<PlayerSettings>(serde_json::Value::Object(map)) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("保存済み設定の解析に失敗、デフォルトを使用: {e}");
                Ok(PlayerSettings::default())
            }
        }
    }

    fn save_settings(&self, settings: &PlayerSettings) -> Result<(), AppError> {
        let json = serde_json::to_value(settings)
            .map_err(|e| AppError::internal(format!("settings serialize: {e}")))?;

        let conn = self.conn.lock();
        if let Some(obj) = json.as_object() {
            for (key, value) in obj {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value.to_string()],
                )
                .map_err(|e| AppError::storage(format!("設定保存失敗: {e}")))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;

    fn now() -> String {
        "2025-01-15T21:30:00Z".to_string()
    }

    fn setup_story(store: &SqliteStore) -> Story {
        store
            .create_story(
                &NewStory {
                    genre: Genre::Mystery,
                    voice_id: "luna".to_string(),
                    title: Some("The Midnight Puzzle".to_string()),
                },
                &now(),
            )
            .unwrap()
    }

    fn new_chapter(story_id: u64, index: u32, audio: Option<Vec<u8>>) -> NewChapter {
        NewChapter {
            story_id,
            chapter_index: index,
            text: "The clock struck twelve.".to_string(),
            choices: [
                Choice::new("a", "Open the door", "Curious"),
                Choice::new("b", "Hide under the stairs", "Careful"),
            ],
            audio,
        }
    }

    #[test]
    fn test_create_and_get_story() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = setup_story(&store);
        assert_eq!(story.id, 1);
        assert_eq!(story.genre, Genre::Mystery);
        assert_eq!(story.current_chapter_index, 1);
        assert_eq!(story.state_blob, serde_json::json!({}));

        let loaded = store.get_story(story.id).unwrap().unwrap();
        assert_eq!(loaded, story);
        assert!(store.get_story(42).unwrap().is_none());
    }

    #[test]
    fn test_update_story_partial() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = setup_story(&store);

        let updated = store
            .update_story(
                story.id,
                &StoryPatch {
                    current_chapter_index: Some(2),
                    state_blob: Some(serde_json::json!({"lastChapterId": 1})),
                    ..StoryPatch::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.current_chapter_index, 2);
        assert_eq!(updated.title, "The Midnight Puzzle");
        assert_eq!(updated.state_blob["lastChapterId"], 1);

        assert!(store.update_story(99, &StoryPatch::default()).unwrap().is_none());
    }

    #[test]
    fn test_chapter_round_trip_with_audio() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = setup_story(&store);

        let chapter = store
            .create_chapter(&new_chapter(story.id, 1, Some(vec![0xFF, 0xFB, 0x90])), &now())
            .unwrap();
        assert_eq!(chapter.audio_ref.as_deref(), Some("/api/chapters/1/audio"));
        assert_eq!(chapter.choices[1].label, "Hide under the stairs");
        assert!(chapter.resolved_choice_text.is_none());

        assert_eq!(
            store.chapter_audio(chapter.id).unwrap(),
            Some(vec![0xFF, 0xFB, 0x90])
        );
        assert!(store.chapter_audio(99).unwrap().is_none());
    }

    #[test]
    fn test_chapter_without_audio() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = setup_story(&store);
        let chapter = store
            .create_chapter(&new_chapter(story.id, 1, None), &now())
            .unwrap();
        assert!(chapter.audio_ref.is_none());
        assert!(store.chapter_audio(chapter.id).unwrap().is_none());
    }

    #[test]
    fn test_chapter_for_missing_story() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .create_chapter(&new_chapter(3, 1, None), &now())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_list_chapters_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = setup_story(&store);
        let other = setup_story(&store);
        store.create_chapter(&new_chapter(story.id, 2, None), &now()).unwrap();
        store.create_chapter(&new_chapter(story.id, 1, None), &now()).unwrap();
        store.create_chapter(&new_chapter(other.id, 1, None), &now()).unwrap();

        let chapters = store.list_chapters_by_story(story.id).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].chapter_index, 1);
        assert_eq!(chapters[1].chapter_index, 2);
    }

    #[test]
    fn test_update_chapter_choice() {
        let store = SqliteStore::open_in_memory().unwrap();
        let story = setup_story(&store);
        let chapter = store
            .create_chapter(&new_chapter(story.id, 1, None), &now())
            .unwrap();

        let updated = store
            .update_chapter(
                chapter.id,
                &ChapterPatch {
                    resolved_choice_text: Some("Open the door".to_string()),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.resolved_choice_text.as_deref(), Some("Open the door"));

        // 二度目の書き込みは無視される
        let again = store
            .update_chapter(
                chapter.id,
                &ChapterPatch {
                    resolved_choice_text: Some("Run away".to_string()),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(again.resolved_choice_text.as_deref(), Some("Open the door"));
        assert!(store
            .update_chapter(99, &ChapterPatch::default())
            .unwrap()
            .is_none());
    }

    // --- Settings tests ---

    #[test]
    fn test_settings_default_when_empty() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = store.get_settings().unwrap();
        assert_eq!(settings, PlayerSettings::default());
    }

    #[test]
    fn test_save_and_get_settings() {
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = PlayerSettings {
            choice_timeout_secs: 30,
            voice_tone: "whisper".to_string(),
            voice_choice_enabled: true,
            ..PlayerSettings::default()
        };
        store.save_settings(&settings).unwrap();

        let loaded = store.get_settings().unwrap();
        assert_eq!(loaded.choice_timeout_secs, 30);
        assert_eq!(loaded.voice_tone, "whisper");
        assert!(loaded.voice_choice_enabled);
        assert_eq!(loaded.ambience_volume, 30);
    }
}
