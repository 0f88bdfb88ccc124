use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::ChapterStore;
use crate::domain::error::AppError;
use crate::domain::settings::PlayerSettings;
use crate::domain::types::{
    chapter_audio_ref, Chapter, ChapterPatch, NewChapter, NewStory, Story, StoryPatch,
};

/// プロセス内マップによるストア（再起動で消える）
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

struct MemoryState {
    stories: BTreeMap<u64, Story>,
    chapters: BTreeMap<u64, Chapter>,
    audio: HashMap<u64, Vec<u8>>,
    settings: PlayerSettings,
    next_story_id: u64,
    next_chapter_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                stories: BTreeMap::new(),
                chapters: BTreeMap::new(),
                audio: HashMap::new(),
                settings: PlayerSettings::default(),
                next_story_id: 1,
                next_chapter_id: 1,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChapterStore for MemoryStore {
    fn create_story(&self, req: &NewStory, now: &str) -> Result<Story, AppError> {
        let mut state = self.inner.lock();
        let id = state.next_story_id;
        state.next_story_id += 1;

        let story = Story {
            id,
            genre: req.genre,
            voice_id: req.voice_id.clone(),
            title: req.title.clone().unwrap_or_default(),
            current_chapter_index: 1,
            state_blob: serde_json::json!({}),
            created_at: now.to_string(),
        };
        state.stories.insert(id, story.clone());
        Ok(story)
    }

    fn get_story(&self, id: u64) -> Result<Option<Story>, AppError> {
        Ok(self.inner.lock().stories.get(&id).cloned())
    }

    fn list_stories(&self) -> Result<Vec<Story>, AppError> {
        Ok(self.inner.lock().stories.values().cloned().collect())
    }

    fn update_story(&self, id: u64, patch: &StoryPatch) -> Result<Option<Story>, AppError> {
        let mut state = self.inner.lock();
        let Some(story) = state.stories.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(title) = &patch.title {
            story.title = title.clone();
        }
        if let Some(index) = patch.current_chapter_index {
            story.current_chapter_index = index;
        }
        if let Some(blob) = &patch.state_blob {
            story.state_blob = blob.clone();
        }
        Ok(Some(story.clone()))
    }

    fn create_chapter(&self, req: &NewChapter, now: &str) -> Result<Chapter, AppError> {
        let mut state = self.inner.lock();
        if !state.stories.contains_key(&req.story_id) {
            return Err(AppError::not_found(format!("story {} not found", req.story_id)));
        }
        let id = state.next_chapter_id;
        state.next_chapter_id += 1;

        let audio_ref = req.audio.as_ref().map(|_| chapter_audio_ref(id));
        if let Some(bytes) = &req.audio {
            state.audio.insert(id, bytes.clone());
        }

        let chapter = Chapter {
            id,
            story_id: req.story_id,
            chapter_index: req.chapter_index,
            text: req.text.clone(),
            audio_ref,
            choices: req.choices.clone(),
            resolved_choice_text: None,
            created_at: now.to_string(),
        };
        state.chapters.insert(id, chapter.clone());
        Ok(chapter)
    }

    fn get_chapter(&self, id: u64) -> Result<Option<Chapter>, AppError> {
        Ok(self.inner.lock().chapters.get(&id).cloned())
    }

    fn list_chapters_by_story(&self, story_id: u64) -> Result<Vec<Chapter>, AppError> {
        let state = self.inner.lock();
        let mut chapters: Vec<Chapter> = state
            .chapters
            .values()
            .filter(|c| c.story_id == story_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.chapter_index);
        Ok(chapters)
    }

    fn update_chapter(&self, id: u64, patch: &ChapterPatch) -> Result<Option<Chapter>, AppError> {
        let mut state = self.inner.lock();
        let Some(chapter) = state.chapters.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(text) = &patch.resolved_choice_text {
            chapter.resolved_choice_text.get_or_insert_with(|| text.clone());
        }
        Ok(Some(chapter.clone()))
    }

    fn chapter_audio(&self, id: u64) -> Result<Option<Vec<u8>>, AppError> {
        Ok(self.inner.lock().audio.get(&id).cloned())
    }

    fn get_settings(&self) -> Result<PlayerSettings, AppError> {
        Ok(self.inner.lock().settings.clone())
    }

    fn save_settings(&self, settings: &PlayerSettings) -> Result<(), AppError> {
        self.inner.lock().settings = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Choice, Genre};

    fn now() -> String {
        "2025-01-15T21:30:00Z".to_string()
    }

    fn new_story() -> NewStory {
        NewStory {
            genre: Genre::Fantasy,
            voice_id: "sarah".to_string(),
            title: Some("The Enchanted Forest".to_string()),
        }
    }

    fn new_chapter(story_id: u64, index: u32, audio: Option<Vec<u8>>) -> NewChapter {
        NewChapter {
            story_id,
            chapter_index: index,
            text: format!("Chapter {index}"),
            choices: [Choice::new("a", "Left", ""), Choice::new("b", "Right", "")],
            audio,
        }
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let store = MemoryStore::new();
        let s1 = store.create_story(&new_story(), &now()).unwrap();
        let s2 = store.create_story(&new_story(), &now()).unwrap();
        assert_eq!(s1.id, 1);
        assert_eq!(s2.id, 2);
        assert_eq!(s1.current_chapter_index, 1);
        assert_eq!(store.list_stories().unwrap().len(), 2);
    }

    #[test]
    fn test_update_missing_story_returns_none() {
        let store = MemoryStore::new();
        assert!(store.update_story(99, &StoryPatch::default()).unwrap().is_none());
        assert!(store.get_story(99).unwrap().is_none());
    }

    #[test]
    fn test_chapter_audio_ref_and_listing() {
        let store = MemoryStore::new();
        let story = store.create_story(&new_story(), &now()).unwrap();
        let c2 = store
            .create_chapter(&new_chapter(story.id, 2, None), &now())
            .unwrap();
        let c1 = store
            .create_chapter(&new_chapter(story.id, 1, Some(vec![7, 7])), &now())
            .unwrap();

        assert!(c2.audio_ref.is_none());
        assert_eq!(c1.audio_ref.as_deref(), Some("/api/chapters/2/audio"));
        assert_eq!(store.chapter_audio(c1.id).unwrap(), Some(vec![7, 7]));

        let listed = store.list_chapters_by_story(story.id).unwrap();
        assert_eq!(listed.iter().map(|c| c.chapter_index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_choice_written_once() {
        let store = MemoryStore::new();
        let story = store.create_story(&new_story(), &now()).unwrap();
        let chapter = store
            .create_chapter(&new_chapter(story.id, 1, None), &now())
            .unwrap();
        let patch = |text: &str| ChapterPatch {
            resolved_choice_text: Some(text.to_string()),
        };

        store.update_chapter(chapter.id, &patch("Left")).unwrap();
        let again = store.update_chapter(chapter.id, &patch("Right")).unwrap().unwrap();
        assert_eq!(again.resolved_choice_text.as_deref(), Some("Left"));
        assert!(store.update_chapter(99, &patch("Left")).unwrap().is_none());
    }

    #[test]
    fn test_chapter_for_unknown_story_rejected() {
        let store = MemoryStore::new();
        let err = store
            .create_chapter(&new_chapter(5, 1, None), &now())
            .unwrap_err();
        assert_eq!(err.code, crate::domain::error::ErrorCode::NotFound);
    }

    #[test]
    fn test_settings_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get_settings().unwrap(), PlayerSettings::default());
        let settings = PlayerSettings {
            choice_timeout_secs: 20,
            ..PlayerSettings::default()
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.get_settings().unwrap().choice_timeout_secs, 20);
    }
}
