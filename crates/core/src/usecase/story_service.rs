use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::domain::error::AppError;
use crate::domain::settings::PlayerSettings;
use crate::domain::story::StoryGateway;
use crate::domain::stt::{AudioClip, SttContext, SttEngine, Transcript};
use crate::domain::types::{
    validate_choices, Chapter, ChapterPatch, Choice, Genre, NewChapter, NewStory, Story,
    StoryPatch, Voice,
};
use crate::infra::metrics::{Metrics, MetricsSummary, Phase};
use crate::infra::narration::{NarrationEngine, NarrationRequest};
use crate::infra::storage::ChapterStore;
use crate::infra::synthesis::{voices, VoiceSynthesizer};

/// 生成呼び出しの上限時間
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationTimeouts {
    pub narration_secs: u64,
    /// 音声合成の基本時間
    pub synthesis_base_secs: u64,
    /// この文字数ごとに1秒延長する
    pub synthesis_chars_per_sec: u64,
    pub synthesis_max_secs: u64,
    pub transcription_secs: u64,
}

impl Default for GenerationTimeouts {
    fn default() -> Self {
        Self {
            narration_secs: 60,
            synthesis_base_secs: 60,
            synthesis_chars_per_sec: 100,
            synthesis_max_secs: 120,
            transcription_secs: 30,
        }
    }
}

impl GenerationTimeouts {
    pub fn narration(&self) -> Duration {
        Duration::from_secs(self.narration_secs)
    }

    /// min(max, base + 文字数 / chars_per_sec)
    pub fn synthesis_for(&self, text: &str) -> Duration {
        let extra = text.chars().count() as u64 / self.synthesis_chars_per_sec.max(1);
        Duration::from_secs((self.synthesis_base_secs + extra).min(self.synthesis_max_secs))
    }

    pub fn transcription(&self) -> Duration {
        Duration::from_secs(self.transcription_secs)
    }
}

/// 物語サービス（HTTPハンドラとプロセス内プレイヤーから使う）
pub struct StoryService {
    store: Arc<dyn ChapterStore>,
    narrator: Arc<dyn NarrationEngine>,
    synthesizer: Arc<dyn VoiceSynthesizer>,
    transcriber: Arc<dyn SttEngine>,
    metrics: Metrics,
    timeouts: GenerationTimeouts,
    contract_retries: u32,
    generating: Mutex<HashSet<u64>>,
}

/// 生成中の物語IDを drop で解放する
struct GenerationGuard<'a> {
    generating: &'a Mutex<HashSet<u64>>,
    story_id: u64,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.generating.lock().remove(&self.story_id);
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// ジャンルのカタログからタイトルを選ぶ
pub fn pick_title<R: rand::Rng + ?Sized>(genre: Genre, rng: &mut R) -> String {
    genre
        .titles()
        .choose(rng)
        .or_else(|| Genre::Peaceful.titles().first())
        .map(|t| t.to_string())
        .unwrap_or_else(|| genre.display_name().to_string())
}

impl StoryService {
    pub fn new(
        store: Arc<dyn ChapterStore>,
        narrator: Arc<dyn NarrationEngine>,
        synthesizer: Arc<dyn VoiceSynthesizer>,
        transcriber: Arc<dyn SttEngine>,
    ) -> Self {
        Self {
            store,
            narrator,
            synthesizer,
            transcriber,
            metrics: Metrics::new(),
            timeouts: GenerationTimeouts::default(),
            contract_retries: 2,
            generating: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: GenerationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// 契約違反の応答を再生成する回数
    pub fn with_contract_retries(mut self, retries: u32) -> Self {
        self.contract_retries = retries;
        self
    }

    // ==================== Stories ====================

    pub fn create_story(&self, req: NewStory) -> Result<Story, AppError> {
        let voice_id = req.voice_id.trim().to_string();
        if voice_id.is_empty() {
            return Err(AppError::validation("voice is required"));
        }
        let title = match req.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => pick_title(req.genre, &mut rand::rng()),
        };

        let story = self.store.create_story(
            &NewStory {
                genre: req.genre,
                voice_id,
                title: Some(title),
            },
            &now(),
        )?;
        self.metrics.inc_stories_created();
        log::info!(
            "Story {} created: {} / {} / {:?}",
            story.id,
            story.genre,
            story.voice_id,
            story.title
        );
        Ok(story)
    }

    pub fn get_story(&self, id: u64) -> Result<Story, AppError> {
        self.store
            .get_story(id)?
            .ok_or_else(|| AppError::not_found(format!("Story {id} not found")))
    }

    pub fn list_stories(&self) -> Result<Vec<Story>, AppError> {
        self.store.list_stories()
    }

    // ==================== Chapters ====================

    pub fn get_chapter(&self, id: u64) -> Result<Chapter, AppError> {
        self.store
            .get_chapter(id)?
            .ok_or_else(|| AppError::not_found(format!("Chapter {id} not found")))
    }

    pub fn list_chapters(&self, story_id: u64) -> Result<Vec<Chapter>, AppError> {
        self.get_story(story_id)?;
        self.store.list_chapters_by_story(story_id)
    }

    pub fn chapter_audio(&self, id: u64) -> Result<Vec<u8>, AppError> {
        self.get_chapter(id)?;
        self.store
            .chapter_audio(id)?
            .ok_or_else(|| AppError::not_found(format!("Chapter {id} has no audio")))
    }

    /// 次のチャプターを生成する: 物語生成 → 検証 → 音声合成 → 保存 → 物語を進める
    ///
    /// 失敗時はチャプターを保存せず、物語も進めない。
    pub async fn generate_chapter(
        &self,
        story_id: u64,
        previous_choice: Option<String>,
    ) -> Result<Chapter, AppError> {
        let result = self.generate_chapter_inner(story_id, previous_choice).await;
        if let Err(e) = &result {
            self.metrics.inc_error(e.code);
            log::error!("Chapter generation for story {story_id} failed: {e}");
        }
        result
    }

    async fn generate_chapter_inner(
        &self,
        story_id: u64,
        previous_choice: Option<String>,
    ) -> Result<Chapter, AppError> {
        if !self.generating.lock().insert(story_id) {
            return Err(AppError::invalid_state(format!(
                "Story {story_id} already has a chapter in progress"
            )));
        }
        let _guard = GenerationGuard {
            generating: &self.generating,
            story_id,
        };

        let story = self.get_story(story_id)?;
        let chapter_index = story.current_chapter_index.max(1);

        let previous_choice_text = match previous_choice.map(|c| c.trim().to_string()) {
            Some(c) if !c.is_empty() => Some(c),
            _ if chapter_index > 1 => self
                .store
                .list_chapters_by_story(story_id)?
                .into_iter()
                .rev()
                .find_map(|c| c.resolved_choice_text),
            _ => None,
        };

        let (text, choices) = self
            .narrate(&story, chapter_index, previous_choice_text)
            .await?;

        let audio = self.synthesize(&text, &story.voice_id).await?;

        let chapter = self.store.create_chapter(
            &NewChapter {
                story_id,
                chapter_index,
                text,
                choices,
                audio: Some(audio),
            },
            &now(),
        )?;

        let mut state_blob = match story.state_blob {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        state_blob.insert("lastChapterId".to_string(), serde_json::json!(chapter.id));
        self.store.update_story(
            story_id,
            &StoryPatch {
                current_chapter_index: Some(chapter_index + 1),
                state_blob: Some(serde_json::Value::Object(state_blob)),
                ..StoryPatch::default()
            },
        )?;

        self.metrics.inc_chapters_generated();
        log::info!(
            "Chapter {} (#{}) stored for story {story_id}",
            chapter.id,
            chapter.chapter_index
        );
        Ok(chapter)
    }

    async fn narrate(
        &self,
        story: &Story,
        chapter_index: u32,
        previous_choice_text: Option<String>,
    ) -> Result<(String, [Choice; 2]), AppError> {
        let mut attempt = 0;
        loop {
            let req = NarrationRequest {
                genre: story.genre,
                chapter_index,
                previous_choice_text: previous_choice_text.clone(),
                prior_state: story.state_blob.clone(),
                attempt,
            };

            let start = Instant::now();
            let result = tokio::time::timeout(self.timeouts.narration(), self.narrator.narrate(&req))
                .await
                .map_err(|_| {
                    AppError::timeout(format!(
                        "narration exceeded {}s",
                        self.timeouts.narration_secs
                    ))
                })?;
            self.metrics
                .record_latency(Phase::Narration, start.elapsed().as_millis() as u64);

            let validated = result.map_err(AppError::from).and_then(|out| {
                if out.text.trim().is_empty() {
                    return Err(AppError::contract_violation("narration text is empty"));
                }
                Ok((out.text, validate_choices(out.choices)?))
            });

            match validated {
                Err(e)
                    if e.code == crate::domain::error::ErrorCode::ContractViolation
                        && attempt < self.contract_retries =>
                {
                    attempt += 1;
                    self.metrics.inc_contract_retries();
                    log::warn!(
                        "Narration rejected ({}), regenerating ({attempt}/{})",
                        e.message,
                        self.contract_retries
                    );
                }
                other => return other,
            }
        }
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, AppError> {
        let limit = self.timeouts.synthesis_for(text);
        let start = Instant::now();
        let audio = tokio::time::timeout(limit, self.synthesizer.synthesize(text, voice_id))
            .await
            .map_err(|_| AppError::timeout(format!("synthesis exceeded {}s", limit.as_secs())))??;
        self.metrics
            .record_latency(Phase::Synthesis, start.elapsed().as_millis() as u64);

        if audio.is_empty() {
            return Err(AppError::upstream("synthesizer returned no audio"));
        }
        Ok(audio)
    }

    /// 確定した選択肢を記録する（一度だけ）。id でもラベルでも受け付け、ラベルを保存する
    ///
    /// 同じ選択の再送は成功扱い、別の選択での上書きは拒否する。
    pub fn record_choice(&self, chapter_id: u64, choice: &str) -> Result<Chapter, AppError> {
        let chapter = self.get_chapter(chapter_id)?;
        let label = chapter
            .find_choice(choice)
            .map(|c| c.label.clone())
            .ok_or_else(|| {
                AppError::validation(format!(
                    "'{choice}' is not a choice of chapter {chapter_id}"
                ))
            })?;

        match &chapter.resolved_choice_text {
            Some(existing) if *existing == label => return Ok(chapter),
            Some(existing) => {
                return Err(AppError::invalid_state(format!(
                    "Chapter {chapter_id} is already resolved with '{existing}'"
                )))
            }
            None => {}
        }

        let updated = self
            .store
            .update_chapter(
                chapter_id,
                &ChapterPatch {
                    resolved_choice_text: Some(label.clone()),
                },
            )?
            .ok_or_else(|| AppError::not_found(format!("Chapter {chapter_id} not found")))?;
        // 確認と書き込みの間に別の選択が入った場合
        if let Some(existing) = updated
            .resolved_choice_text
            .as_ref()
            .filter(|existing| **existing != label)
        {
            return Err(AppError::invalid_state(format!(
                "Chapter {chapter_id} is already resolved with '{existing}'"
            )));
        }
        self.metrics.inc_choices_recorded();
        log::info!("Chapter {chapter_id} resolved with '{label}'");
        Ok(updated)
    }

    // ==================== Voices / Transcription ====================

    pub fn voices(&self) -> Vec<Voice> {
        voices::available_voices()
    }

    pub async fn transcribe(&self, clip: AudioClip) -> Result<Transcript, AppError> {
        let ctx = SttContext {
            language: Some("en".to_string()),
            prompt_hints: Vec::new(),
        };
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.timeouts.transcription(),
            self.transcriber.transcribe(&clip, &ctx),
        )
        .await
        .map_err(|_| AppError::timeout("transcription timed out"))
        .and_then(|r| r.map_err(AppError::from));

        match result {
            Ok(transcript) => {
                self.metrics
                    .record_latency(Phase::Transcription, start.elapsed().as_millis() as u64);
                self.metrics.inc_transcriptions();
                Ok(transcript)
            }
            Err(e) => {
                self.metrics.inc_error(e.code);
                log::warn!("Transcription failed: {e}");
                Err(e)
            }
        }
    }

    // ==================== Settings / Metrics ====================

    pub fn get_settings(&self) -> Result<PlayerSettings, AppError> {
        self.store.get_settings()
    }

    pub fn update_settings(&self, settings: PlayerSettings) -> Result<PlayerSettings, AppError> {
        let settings = settings.normalized();
        self.store.save_settings(&settings)?;
        Ok(settings)
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    pub fn record_error(&self, code: crate::domain::error::ErrorCode) {
        self.metrics.inc_error(code);
    }
}

#[async_trait]
impl StoryGateway for StoryService {
    async fn create_story(&self, req: NewStory) -> Result<Story, AppError> {
        StoryService::create_story(self, req)
    }

    async fn generate_chapter(
        &self,
        story_id: u64,
        previous_choice: Option<String>,
    ) -> Result<Chapter, AppError> {
        StoryService::generate_chapter(self, story_id, previous_choice).await
    }

    async fn fetch_audio(&self, chapter: &Chapter) -> Result<Option<Vec<u8>>, AppError> {
        self.store.chapter_audio(chapter.id)
    }

    async fn record_choice(&self, chapter_id: u64, choice: &str) -> Result<Chapter, AppError> {
        StoryService::record_choice(self, chapter_id, choice)
    }

    async fn settings(&self) -> Result<PlayerSettings, AppError> {
        self.get_settings()
    }

    async fn transcribe(&self, clip: AudioClip) -> Result<Transcript, AppError> {
        StoryService::transcribe(self, clip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;
    use crate::infra::narration::{NarrationError, NarrationOutput, ScriptedNarrator};
    use crate::infra::storage::MemoryStore;
    use crate::infra::stt::FixedTranscriber;
    use crate::infra::synthesis::{SilentSynthesizer, SynthesisError};
    use rand::SeedableRng;

    struct FailingSynth;

    #[async_trait]
    impl VoiceSynthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<u8>, SynthesisError> {
            Err(SynthesisError::Failed("503".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    /// 合成を長時間止める
    struct StallingSynth;

    #[async_trait]
    impl VoiceSynthesizer for StallingSynth {
        async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<u8>, SynthesisError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![1])
        }

        fn name(&self) -> &str {
            "stalling"
        }
    }

    /// 確認と書き込みの間に別リクエストの選択が割り込むストア
    struct InterleavingStore {
        inner: MemoryStore,
        rival: String,
    }

    impl ChapterStore for InterleavingStore {
        fn create_story(&self, req: &NewStory, now: &str) -> Result<Story, AppError> {
            self.inner.create_story(req, now)
        }

        fn get_story(&self, id: u64) -> Result<Option<Story>, AppError> {
            self.inner.get_story(id)
        }

        fn list_stories(&self) -> Result<Vec<Story>, AppError> {
            self.inner.list_stories()
        }

        fn update_story(&self, id: u64, patch: &StoryPatch) -> Result<Option<Story>, AppError> {
            self.inner.update_story(id, patch)
        }

        fn create_chapter(&self, req: &NewChapter, now: &str) -> Result<Chapter, AppError> {
            self.inner.create_chapter(req, now)
        }

        fn get_chapter(&self, id: u64) -> Result<Option<Chapter>, AppError> {
            self.inner.get_chapter(id)
        }

        fn list_chapters_by_story(&self, story_id: u64) -> Result<Vec<Chapter>, AppError> {
            self.inner.list_chapters_by_story(story_id)
        }

        fn update_chapter(&self, id: u64, patch: &ChapterPatch) -> Result<Option<Chapter>, AppError> {
            let rival = ChapterPatch {
                resolved_choice_text: Some(self.rival.clone()),
            };
            self.inner.update_chapter(id, &rival)?;
            self.inner.update_chapter(id, patch)
        }

        fn chapter_audio(&self, id: u64) -> Result<Option<Vec<u8>>, AppError> {
            self.inner.chapter_audio(id)
        }

        fn get_settings(&self) -> Result<PlayerSettings, AppError> {
            self.inner.get_settings()
        }

        fn save_settings(&self, settings: &PlayerSettings) -> Result<(), AppError> {
            self.inner.save_settings(settings)
        }
    }

    fn service_with(
        narrator: Arc<ScriptedNarrator>,
        synth: Arc<dyn VoiceSynthesizer>,
    ) -> (StoryService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = StoryService::new(
            store.clone(),
            narrator,
            synth,
            Arc::new(FixedTranscriber::new("option one")),
        );
        (service, store)
    }

    fn service() -> (StoryService, Arc<ScriptedNarrator>, Arc<MemoryStore>) {
        let narrator = Arc::new(ScriptedNarrator::new());
        let (service, store) = service_with(narrator.clone(), Arc::new(SilentSynthesizer::new()));
        (service, narrator, store)
    }

    fn fantasy() -> NewStory {
        NewStory {
            genre: Genre::Fantasy,
            voice_id: "sarah".to_string(),
            title: None,
        }
    }

    fn one_choice() -> NarrationOutput {
        NarrationOutput {
            text: "A short tale.".to_string(),
            choices: vec![Choice::new("a", "Only path", "")],
        }
    }

    #[test]
    fn test_synthesis_timeout_formula() {
        let t = GenerationTimeouts::default();
        assert_eq!(t.synthesis_for("short"), Duration::from_secs(60));
        assert_eq!(t.synthesis_for(&"x".repeat(2500)), Duration::from_secs(85));
        assert_eq!(t.synthesis_for(&"x".repeat(10_000)), Duration::from_secs(120));
    }

    #[test]
    fn test_pick_title_from_catalog() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for genre in Genre::ALL {
            let title = pick_title(genre, &mut rng);
            assert!(genre.titles().contains(&title.as_str()));
        }
    }

    #[test]
    fn test_create_story_picks_title() {
        let (service, _, _) = service();
        let story = service.create_story(fantasy()).unwrap();
        assert_eq!(story.current_chapter_index, 1);
        assert!(Genre::Fantasy.titles().contains(&story.title.as_str()));

        let err = service
            .create_story(NewStory {
                voice_id: " ".to_string(),
                ..fantasy()
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_generate_chapter_advances_story() {
        let (service, _, _) = service();
        let story = service.create_story(fantasy()).unwrap();

        let chapter = service.generate_chapter(story.id, None).await.unwrap();
        assert_eq!(chapter.chapter_index, 1);
        assert_eq!(chapter.choices.len(), 2);
        assert_eq!(
            chapter.audio_ref.as_deref(),
            Some(format!("/api/chapters/{}/audio", chapter.id).as_str())
        );

        let story = service.get_story(story.id).unwrap();
        assert_eq!(story.current_chapter_index, 2);
        assert_eq!(story.state_blob["lastChapterId"], chapter.id);
        assert!(!service.chapter_audio(chapter.id).unwrap().is_empty());
        assert_eq!(service.metrics().chapters_generated, 1);
    }

    #[tokio::test]
    async fn test_generate_for_missing_story() {
        let (service, _, _) = service();
        let err = service.generate_chapter(99, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_contract_violation_is_retried() {
        let (service, narrator, _) = service();
        narrator.enqueue(Ok(one_choice()));
        let story = service.create_story(fantasy()).unwrap();

        let chapter = service.generate_chapter(story.id, None).await.unwrap();
        assert_eq!(chapter.choices.len(), 2);
        let requests = narrator.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].attempt, 1);
        assert_eq!(service.metrics().contract_retries, 1);
    }

    #[tokio::test]
    async fn test_contract_violation_exhausts_retries() {
        let (service, narrator, store) = service();
        let service = service.with_contract_retries(1);
        narrator.enqueue(Ok(one_choice()));
        narrator.enqueue(Ok(one_choice()));
        let story = service.create_story(fantasy()).unwrap();

        let err = service.generate_chapter(story.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ContractViolation);
        assert!(store.list_chapters_by_story(story.id).unwrap().is_empty());
        assert_eq!(service.get_story(story.id).unwrap().current_chapter_index, 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_not_retried_and_not_persisted() {
        let (service, narrator, store) = service();
        narrator.enqueue(Err(NarrationError::Failed("500".to_string())));
        let story = service.create_story(fantasy()).unwrap();

        let err = service.generate_chapter(story.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Upstream);
        assert_eq!(narrator.requests().len(), 1);
        assert!(store.list_chapters_by_story(story.id).unwrap().is_empty());
        assert_eq!(service.metrics().error_counts.upstream, 1);
    }

    #[tokio::test]
    async fn test_synthesis_failure_persists_nothing() {
        let narrator = Arc::new(ScriptedNarrator::new());
        let (service, store) = service_with(narrator, Arc::new(FailingSynth));
        let story = service.create_story(fantasy()).unwrap();

        let err = service.generate_chapter(story.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Upstream);
        assert!(store.list_chapters_by_story(story.id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_timeout() {
        let narrator = Arc::new(ScriptedNarrator::new());
        let (service, _) = service_with(narrator, Arc::new(StallingSynth));
        let story = service.create_story(fantasy()).unwrap();

        let err = service.generate_chapter(story.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_generation_rejected() {
        let narrator = Arc::new(ScriptedNarrator::new());
        let (service, _) = service_with(narrator, Arc::new(StallingSynth));
        let service = Arc::new(service);
        let story = service.create_story(fantasy()).unwrap();

        let s = service.clone();
        let first = tokio::spawn(async move { s.generate_chapter(story.id, None).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = service.generate_chapter(story.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        // 最初の生成がタイムアウトで終わればロックは解放される
        let _ = first.await.unwrap();
        assert!(!service.generating.lock().contains(&story.id));
    }

    #[tokio::test]
    async fn test_record_choice_set_once() {
        let (service, _, _) = service();
        let story = service.create_story(fantasy()).unwrap();
        let chapter = service.generate_chapter(story.id, None).await.unwrap();
        let first_label = chapter.choices[0].label.clone();

        let updated = service.record_choice(chapter.id, &chapter.choices[0].id).unwrap();
        assert_eq!(updated.resolved_choice_text.as_deref(), Some(first_label.as_str()));

        // 同じ選択の再送は成功
        assert!(service.record_choice(chapter.id, &first_label).is_ok());
        assert_eq!(service.metrics().choices_recorded, 1);

        // 別の選択での上書きは拒否
        let err = service
            .record_choice(chapter.id, &chapter.choices[1].label)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        let err = service.record_choice(chapter.id, "fly away").unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_record_choice_loses_to_interleaved_write() {
        let store = Arc::new(InterleavingStore {
            inner: MemoryStore::new(),
            rival: "Take the mountain path".to_string(),
        });
        let service = StoryService::new(
            store.clone(),
            Arc::new(ScriptedNarrator::new()),
            Arc::new(SilentSynthesizer::new()),
            Arc::new(FixedTranscriber::new("option one")),
        );
        let story = service.create_story(fantasy()).unwrap();
        let chapter = service.generate_chapter(story.id, None).await.unwrap();

        let err = service
            .record_choice(chapter.id, &chapter.choices[0].id)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
        assert_eq!(service.metrics().choices_recorded, 0);

        let stored = store.get_chapter(chapter.id).unwrap().unwrap();
        assert_eq!(stored.resolved_choice_text.as_deref(), Some("Take the mountain path"));
    }

    #[tokio::test]
    async fn test_previous_choice_falls_back_to_recorded() {
        let (service, narrator, _) = service();
        let story = service.create_story(fantasy()).unwrap();
        let chapter = service.generate_chapter(story.id, None).await.unwrap();
        service.record_choice(chapter.id, "choice_2").unwrap();

        service.generate_chapter(story.id, None).await.unwrap();
        let requests = narrator.requests();
        assert_eq!(
            requests[1].previous_choice_text.as_deref(),
            Some(chapter.choices[1].label.as_str())
        );
        assert_eq!(requests[1].chapter_index, 2);
    }

    #[tokio::test]
    async fn test_transcribe_counts() {
        let (service, _, _) = service();
        let clip = AudioClip::from_encoded(vec![1, 2, 3], "audio/webm", "c.webm");
        let t = StoryService::transcribe(&service, clip).await.unwrap();
        assert_eq!(t.text, "option one");
        assert_eq!(service.metrics().transcriptions, 1);
    }

    #[test]
    fn test_settings_are_normalized() {
        let (service, _, _) = service();
        let saved = service
            .update_settings(PlayerSettings {
                choice_timeout_secs: 1,
                ..PlayerSettings::default()
            })
            .unwrap();
        assert_eq!(saved.choice_timeout_secs, 5);
        assert_eq!(service.get_settings().unwrap().choice_timeout_secs, 5);
    }
}
