use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::ambience::AmbienceController;
use super::playback::{PlaybackController, PlaybackEvent, PlaybackEvents};
use super::resolver::{ListenState, ResolutionSession, ResolverConfig, VoiceInputs, VoiceListenConfig};
use crate::domain::error::{AppError, ErrorCode};
use crate::domain::resolution::{ChoiceCycle, Resolution, ResolutionPath, StateTransition};
use crate::domain::settings::PlayerSettings;
use crate::domain::story::StoryGateway;
use crate::domain::stt::{AudioClip, SttContext, SttEngine, SttError, Transcript};
use crate::domain::types::{Chapter, Choice, Story};
use crate::infra::playback::{AudioPlayback, AudioSource};

/// プレイヤーへの操作
#[derive(Debug, Clone)]
pub enum PlayerCommand {
    /// 位置 (0 or 1) で選ぶ
    Select(usize),
    SelectId(String),
    TogglePause,
    Seek(f64),
    SetVolume(u8),
    SetMuted(bool),
    ToggleAmbience,
    SetAmbienceVolume(u8),
    Quit,
}

/// プレイヤーが発するイベント
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    Generating { chapter_index: u32 },
    ChapterStarted { chapter: Chapter },
    Progress { current_secs: f64, duration_secs: f64 },
    ChapterEnded { chapter_id: u64 },
    ChoicesOpen { choices: [Choice; 2] },
    Countdown { remaining_secs: u32 },
    Listening { state: ListenState },
    Resolved {
        chapter_id: u64,
        label: String,
        path: ResolutionPath,
    },
    Transition(StateTransition),
    Error(AppError),
    Asleep,
}

/// run の終わり方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerExit {
    Quit,
    Asleep,
}

/// 保存済み設定から選択フェーズの設定を作る
pub fn resolver_config_from(settings: &PlayerSettings) -> ResolverConfig {
    let settings = settings.clone().normalized();
    ResolverConfig {
        countdown_secs: Some(settings.choice_timeout_secs),
        voice: settings
            .voice_choice_enabled
            .then(VoiceListenConfig::default),
        ..ResolverConfig::default()
    }
}

/// StoryGateway 経由でサーバーに文字起こしさせる
pub struct GatewayTranscriber {
    gateway: Arc<dyn StoryGateway>,
}

impl GatewayTranscriber {
    pub fn new(gateway: Arc<dyn StoryGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SttEngine for GatewayTranscriber {
    async fn transcribe(&self, clip: &AudioClip, _ctx: &SttContext) -> Result<Transcript, SttError> {
        self.gateway
            .transcribe(clip.clone())
            .await
            .map_err(|e| match e.code {
                ErrorCode::Timeout => SttError::timeout(e.message),
                ErrorCode::Validation => SttError::audio_format(e.message),
                _ => SttError::transcription_failed(e.message),
            })
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

/// チャプターを生成・再生し、選択を集めて次へ進めるクライアント側ループ
pub struct StoryPlayer {
    gateway: Arc<dyn StoryGateway>,
    narration: PlaybackController,
    narration_events: PlaybackEvents,
    ambience: Option<AmbienceController>,
    resolver: ResolverConfig,
    voice: Option<VoiceInputs>,
    cycle: ChoiceCycle,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

/// 再生フェーズの終わり方
enum Phase<T> {
    Done(T),
    Quit,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl StoryPlayer {
    pub fn new(
        gateway: Arc<dyn StoryGateway>,
        backend: Arc<dyn AudioPlayback>,
        resolver: ResolverConfig,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Self {
        let (narration, narration_events) = PlaybackController::new(backend);
        Self {
            gateway,
            narration,
            narration_events,
            ambience: None,
            resolver,
            voice: None,
            cycle: ChoiceCycle::new(now()),
            events,
        }
    }

    pub fn with_ambience(mut self, ambience: AmbienceController) -> Self {
        self.ambience = Some(ambience);
        self
    }

    pub fn with_voice(mut self, voice: VoiceInputs) -> Self {
        self.voice = Some(voice);
        self
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, e: AppError) -> AppError {
        log::error!("Story player error: {e}");
        self.emit(PlayerEvent::Error(e.clone()));
        e
    }

    /// ユーザーが終了するか眠るまでチャプターを進める
    ///
    /// 生成・記録に失敗したらエラーイベントを出してから Err を返す。
    pub async fn run(
        mut self,
        story: Story,
        mut commands: mpsc::UnboundedReceiver<PlayerCommand>,
    ) -> Result<PlayerExit, AppError> {
        let mut previous_choice: Option<String> = None;
        let mut chapter_index = story.current_chapter_index.max(1);

        let exit = loop {
            self.emit(PlayerEvent::Generating { chapter_index });
            let chapter = match self
                .generate(story.id, previous_choice.clone(), &mut commands)
                .await
            {
                Ok(Phase::Done(chapter)) => chapter,
                Ok(Phase::Quit) => break PlayerExit::Quit,
                Err(e) => {
                    self.abandon();
                    return Err(self.fail(e));
                }
            };
            chapter_index = chapter.chapter_index + 1;

            match self.play_chapter(&chapter, &mut commands).await {
                Ok(Phase::Done(())) => {}
                Ok(Phase::Quit) => break PlayerExit::Quit,
                Err(e) => {
                    self.abandon();
                    return Err(self.fail(e));
                }
            }

            let resolution = match self.collect_choice(&chapter, &mut commands).await {
                Ok(Phase::Done(r)) => r,
                Ok(Phase::Quit) => break PlayerExit::Quit,
                Err(e) => {
                    self.abandon();
                    return Err(self.fail(e));
                }
            };

            match resolution {
                Resolution::Sleep => {
                    self.emit(PlayerEvent::Asleep);
                    break PlayerExit::Asleep;
                }
                Resolution::Choice { choice_id, path } => {
                    let label = chapter
                        .choice(&choice_id)
                        .map(|c| c.label.clone())
                        .ok_or_else(|| AppError::internal(format!("unknown choice {choice_id}")))
                        .map_err(|e| self.fail(e))?;
                    self.gateway
                        .record_choice(chapter.id, &label)
                        .await
                        .map_err(|e| self.fail(e))?;
                    log::info!("Chapter {} resolved via {:?}: {label}", chapter.id, path);
                    self.emit(PlayerEvent::Resolved {
                        chapter_id: chapter.id,
                        label: label.clone(),
                        path,
                    });
                    previous_choice = Some(label);
                }
            }
        };

        self.abandon();
        self.narration.stop();
        Ok(exit)
    }

    fn abandon(&mut self) {
        if let Some(t) = self.cycle.abandon(now()) {
            self.emit(PlayerEvent::Transition(t));
        }
        if let Some(ambience) = &self.ambience {
            ambience.set_narration_active(false);
        }
    }

    async fn generate(
        &mut self,
        story_id: u64,
        previous_choice: Option<String>,
        commands: &mut mpsc::UnboundedReceiver<PlayerCommand>,
    ) -> Result<Phase<Chapter>, AppError> {
        let gateway = self.gateway.clone();
        let generation = gateway.generate_chapter(story_id, previous_choice);
        tokio::pin!(generation);
        loop {
            tokio::select! {
                result = &mut generation => return result.map(Phase::Done),
                cmd = commands.recv() => match cmd {
                    None | Some(PlayerCommand::Quit) => return Ok(Phase::Quit),
                    Some(cmd) => self.handle_common(cmd),
                },
            }
        }
    }

    async fn play_chapter(
        &mut self,
        chapter: &Chapter,
        commands: &mut mpsc::UnboundedReceiver<PlayerCommand>,
    ) -> Result<Phase<()>, AppError> {
        let t = self.cycle.begin_chapter(chapter.id, now())?;
        self.emit(PlayerEvent::Transition(t));
        self.emit(PlayerEvent::ChapterStarted {
            chapter: chapter.clone(),
        });

        let Some(audio) = self.gateway.fetch_audio(chapter).await? else {
            log::warn!("Chapter {} has no audio, skipping playback", chapter.id);
            return Ok(Phase::Done(()));
        };

        self.narration.load(AudioSource::mpeg(audio))?;
        if let Some(ambience) = &self.ambience {
            ambience.set_narration_active(true);
        }
        if let Err(e) = self.narration.play() {
            if e.code != ErrorCode::PlaybackBlocked {
                return Err(e);
            }
            // ユーザー操作 (TogglePause) を待つ
            self.emit(PlayerEvent::Error(e));
        }

        let mut duration = 0.0;
        loop {
            tokio::select! {
                event = self.narration_events.recv() => match event {
                    Some(PlaybackEvent::Ready { duration_secs }) => duration = duration_secs,
                    Some(PlaybackEvent::Progress { current_secs }) => {
                        self.emit(PlayerEvent::Progress { current_secs, duration_secs: duration });
                    }
                    Some(PlaybackEvent::Ended) | None => break,
                    Some(PlaybackEvent::Failed(e)) => {
                        self.emit(PlayerEvent::Error(e));
                        break;
                    }
                },
                cmd = commands.recv() => match cmd {
                    None | Some(PlayerCommand::Quit) => return Ok(Phase::Quit),
                    Some(PlayerCommand::TogglePause) => {
                        if let Err(e) = self.narration.toggle_pause() {
                            self.emit(PlayerEvent::Error(e));
                        }
                    }
                    Some(PlayerCommand::Seek(fraction)) => self.narration.seek(fraction),
                    Some(cmd) => self.handle_common(cmd),
                },
            }
        }

        if let Some(ambience) = &self.ambience {
            ambience.set_narration_active(false);
        }
        self.emit(PlayerEvent::ChapterEnded {
            chapter_id: chapter.id,
        });
        Ok(Phase::Done(()))
    }

    async fn collect_choice(
        &mut self,
        chapter: &Chapter,
        commands: &mut mpsc::UnboundedReceiver<PlayerCommand>,
    ) -> Result<Phase<Resolution>, AppError> {
        let delay = tokio::time::sleep(self.resolver.start_delay());
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                cmd = commands.recv() => match cmd {
                    None | Some(PlayerCommand::Quit) => return Ok(Phase::Quit),
                    Some(cmd) => self.handle_common(cmd),
                },
            }
        }

        let t = self.cycle.on_playback_ended(now())?;
        self.emit(PlayerEvent::Transition(t));

        let session = ResolutionSession::start(chapter.choices.clone(), &self.resolver, self.voice.clone());
        self.emit(PlayerEvent::ChoicesOpen {
            choices: chapter.choices.clone(),
        });

        let mut countdown = session.countdown();
        let mut countdown_live = self.resolver.countdown_secs.is_some();
        let mut listening = ListenState::Off;
        let mut listen_poll = tokio::time::interval(Duration::from_millis(250));

        let outcome = loop {
            tokio::select! {
                biased;
                changed = countdown.changed(), if countdown_live => match changed {
                    Ok(()) => {
                        if let Some(remaining_secs) = *countdown.borrow_and_update() {
                            self.emit(PlayerEvent::Countdown { remaining_secs });
                        }
                    }
                    Err(_) => countdown_live = false,
                },
                _ = listen_poll.tick(), if self.voice.is_some() => {
                    let state = session.listening();
                    if state != listening {
                        listening = state;
                        self.emit(PlayerEvent::Listening { state });
                    }
                },
                cmd = commands.recv() => match cmd {
                    None | Some(PlayerCommand::Quit) => {
                        session.abandon();
                        return Ok(Phase::Quit);
                    }
                    Some(PlayerCommand::Select(index)) => {
                        if let Err(e) = session.select_index(index) {
                            self.emit(PlayerEvent::Error(e));
                        }
                    }
                    Some(PlayerCommand::SelectId(id)) => {
                        if let Err(e) = session.select(&id) {
                            self.emit(PlayerEvent::Error(e));
                        }
                    }
                    Some(cmd) => self.handle_common(cmd),
                },
                // カウントダウン更新を先に流しきってから決着を見る
                outcome = session.wait() => break outcome,
            }
        };

        let Some(outcome) = outcome else {
            return Ok(Phase::Quit);
        };
        let t = self.cycle.resolve(outcome, now())?;
        self.emit(PlayerEvent::Transition(t));
        let (t, outcome) = self.cycle.finish(now())?;
        self.emit(PlayerEvent::Transition(t));
        Ok(Phase::Done(outcome))
    }

    /// どのフェーズでも効く操作
    fn handle_common(&self, cmd: PlayerCommand) {
        match cmd {
            PlayerCommand::SetVolume(v) => self.narration.set_volume(v),
            PlayerCommand::SetMuted(m) => self.narration.set_muted(m),
            PlayerCommand::ToggleAmbience => {
                if let Some(ambience) = &self.ambience {
                    if let Err(e) = ambience.toggle_play_pause() {
                        self.emit(PlayerEvent::Error(e));
                    }
                }
            }
            PlayerCommand::SetAmbienceVolume(v) => {
                if let Some(ambience) = &self.ambience {
                    ambience.set_volume(v);
                }
            }
            PlayerCommand::TogglePause
            | PlayerCommand::Seek(_)
            | PlayerCommand::Select(_)
            | PlayerCommand::SelectId(_) => {
                log::debug!("Ignoring {cmd:?} in {} state", self.cycle.state().as_str());
            }
            PlayerCommand::Quit => {}
        }
    }
}
