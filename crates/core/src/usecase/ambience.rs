use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use super::playback::{PlayState, PlaybackController, PlaybackEvent, PlaybackEvents};
use crate::domain::error::AppError;
use crate::infra::playback::{AudioPlayback, AudioSource};

pub const DEFAULT_AMBIENCE_VOLUME: u8 = 30;

/// 環境音プレイリストの再生制御
///
/// 状態は「ユーザーが音楽を望んでいるか」の一つだけを持つ。実際に鳴らすかどうかは
/// ナレーション中の連動フラグと合わせて毎回導出する。
pub struct AmbienceController {
    inner: Arc<Inner>,
    events_task: JoinHandle<()>,
}

struct Inner {
    playback: PlaybackController,
    state: Mutex<AmbienceState>,
}

#[derive(Debug)]
struct AmbienceState {
    tracks: Vec<String>,
    index: usize,
    loaded: Option<usize>,
    user_playing: bool,
    narration_active: bool,
    coupled: bool,
}

impl AmbienceState {
    fn should_play(&self) -> bool {
        self.user_playing && !(self.coupled && self.narration_active) && !self.tracks.is_empty()
    }
}

impl AmbienceController {
    /// 開始トラックはランダムに選ぶ。tokio ランタイム内で呼ぶこと
    pub fn new(backend: Arc<dyn AudioPlayback>, tracks: Vec<String>, coupled: bool) -> Self {
        let start = if tracks.is_empty() {
            0
        } else {
            rand::rng().random_range(0..tracks.len())
        };
        Self::with_start_index(backend, tracks, coupled, start)
    }

    pub fn with_start_index(
        backend: Arc<dyn AudioPlayback>,
        tracks: Vec<String>,
        coupled: bool,
        start: usize,
    ) -> Self {
        let (playback, events) = PlaybackController::new(backend);
        playback.set_volume(DEFAULT_AMBIENCE_VOLUME);
        let index = if tracks.is_empty() { 0 } else { start % tracks.len() };
        let inner = Arc::new(Inner {
            playback,
            state: Mutex::new(AmbienceState {
                tracks,
                index,
                loaded: None,
                user_playing: false,
                narration_active: false,
                coupled,
            }),
        });
        let events_task = tokio::spawn(run_events(Arc::downgrade(&inner), events));
        Self { inner, events_task }
    }

    /// 再生/一時停止を切り替え、切り替え後の is_user_playing を返す
    pub fn toggle_play_pause(&self) -> Result<bool, AppError> {
        let mut s = self.inner.state.lock();
        s.user_playing = !s.user_playing;
        log::info!("Ambience user_playing = {}", s.user_playing);
        self.inner.apply(&mut s)?;
        Ok(s.user_playing)
    }

    /// ナレーションの開始/終了を通知する。連動時は即座に止める/再開する
    pub fn set_narration_active(&self, active: bool) {
        let mut s = self.inner.state.lock();
        if s.narration_active == active {
            return;
        }
        s.narration_active = active;
        if let Err(e) = self.inner.apply(&mut s) {
            log::warn!("Ambience could not resume: {e}");
        }
    }

    pub fn set_coupled(&self, coupled: bool) {
        let mut s = self.inner.state.lock();
        s.coupled = coupled;
        if let Err(e) = self.inner.apply(&mut s) {
            log::warn!("Ambience could not resume: {e}");
        }
    }

    /// 0 より大きい音量を設定するとミュートも解除する
    pub fn set_volume(&self, volume: u8) {
        self.inner.playback.set_volume(volume);
        if volume > 0 {
            self.inner.playback.set_muted(false);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.playback.set_muted(muted);
    }

    pub fn is_user_playing(&self) -> bool {
        self.inner.state.lock().user_playing
    }

    /// 実際に鳴っているか
    pub fn is_audible(&self) -> bool {
        self.inner.playback.state() == PlayState::Playing && self.inner.playback.effective_gain() > 0.0
    }

    pub fn current_track(&self) -> Option<String> {
        let s = self.inner.state.lock();
        s.tracks.get(s.index).cloned()
    }

    pub fn volume(&self) -> u8 {
        self.inner.playback.snapshot().volume
    }
}

impl Drop for AmbienceController {
    fn drop(&mut self) {
        self.events_task.abort();
        self.inner.playback.stop();
    }
}

impl Inner {
    fn apply(&self, s: &mut AmbienceState) -> Result<(), AppError> {
        if !s.should_play() {
            self.playback.pause();
            return Ok(());
        }

        if s.loaded != Some(s.index) {
            let url = s.tracks[s.index].clone();
            self.playback.load(AudioSource::Url(url.clone()))?;
            s.loaded = Some(s.index);
            log::debug!("Ambience track loaded: {url}");
        }
        if let Err(e) = self.playback.play() {
            s.user_playing = false;
            return Err(e);
        }
        Ok(())
    }

    fn advance(&self) {
        let mut s = self.state.lock();
        if s.tracks.is_empty() {
            return;
        }
        s.index = (s.index + 1) % s.tracks.len();
        s.loaded = None;
        if let Err(e) = self.apply(&mut s) {
            log::warn!("Ambience could not start next track: {e}");
        }
    }
}

async fn run_events(inner: Weak<Inner>, mut events: PlaybackEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            PlaybackEvent::Ended => inner.advance(),
            PlaybackEvent::Failed(e) => {
                log::warn!("Ambience track failed, skipping: {e}");
                inner.advance();
            }
            PlaybackEvent::Ready { .. } | PlaybackEvent::Progress { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::playback::SimulatedPlayback;
    use std::time::Duration;

    fn tracks() -> Vec<String> {
        vec![
            "/music/a.mp3".to_string(),
            "/music/b.mp3".to_string(),
            "/music/c.mp3".to_string(),
        ]
    }

    fn backend(url_secs: f64) -> Arc<SimulatedPlayback> {
        Arc::new(
            SimulatedPlayback::new()
                .with_tick(Duration::from_millis(100))
                .with_url_duration(url_secs),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_coupled_yields_to_narration() {
        let backend = backend(120.0);
        let ambience = AmbienceController::with_start_index(backend.clone(), tracks(), true, 0);

        assert!(ambience.toggle_play_pause().unwrap());
        assert!(backend.is_playing());
        assert!((backend.gain() - 0.3).abs() < f32::EPSILON);

        ambience.set_narration_active(true);
        assert!(!backend.is_playing());
        assert!(ambience.is_user_playing());

        ambience.set_narration_active(false);
        assert!(backend.is_playing());
        assert_eq!(backend.current_url().as_deref(), Some("/music/a.mp3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncoupled_ignores_narration() {
        let backend = backend(120.0);
        let ambience = AmbienceController::with_start_index(backend.clone(), tracks(), false, 1);
        ambience.toggle_play_pause().unwrap();
        ambience.set_narration_active(true);
        assert!(backend.is_playing());
        assert_eq!(ambience.current_track().as_deref(), Some("/music/b.mp3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_narration_end_does_not_start_unwanted_music() {
        let backend = backend(120.0);
        let ambience = AmbienceController::with_start_index(backend.clone(), tracks(), true, 0);
        ambience.set_narration_active(true);
        ambience.set_narration_active(false);
        assert!(!backend.is_playing());
        assert!(!ambience.is_audible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_advances_and_wraps() {
        let backend = backend(1.0);
        let ambience = AmbienceController::with_start_index(backend.clone(), tracks(), true, 2);
        ambience.toggle_play_pause().unwrap();
        assert_eq!(backend.current_url().as_deref(), Some("/music/c.mp3"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ambience.current_track().as_deref(), Some("/music/a.mp3"));
        assert_eq!(backend.current_url().as_deref(), Some("/music/a.mp3"));
        assert!(backend.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_play_clears_user_playing() {
        let backend = backend(120.0);
        let ambience = AmbienceController::with_start_index(backend.clone(), tracks(), true, 0);
        backend.block_next_plays(1);
        assert!(ambience.toggle_play_pause().is_err());
        assert!(!ambience.is_user_playing());

        assert!(ambience.toggle_play_pause().unwrap());
        assert!(backend.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_unmutes() {
        let backend = backend(120.0);
        let ambience = AmbienceController::with_start_index(backend.clone(), tracks(), true, 0);
        ambience.toggle_play_pause().unwrap();
        ambience.set_muted(true);
        assert!(!ambience.is_audible());
        ambience.set_volume(50);
        assert!(ambience.is_audible());
        assert_eq!(ambience.volume(), 50);
        assert!((backend.gain() - 0.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_random_start_in_range() {
        let ambience = AmbienceController::new(backend(120.0), tracks(), true);
        assert!(ambience.current_track().is_some());

        let empty = AmbienceController::new(backend(120.0), Vec::new(), true);
        assert!(empty.toggle_play_pause().unwrap());
        assert!(!empty.is_audible());
    }
}
