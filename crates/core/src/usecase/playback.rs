use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::error::AppError;
use crate::infra::playback::{AudioPlayback, AudioSource, BackendEvent, SourceToken};

/// 再生状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
    Empty,
    Paused,
    Playing,
    Ended,
}

/// コントローラが外に出すイベント（トークン検査済み）
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    Ready { duration_secs: f64 },
    Progress { current_secs: f64 },
    /// 読み込んだ音源ごとに一度だけ
    Ended,
    Failed(AppError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub token: Option<SourceToken>,
    pub state: PlayState,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub volume: u8,
    pub muted: bool,
}

#[derive(Debug)]
struct Session {
    token: Option<SourceToken>,
    next_token: SourceToken,
    duration: f64,
    position: f64,
    volume: u8,
    muted: bool,
    state: PlayState,
    ended_fired: bool,
}

impl Session {
    fn gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            f32::from(self.volume) / 100.0
        }
    }
}

/// 1つの音声出力のライフサイクルを管理する
pub struct PlaybackController {
    backend: Arc<dyn AudioPlayback>,
    session: Arc<Mutex<Session>>,
    backend_tx: mpsc::UnboundedSender<BackendEvent>,
}

/// 再生イベントの受信側。古いトークンと重複した Ended はここで捨てる
pub struct PlaybackEvents {
    session: Arc<Mutex<Session>>,
    rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl PlaybackController {
    pub fn new(backend: Arc<dyn AudioPlayback>) -> (Self, PlaybackEvents) {
        let (backend_tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Mutex::new(Session {
            token: None,
            next_token: 1,
            duration: 0.0,
            position: 0.0,
            volume: 100,
            muted: false,
            state: PlayState::Empty,
            ended_fired: false,
        }));
        let controller = Self {
            backend,
            session: session.clone(),
            backend_tx,
        };
        (controller, PlaybackEvents { session, rx })
    }

    /// 音源を読み込む。以前の音源に紐づくイベントはすべて無効になる
    pub fn load(&self, source: AudioSource) -> Result<SourceToken, AppError> {
        let (token, gain) = {
            let mut s = self.session.lock();
            let token = s.next_token;
            s.next_token += 1;
            s.token = Some(token);
            s.duration = 0.0;
            s.position = 0.0;
            s.state = PlayState::Paused;
            s.ended_fired = false;
            (token, s.gain())
        };

        if let Err(e) = self.backend.load(token, source, self.backend_tx.clone()) {
            let mut s = self.session.lock();
            if s.token == Some(token) {
                s.token = None;
                s.state = PlayState::Empty;
            }
            log::warn!("Failed to load source {token}: {e}");
            return Err(e.into());
        }
        self.backend.set_gain(gain);
        log::debug!("Loaded source {token}");
        Ok(token)
    }

    /// 再生開始。拒否された場合は PlaybackBlocked を返し、再試行はしない
    ///
    /// 終端まで再生した音源は再生できない。もう一度聞くには load し直す。
    pub fn play(&self) -> Result<(), AppError> {
        match self.session.lock().state {
            PlayState::Empty => return Err(AppError::invalid_state("No source loaded")),
            PlayState::Ended => {
                return Err(AppError::invalid_state(
                    "Source already ended, load it again to replay",
                ))
            }
            PlayState::Paused | PlayState::Playing => {}
        }
        self.backend.play().map_err(|e| {
            log::warn!("Play rejected: {e}");
            AppError::from(e)
        })?;
        self.session.lock().state = PlayState::Playing;
        Ok(())
    }

    pub fn pause(&self) {
        self.backend.pause();
        let mut s = self.session.lock();
        if s.state == PlayState::Playing {
            s.state = PlayState::Paused;
        }
    }

    pub fn toggle_pause(&self) -> Result<(), AppError> {
        if self.state() == PlayState::Playing {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    /// 0..1 の割合でシークする。再生時間が不明なら無視
    pub fn seek(&self, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        let target = {
            let mut s = self.session.lock();
            if s.token.is_none() || s.duration <= 0.0 {
                return;
            }
            let target = fraction.clamp(0.0, 1.0) * s.duration;
            s.position = target;
            target
        };
        self.backend.seek(target);
    }

    /// 音量 (0..=100)。再生状態は変えない
    pub fn set_volume(&self, volume: u8) {
        let gain = {
            let mut s = self.session.lock();
            s.volume = volume.min(100);
            s.gain()
        };
        self.backend.set_gain(gain);
    }

    pub fn set_muted(&self, muted: bool) {
        let gain = {
            let mut s = self.session.lock();
            s.muted = muted;
            s.gain()
        };
        self.backend.set_gain(gain);
    }

    pub fn effective_gain(&self) -> f32 {
        self.session.lock().gain()
    }

    pub fn state(&self) -> PlayState {
        self.session.lock().state
    }

    pub fn current_token(&self) -> Option<SourceToken> {
        self.session.lock().token
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let s = self.session.lock();
        PlaybackSnapshot {
            token: s.token,
            state: s.state,
            position_secs: s.position,
            duration_secs: s.duration,
            volume: s.volume,
            muted: s.muted,
        }
    }

    /// 再生を止めて音源を外す。以後そのトークンのイベントは届かない
    pub fn stop(&self) {
        {
            let mut s = self.session.lock();
            s.token = None;
            s.state = PlayState::Empty;
            s.position = 0.0;
            s.duration = 0.0;
        }
        self.backend.stop();
    }
}

impl PlaybackEvents {
    /// 次の有効なイベントを待つ
    pub async fn recv(&mut self) -> Option<PlaybackEvent> {
        loop {
            let event = self.rx.recv().await?;
            if let Some(event) = self.accept(event) {
                return Some(event);
            }
        }
    }

    fn accept(&self, event: BackendEvent) -> Option<PlaybackEvent> {
        let mut s = self.session.lock();
        if s.token != Some(event.token()) {
            log::trace!("Dropping stale event for source {}", event.token());
            return None;
        }
        match event {
            BackendEvent::Ready { duration_secs, .. } => {
                s.duration = duration_secs;
                Some(PlaybackEvent::Ready { duration_secs })
            }
            BackendEvent::Progress { position_secs, .. } => {
                if s.ended_fired {
                    return None;
                }
                s.position = position_secs;
                Some(PlaybackEvent::Progress {
                    current_secs: position_secs,
                })
            }
            BackendEvent::Ended { .. } => {
                if s.ended_fired {
                    return None;
                }
                s.ended_fired = true;
                s.state = PlayState::Ended;
                s.position = s.duration;
                Some(PlaybackEvent::Ended)
            }
            BackendEvent::Error { message, .. } => {
                s.state = PlayState::Paused;
                Some(PlaybackEvent::Failed(AppError::internal(message)))
            }
        }
    }
}
