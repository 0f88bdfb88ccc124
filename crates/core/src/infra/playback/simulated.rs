use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{AudioPlayback, AudioSource, BackendEvent, PlaybackError, SourceToken};

/// 時計駆動の再生バックエンド。音は出さず、経過時間だけを進める。
///
/// バイト列の長さは 128kbps として再生時間を見積もる。
pub struct SimulatedPlayback {
    inner: Arc<Mutex<SimState>>,
    tick: Duration,
    bitrate_bps: f64,
    url_duration_secs: f64,
    blocked_plays: AtomicUsize,
}

#[derive(Default)]
struct SimState {
    token: Option<SourceToken>,
    url: Option<String>,
    duration: f64,
    position: f64,
    playing: bool,
    gain: f32,
    events: Option<mpsc::UnboundedSender<BackendEvent>>,
    ticker: Option<JoinHandle<()>>,
}

impl SimState {
    fn emit(&self, event: BackendEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

impl SimulatedPlayback {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                gain: 1.0,
                ..SimState::default()
            })),
            tick: Duration::from_millis(250),
            bitrate_bps: 128_000.0,
            url_duration_secs: 180.0,
            blocked_plays: AtomicUsize::new(0),
        }
    }

    /// 進捗イベントの間隔
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// URL音源の仮の再生時間
    pub fn with_url_duration(mut self, secs: f64) -> Self {
        self.url_duration_secs = secs.max(0.0);
        self
    }

    /// 次の n 回の play を自動再生拒否として失敗させる
    pub fn block_next_plays(&self, n: usize) {
        self.blocked_plays.store(n, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    pub fn position(&self) -> f64 {
        self.inner.lock().position
    }

    pub fn gain(&self) -> f32 {
        self.inner.lock().gain
    }

    pub fn current_url(&self) -> Option<String> {
        self.inner.lock().url.clone()
    }

    fn spawn_ticker(&self, token: SourceToken) -> Result<JoinHandle<()>, PlaybackError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PlaybackError::Backend(format!("no tokio runtime: {e}")))?;
        let inner = self.inner.clone();
        let tick = self.tick;

        Ok(runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut s = inner.lock();
                if !s.playing || s.token != Some(token) {
                    break;
                }
                s.position = (s.position + tick.as_secs_f64()).min(s.duration);
                if s.position >= s.duration {
                    s.playing = false;
                    s.ticker = None;
                    s.emit(BackendEvent::Ended { token });
                    break;
                }
                s.emit(BackendEvent::Progress {
                    token,
                    position_secs: s.position,
                });
            }
        }))
    }
}

impl Default for SimulatedPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayback for SimulatedPlayback {
    fn load(
        &self,
        token: SourceToken,
        source: AudioSource,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<(), PlaybackError> {
        let (duration, url) = match source {
            AudioSource::Bytes { data, mime } => {
                if !mime.starts_with("audio/") {
                    return Err(PlaybackError::Unsupported(mime));
                }
                (data.len() as f64 * 8.0 / self.bitrate_bps, None)
            }
            AudioSource::Url(url) => (self.url_duration_secs, Some(url)),
        };

        let mut s = self.inner.lock();
        s.stop_ticker();
        s.token = Some(token);
        s.url = url;
        s.duration = duration;
        s.position = 0.0;
        s.playing = false;
        s.events = Some(events);
        s.emit(BackendEvent::Ready {
            token,
            duration_secs: duration,
        });
        Ok(())
    }

    fn play(&self) -> Result<(), PlaybackError> {
        let blocked = self
            .blocked_plays
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blocked {
            return Err(PlaybackError::Blocked("autoplay rejected".to_string()));
        }

        let token = {
            let s = self.inner.lock();
            if s.playing {
                return Ok(());
            }
            s.token.ok_or(PlaybackError::NotLoaded)?
        };

        let handle = self.spawn_ticker(token)?;
        let mut s = self.inner.lock();
        if s.token != Some(token) {
            handle.abort();
            return Ok(());
        }
        s.stop_ticker();
        if s.position >= s.duration && s.duration > 0.0 {
            s.position = 0.0;
        }
        s.playing = true;
        s.ticker = Some(handle);
        Ok(())
    }

    fn pause(&self) {
        let mut s = self.inner.lock();
        s.playing = false;
        s.stop_ticker();
    }

    fn seek(&self, position_secs: f64) {
        let mut s = self.inner.lock();
        let Some(token) = s.token else {
            return;
        };
        s.position = position_secs.clamp(0.0, s.duration);
        s.emit(BackendEvent::Progress {
            token,
            position_secs: s.position,
        });
    }

    fn set_gain(&self, gain: f32) {
        self.inner.lock().gain = gain.clamp(0.0, 1.0);
    }

    fn stop(&self) {
        let mut s = self.inner.lock();
        s.stop_ticker();
        s.playing = false;
        s.token = None;
        s.url = None;
        s.position = 0.0;
        s.duration = 0.0;
        s.events = None;
    }
}
