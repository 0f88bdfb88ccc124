use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AudioCapture, CaptureError};
use crate::domain::stt::AudioClip;

/// ScriptedCapture: 積まれたサンプル列を録音ウィンドウごとに1つずつ返す。
/// キューが空なら無音を返す。マイクのない環境とテスト用。
pub struct ScriptedCapture {
    sample_rate: u32,
    queued: Mutex<VecDeque<Vec<f32>>>,
    started: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

/// 録音中カウンタを drop で戻す
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedCapture {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            queued: Mutex::new(VecDeque::new()),
            started: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push_samples(&self, samples: Vec<f32>) {
        self.queued.lock().push_back(samples);
    }

    /// 開始された録音の回数
    pub fn recordings_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// 現在進行中の録音数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioCapture for ScriptedCapture {
    async fn record(&self, window: Duration) -> Result<AudioClip, CaptureError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        let started_at = chrono::Utc::now();
        tokio::time::sleep(window).await;

        let samples = self.queued.lock().pop_front().unwrap_or_else(|| {
            vec![0.0; (self.sample_rate as f64 * window.as_secs_f64()) as usize]
        });
        Ok(AudioClip::from_samples(samples, self.sample_rate, started_at))
    }
}
