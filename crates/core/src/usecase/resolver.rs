use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::error::AppError;
use crate::domain::matcher::match_choice;
use crate::domain::resolution::{Resolution, ResolutionPath};
use crate::domain::stt::{SttContext, SttEngine};
use crate::domain::types::Choice;
use crate::infra::audio::{AudioCapture, SpeechGate, SpeechGateConfig};

/// 選択フェーズの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// 再生終了から選択受付までの待ち (ms)
    pub start_delay_ms: u64,
    /// None ならタイムアウト経路なし
    pub countdown_secs: Option<u32>,
    /// None なら音声経路なし
    pub voice: Option<VoiceListenConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: 1000,
            countdown_secs: Some(45),
            voice: None,
        }
    }
}

impl ResolverConfig {
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceListenConfig {
    /// 録音ウィンドウ (ms)
    pub window_ms: u64,
    /// 何も決まらなければこの秒数で眠ったとみなす
    pub sleep_after_secs: u64,
    /// 録音デバイスエラー後の待ち (ms)
    pub retry_backoff_ms: u64,
    pub gate: SpeechGateConfig,
}

impl Default for VoiceListenConfig {
    fn default() -> Self {
        Self {
            window_ms: 5000,
            sleep_after_secs: 60,
            retry_backoff_ms: 1000,
            gate: SpeechGateConfig::default(),
        }
    }
}

/// 音声経路の入力
#[derive(Clone)]
pub struct VoiceInputs {
    pub capture: Arc<dyn AudioCapture>,
    pub transcriber: Arc<dyn SttEngine>,
}

/// 音声経路の状態（表示用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Off,
    Recording,
    Transcribing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CellStatus {
    Pending,
    Resolved(Resolution),
    Abandoned,
}

struct CellState {
    settled: bool,
    cancels: Vec<JoinHandle<()>>,
}

/// 一度だけ書き込める結果セル
///
/// 最初の resolve が勝ち、登録済みのタスクをその場で abort する。以後の resolve は無視。
pub struct ResolutionCell {
    state: Mutex<CellState>,
    status: watch::Sender<CellStatus>,
}

impl ResolutionCell {
    fn new() -> Self {
        let (status, _) = watch::channel(CellStatus::Pending);
        Self {
            state: Mutex::new(CellState {
                settled: false,
                cancels: Vec::new(),
            }),
            status,
        }
    }

    /// 勝った場合のみ true
    pub fn resolve(&self, outcome: Resolution) -> bool {
        self.settle(CellStatus::Resolved(outcome))
    }

    /// 結果を出さずに終わらせる
    pub fn abandon(&self) -> bool {
        self.settle(CellStatus::Abandoned)
    }

    fn settle(&self, status: CellStatus) -> bool {
        let cancels = {
            let mut s = self.state.lock();
            if s.settled {
                return false;
            }
            s.settled = true;
            std::mem::take(&mut s.cancels)
        };
        for handle in cancels {
            handle.abort();
        }
        self.status.send_replace(status);
        true
    }

    /// 決着済みなら即 abort する
    fn register(&self, handle: JoinHandle<()>) {
        let mut s = self.state.lock();
        if s.settled {
            handle.abort();
        } else {
            s.cancels.push(handle);
        }
    }

    pub fn outcome(&self) -> Option<Resolution> {
        match &*self.status.borrow() {
            CellStatus::Resolved(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().settled
    }
}

/// 2択からランダムに選ぶ
pub fn random_choice<'a, R: Rng + ?Sized>(choices: &'a [Choice; 2], rng: &mut R) -> &'a Choice {
    &choices[rng.random_range(0..choices.len())]
}

/// 1チャプター分の選択受付。手動・カウントダウン・音声・睡眠タイマーが競争する
///
/// drop すると結果を出さずに全経路を止める。
pub struct ResolutionSession {
    cell: Arc<ResolutionCell>,
    choices: [Choice; 2],
    remaining: watch::Receiver<Option<u32>>,
    listening: watch::Receiver<ListenState>,
}

impl ResolutionSession {
    /// 経路タスクを起動する。tokio ランタイム内で呼ぶこと
    pub fn start(choices: [Choice; 2], config: &ResolverConfig, voice: Option<VoiceInputs>) -> Self {
        let cell = Arc::new(ResolutionCell::new());
        let (remaining_tx, remaining) = watch::channel(config.countdown_secs);
        let (listening_tx, listening) = watch::channel(ListenState::Off);

        if let Some(secs) = config.countdown_secs {
            let handle = tokio::spawn(run_countdown(
                cell.clone(),
                choices.clone(),
                secs,
                remaining_tx,
            ));
            cell.register(handle);
        }

        match (&config.voice, voice) {
            (Some(listen), Some(inputs)) => {
                let sleep_after = Duration::from_secs(listen.sleep_after_secs);
                let c = cell.clone();
                cell.register(tokio::spawn(async move {
                    tokio::time::sleep(sleep_after).await;
                    if c.resolve(Resolution::Sleep) {
                        log::info!("No choice heard, listener fell asleep");
                    }
                }));
                cell.register(tokio::spawn(run_voice(
                    cell.clone(),
                    choices.clone(),
                    listen.clone(),
                    inputs,
                    listening_tx,
                )));
            }
            (Some(_), None) => log::warn!("Voice choice enabled but no capture available"),
            _ => {}
        }

        log::debug!(
            "Choice collection started: countdown={:?} voice={}",
            config.countdown_secs,
            config.voice.is_some()
        );
        Self {
            cell,
            choices,
            remaining,
            listening,
        }
    }

    pub fn choices(&self) -> &[Choice; 2] {
        &self.choices
    }

    /// 手動選択。未知の id はエラーで、確定しない。既に決着済みなら Ok(false)
    pub fn select(&self, choice_id: &str) -> Result<bool, AppError> {
        let choice = self
            .choices
            .iter()
            .find(|c| c.id == choice_id)
            .ok_or_else(|| AppError::validation(format!("Unknown choice id: {choice_id}")))?;
        Ok(self.cell.resolve(Resolution::Choice {
            choice_id: choice.id.clone(),
            path: ResolutionPath::Manual,
        }))
    }

    /// 位置 (0 or 1) で選ぶ
    pub fn select_index(&self, index: usize) -> Result<bool, AppError> {
        let id = self
            .choices
            .get(index)
            .map(|c| c.id.clone())
            .ok_or_else(|| AppError::validation(format!("No choice at position {}", index + 1)))?;
        self.select(&id)
    }

    pub fn remaining_secs(&self) -> Option<u32> {
        *self.remaining.borrow()
    }

    /// カウントダウンの購読
    pub fn countdown(&self) -> watch::Receiver<Option<u32>> {
        self.remaining.clone()
    }

    pub fn listening(&self) -> ListenState {
        *self.listening.borrow()
    }

    pub fn outcome(&self) -> Option<Resolution> {
        self.cell.outcome()
    }

    pub fn abandon(&self) {
        if self.cell.abandon() {
            log::debug!("Choice collection abandoned");
        }
    }

    /// 決着を待つ。中断された場合は None
    pub async fn wait(&self) -> Option<Resolution> {
        let mut rx = self.cell.status.subscribe();
        let status = rx
            .wait_for(|s| *s != CellStatus::Pending)
            .await
            .ok()?
            .clone();
        match status {
            CellStatus::Resolved(r) => Some(r),
            CellStatus::Pending | CellStatus::Abandoned => None,
        }
    }
}

impl Drop for ResolutionSession {
    fn drop(&mut self) {
        self.cell.abandon();
    }
}

async fn run_countdown(
    cell: Arc<ResolutionCell>,
    choices: [Choice; 2],
    secs: u32,
    remaining_tx: watch::Sender<Option<u32>>,
) {
    let mut remaining = secs;
    remaining_tx.send_replace(Some(remaining));
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;
    while remaining > 0 {
        interval.tick().await;
        remaining -= 1;
        remaining_tx.send_replace(Some(remaining));
    }

    let choice_id = {
        let mut rng = rand::rng();
        random_choice(&choices, &mut rng).id.clone()
    };
    if cell.resolve(Resolution::Choice {
        choice_id: choice_id.clone(),
        path: ResolutionPath::Timeout,
    }) {
        log::info!("Countdown expired, picked {choice_id}");
    }
}

async fn run_voice(
    cell: Arc<ResolutionCell>,
    choices: [Choice; 2],
    config: VoiceListenConfig,
    inputs: VoiceInputs,
    listening_tx: watch::Sender<ListenState>,
) {
    let gate = SpeechGate::new(config.gate.clone());
    let window = Duration::from_millis(config.window_ms);
    let ctx = SttContext {
        language: Some("en".to_string()),
        prompt_hints: choices.iter().map(|c| c.label.clone()).collect(),
    };

    loop {
        listening_tx.send_replace(ListenState::Recording);
        let clip = match inputs.capture.record(window).await {
            Ok(clip) => clip,
            Err(e) => {
                log::warn!("Voice capture failed: {e}");
                listening_tx.send_replace(ListenState::Off);
                tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)).await;
                continue;
            }
        };

        if !gate.passes(&clip) {
            continue;
        }

        listening_tx.send_replace(ListenState::Transcribing);
        let transcript = match inputs.transcriber.transcribe(&clip, &ctx).await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Transcription failed, treating as no match: {e}");
                continue;
            }
        };

        match match_choice(&transcript.text, &choices) {
            Some(choice) => {
                if cell.resolve(Resolution::Choice {
                    choice_id: choice.id.clone(),
                    path: ResolutionPath::Voice,
                }) {
                    log::info!("Heard {:?}, picked {}", transcript.text, choice.id);
                }
                listening_tx.send_replace(ListenState::Off);
                return;
            }
            None => log::info!("No choice matched {:?}", transcript.text),
        }
    }
}
