use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use super::{AudioCapture, CaptureError};
use crate::domain::stt::AudioClip;

/// 停止確認の間隔
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// キャプチャ設定（実際のデバイスから取得した値）
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// デバイスの存在と設定を事前チェックする（stream は作らない）
pub fn check_device() -> Result<CaptureConfig, CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

    let supported_config = device
        .default_input_config()
        .map_err(|e| CaptureError::Config(e.to_string()))?;

    Ok(CaptureConfig {
        sample_rate: supported_config.sample_rate().0,
        channels: supported_config.channels(),
    })
}

/// cpal のデフォルト入力デバイスから録音する。
///
/// cpal::Stream は Send ではないため、録音ごとにブロッキングスレッド上で
/// stream を作り、ウィンドウ終了か中断で drop する。
pub struct MicrophoneCapture;

/// record の future が drop されたら録音スレッドに停止を伝える
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl MicrophoneCapture {
    pub fn new() -> Result<Self, CaptureError> {
        let config = check_device()?;
        log::info!(
            "Microphone available: {}Hz, {} channels",
            config.sample_rate,
            config.channels
        );
        Ok(Self)
    }
}

#[async_trait]
impl AudioCapture for MicrophoneCapture {
    async fn record(&self, window: Duration) -> Result<AudioClip, CaptureError> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let _stop = StopOnDrop(stop_flag.clone());

        let started_at = chrono::Utc::now();
        let (samples, sample_rate) =
            tokio::task::spawn_blocking(move || record_blocking(window, stop_flag))
                .await
                .map_err(|e| CaptureError::Stream(format!("capture thread failed: {e}")))??;

        Ok(AudioClip::from_samples(samples, sample_rate, started_at))
    }
}

fn record_blocking(
    window: Duration,
    stop_flag: Arc<AtomicBool>,
) -> Result<(Vec<f32>, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

    let supported_config = device
        .default_input_config()
        .map_err(|e| CaptureError::Config(e.to_string()))?;

    let sample_rate = supported_config.sample_rate().0;
    let channels = supported_config.channels();
    let sample_format = supported_config.sample_format();

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(Vec::<f32>::with_capacity(
        (sample_rate as f64 * window.as_secs_f64()) as usize,
    )));

    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            let buf = buffer.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    buf.lock().extend(to_mono(data, channels));
                },
                |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let buf = buffer.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                    let f32_data: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    buf.lock().extend(to_mono(&f32_data, channels));
                },
                |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
        }
        format => {
            return Err(CaptureError::Config(format!(
                "Unsupported sample format: {:?}",
                format
            )));
        }
    }
    .map_err(|e| CaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;
    log::debug!("Recording window started: {:?} @ {}Hz", window, sample_rate);

    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if stop_flag.load(Ordering::Relaxed) {
            log::debug!("Recording aborted");
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    drop(stream);

    let samples = std::mem::take(&mut *buffer.lock());
    Ok((samples, sample_rate))
}

/// ステレオ → モノ変換（チャンネル平均）
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
