use serde::{Deserialize, Serialize};

use crate::domain::stt::AudioClip;

/// 文字起こし前の発話判定の設定。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechGateConfig {
    /// クリップ全体の RMS 閾値 (デフォルト: 0.01)
    pub min_rms: f32,
    /// ピークとみなす振幅 (デフォルト: 0.1)
    pub peak_amplitude: f32,
    /// ピーク振幅を超えるサンプルの割合の下限 (デフォルト: 0.002)
    pub min_peak_ratio: f32,
    /// 最小クリップ長 (ms, デフォルト: 300)
    pub min_duration_ms: u32,
}

impl Default for SpeechGateConfig {
    fn default() -> Self {
        Self {
            min_rms: 0.01,
            peak_amplitude: 0.1,
            min_peak_ratio: 0.002,
            min_duration_ms: 300,
        }
    }
}

/// 判定の内訳（ログ用）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateReading {
    pub rms: f32,
    pub peak_ratio: f32,
    pub duration_ms: u32,
}

/// RMS・ピーク比・長さの3条件で無音クリップを弾く。
pub struct SpeechGate {
    config: SpeechGateConfig,
}

impl SpeechGate {
    pub fn new(config: SpeechGateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SpeechGateConfig {
        &self.config
    }

    pub fn measure(&self, samples: &[f32], duration_ms: u32) -> GateReading {
        if samples.is_empty() {
            return GateReading { rms: 0.0, peak_ratio: 0.0, duration_ms };
        }
        let n = samples.len() as f32;
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / n).sqrt();
        let peaks = samples
            .iter()
            .filter(|s| s.abs() >= self.config.peak_amplitude)
            .count();
        GateReading {
            rms,
            peak_ratio: peaks as f32 / n,
            duration_ms,
        }
    }

    /// 発話を含む可能性があれば true。
    /// PCMを持たないエンコード済みクリップは解析できないので通す。
    pub fn passes(&self, clip: &AudioClip) -> bool {
        let Some(samples) = clip.samples.as_deref() else {
            return clip.encoded.is_some();
        };
        let reading = self.measure(samples, clip.duration_ms);
        let ok = reading.rms >= self.config.min_rms
            && reading.peak_ratio >= self.config.min_peak_ratio
            && reading.duration_ms >= self.config.min_duration_ms;
        if !ok {
            log::trace!("Speech gate rejected clip {}: {:?}", clip.id, reading);
        }
        ok
    }
}

impl Default for SpeechGate {
    fn default() -> Self {
        Self::new(SpeechGateConfig::default())
    }
}
