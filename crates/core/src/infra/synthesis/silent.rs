use async_trait::async_trait;

use super::{SynthesisError, VoiceSynthesizer};

/// 128kbps / 44.1kHz の MPEG-1 Layer III フレーム長
const FRAME_BYTES: usize = 417;
const FRAME_HEADER: [u8; 4] = [0xFF, 0xFB, 0x90, 0x64];
const SECS_PER_FRAME: f64 = 1152.0 / 44100.0;

/// SilentSynthesizer: 無音のMP3フレームを返すオフライン実装。
/// 長さは読み上げ速度（1秒あたり chars_per_sec 文字）から見積もる。
pub struct SilentSynthesizer {
    chars_per_sec: f64,
}

impl SilentSynthesizer {
    pub fn new() -> Self {
        Self { chars_per_sec: 15.0 }
    }

    pub fn with_chars_per_sec(chars_per_sec: f64) -> Self {
        Self {
            chars_per_sec: chars_per_sec.max(1.0),
        }
    }

    fn frames_for(&self, text: &str) -> usize {
        let secs = text.chars().count() as f64 / self.chars_per_sec;
        ((secs / SECS_PER_FRAME).ceil() as usize).max(1)
    }
}

impl Default for SilentSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoiceSynthesizer for SilentSynthesizer {
    async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::Failed("empty text".to_string()));
        }
        let frames = self.frames_for(text);
        let mut out = Vec::with_capacity(frames * FRAME_BYTES);
        for _ in 0..frames {
            out.extend_from_slice(&FRAME_HEADER);
            out.resize(out.len() + FRAME_BYTES - FRAME_HEADER.len(), 0);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "silent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silent_length_tracks_text() {
        let synth = SilentSynthesizer::new();
        let short = synth.synthesize("Hush.", "sarah").await.unwrap();
        let long = synth.synthesize(&"z".repeat(1500), "sarah").await.unwrap();
        assert_eq!(short.len() % FRAME_BYTES, 0);
        assert!(long.len() > short.len());
        assert_eq!(&long[..4], &FRAME_HEADER);
        // 1500文字 / 15文字毎秒 = 約100秒 ≒ 128kbps で約1.6MB
        let secs = long.len() as f64 * 8.0 / 128_000.0;
        assert!((secs - 100.0).abs() < 1.0, "secs = {secs}");
    }

    #[tokio::test]
    async fn test_silent_rejects_empty_text() {
        let synth = SilentSynthesizer::new();
        assert!(synth.synthesize("   ", "sarah").await.is_err());
    }
}
