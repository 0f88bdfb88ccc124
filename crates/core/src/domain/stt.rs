use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── AudioClip ───────────────────────────────────────────────────

/// 文字起こし対象の短い録音クリップ。
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// クリップ固有ID (UUID v4)
    pub id: Uuid,
    /// 録音開始時刻 (UTC)
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// クリップ長 (ミリ秒)
    pub duration_ms: u32,
    /// サンプルレート (Hz)
    pub sample_rate: u32,
    /// インメモリPCMサンプル (f32, mono)。発話判定に使う。
    pub samples: Option<Vec<f32>>,
    /// エンコード済み音声 (アップロードされたwebm等)
    pub encoded: Option<EncodedAudio>,
    /// 言語ヒント (例: "en")
    pub language: Option<String>,
}

/// エンコード済み音声バイト列。
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    /// MIMEタイプ (例: "audio/webm", "audio/wav")
    pub mime: String,
    pub file_name: String,
}

impl AudioClip {
    /// PCMサンプルから AudioClip を生成する。duration_ms は自動算出。
    pub fn from_samples(
        samples: Vec<f32>,
        sample_rate: u32,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let duration_ms = if sample_rate > 0 {
            ((samples.len() as f64 / sample_rate as f64) * 1000.0) as u32
        } else {
            0
        };
        Self {
            id: Uuid::new_v4(),
            started_at,
            duration_ms,
            sample_rate,
            samples: Some(samples),
            encoded: None,
            language: None,
        }
    }

    /// アップロードされたエンコード済み音声から AudioClip を生成する。
    pub fn from_encoded(bytes: Vec<u8>, mime: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            duration_ms: 0,
            sample_rate: 0,
            samples: None,
            encoded: Some(EncodedAudio {
                bytes,
                mime: mime.into(),
                file_name: file_name.into(),
            }),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

// ─── Transcript ──────────────────────────────────────────────────

/// 文字起こし結果。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    /// 信頼度スコア (0.0–1.0)。エンジンが提供しない場合は None。
    pub confidence: Option<f32>,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

// ─── SttError ────────────────────────────────────────────────────

/// STT処理で発生するエラー。
#[derive(Debug, Clone)]
pub struct SttError {
    pub kind: SttErrorKind,
    pub detail: String,
    /// リトライで回復可能かどうか
    pub recoverable: bool,
}

impl std::fmt::Display for SttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SttError::{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for SttError {}

/// STTエラー種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SttErrorKind {
    /// 音声フォーマットが不正/非対応
    AudioFormat,
    /// STTエンジンが利用不可 (APIキー未設定等)
    EngineNotAvailable,
    /// 文字起こし処理中のエラー
    TranscriptionFailed,
    Timeout,
}

impl SttError {
    pub fn audio_format(detail: impl Into<String>) -> Self {
        Self { kind: SttErrorKind::AudioFormat, detail: detail.into(), recoverable: false }
    }

    pub fn engine_not_available(detail: impl Into<String>) -> Self {
        Self { kind: SttErrorKind::EngineNotAvailable, detail: detail.into(), recoverable: false }
    }

    pub fn transcription_failed(detail: impl Into<String>) -> Self {
        Self { kind: SttErrorKind::TranscriptionFailed, detail: detail.into(), recoverable: true }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self { kind: SttErrorKind::Timeout, detail: detail.into(), recoverable: true }
    }
}

// ─── SttContext ──────────────────────────────────────────────────

/// STTエンジンに渡すコンテキスト。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SttContext {
    /// 言語指定 (AudioClip.language より優先)
    pub language: Option<String>,
    /// 認識ヒント (選択肢のラベル等)
    pub prompt_hints: Vec<String>,
}

// ─── SttEngine trait ─────────────────────────────────────────────

/// 文字起こしアダプタのコアトレイト。
///
/// `async_trait` を使用して dyn SttEngine (トレイトオブジェクト) として利用可能にする。
#[async_trait::async_trait]
pub trait SttEngine: Send + Sync {
    async fn transcribe(&self, clip: &AudioClip, ctx: &SttContext) -> Result<Transcript, SttError>;

    /// エンジン名 (例: "whisper-1", "remote")。
    fn name(&self) -> &str;
}

// ─── Tests ───────────────────────────────────────────────────────
