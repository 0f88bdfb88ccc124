use serde::{Deserialize, Serialize};

/// プレイヤー設定（ストアの settings テーブルに保存される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerSettings {
    /// 自動選択までの秒数
    pub choice_timeout_secs: u32,
    /// 読み上げ速度 (0.5〜1.5)
    pub speech_speed: f32,
    /// 声のトーン (whisper / gentle / normal / warm)
    pub voice_tone: String,
    /// チャプター終端でフェードアウトするか
    pub fade_out: bool,
    /// 音声による選択を有効にするか
    pub voice_choice_enabled: bool,
    /// ナレーション中はBGMを一時停止する
    pub ambience_coupled: bool,
    /// BGM音量 (0〜100)
    pub ambience_volume: u8,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            choice_timeout_secs: 45,
            speech_speed: 1.0,
            voice_tone: "normal".to_string(),
            fade_out: true,
            voice_choice_enabled: false,
            ambience_coupled: true,
            ambience_volume: 30,
        }
    }
}

impl PlayerSettings {
    /// 範囲外の値を丸める
    pub fn normalized(mut self) -> Self {
        self.choice_timeout_secs = self.choice_timeout_secs.clamp(5, 600);
        self.speech_speed = self.speech_speed.clamp(0.5, 1.5);
        self.ambience_volume = self.ambience_volume.min(100);
        self
    }
}
