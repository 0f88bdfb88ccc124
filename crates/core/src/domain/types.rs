use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::AppError;

/// 物語ジャンル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Genre {
    Fantasy,
    Adventure,
    Mystery,
    Peaceful,
}

impl Genre {
    pub const ALL: [Genre; 4] = [
        Genre::Fantasy,
        Genre::Adventure,
        Genre::Mystery,
        Genre::Peaceful,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fantasy => "fantasy",
            Self::Adventure => "adventure",
            Self::Mystery => "mystery",
            Self::Peaceful => "peaceful",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Fantasy => "Fantasy",
            Self::Adventure => "Adventure",
            Self::Mystery => "Mystery",
            Self::Peaceful => "Peaceful",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Fantasy => "Dragons, magic, enchanted realms",
            Self::Adventure => "Journeys, exploration, discovery",
            Self::Mystery => "Puzzles, secrets, intrigue",
            Self::Peaceful => "Calm, meditative, soothing",
        }
    }

    /// タイトル未指定時に使うタイトル候補
    pub fn titles(&self) -> &'static [&'static str] {
        match self {
            Self::Fantasy => &[
                "The Enchanted Forest",
                "Moonlit Kingdoms",
                "The Crystal Caves",
                "Whispers of Magic",
            ],
            Self::Adventure => &[
                "Journey to Tomorrow",
                "The Hidden Valley",
                "Across Distant Lands",
                "The Explorer's Tale",
            ],
            Self::Mystery => &[
                "Secrets in the Shadows",
                "The Midnight Puzzle",
                "Whispers in the Dark",
                "The Silent Clue",
            ],
            Self::Peaceful => &[
                "Garden of Dreams",
                "Gentle Streams",
                "The Quiet Valley",
                "Harmony's Embrace",
            ],
        }
    }
}

impl FromStr for Genre {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fantasy" => Ok(Self::Fantasy),
            "adventure" => Ok(Self::Adventure),
            "mystery" => Ok(Self::Mystery),
            "peaceful" => Ok(Self::Peaceful),
            other => Err(AppError::validation(format!("unknown genre: {other}"))),
        }
    }
}

impl std::fmt::Display for Genre {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ナレーター音声
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// 物語（セッションごとに1つ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: u64,
    pub genre: Genre,
    #[serde(alias = "voice")]
    pub voice_id: String,
    pub title: String,
    /// 次に生成するチャプター番号（1始まり、単調増加）
    pub current_chapter_index: u32,
    /// ナレーション要求に引き継ぐ不透明な状態
    pub state_blob: serde_json::Value,
    pub created_at: String,
}

/// 物語作成リクエスト
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStory {
    pub genre: Genre,
    #[serde(alias = "voice")]
    pub voice_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// 物語の部分更新
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryPatch {
    pub title: Option<String>,
    pub current_chapter_index: Option<u32>,
    pub state_blob: Option<serde_json::Value>,
}

/// 選択肢
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    #[serde(alias = "text")]
    pub label: String,
    #[serde(default)]
    pub description: String,
}

impl Choice {
    pub fn new(id: impl Into<String>, label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: description.into(),
        }
    }
}

/// 選択肢がちょうど2つであることを検証して固定長配列に変換する
pub fn validate_choices(choices: Vec<Choice>) -> Result<[Choice; 2], AppError> {
    let count = choices.len();
    let pair: [Choice; 2] = choices.try_into().map_err(|_| {
        AppError::contract_violation(format!("expected exactly 2 choices, got {count}"))
    })?;

    for choice in &pair {
        if choice.id.trim().is_empty() || choice.label.trim().is_empty() {
            return Err(AppError::contract_violation(
                "choice id and label must not be empty",
            ));
        }
    }
    if pair[0].id == pair[1].id {
        return Err(AppError::contract_violation(format!(
            "duplicate choice id: {}",
            pair[0].id
        )));
    }

    Ok(pair)
}

/// チャプター（生成1回ごとに1つ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: u64,
    pub story_id: u64,
    pub chapter_index: u32,
    pub text: String,
    pub audio_ref: Option<String>,
    pub choices: [Choice; 2],
    /// 一度だけ設定される
    pub resolved_choice_text: Option<String>,
    pub created_at: String,
}

impl Chapter {
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.id == choice_id)
    }

    /// id またはラベルで選択肢を探す（大文字小文字は無視）
    pub fn find_choice(&self, id_or_label: &str) -> Option<&Choice> {
        let needle = id_or_label.trim();
        self.choice(needle).or_else(|| {
            self.choices
                .iter()
                .find(|c| c.label.trim().eq_ignore_ascii_case(needle))
        })
    }
}

/// チャプター作成リクエスト（音声バイトはストアが別管理する）
#[derive(Debug, Clone)]
pub struct NewChapter {
    pub story_id: u64,
    pub chapter_index: u32,
    pub text: String,
    pub choices: [Choice; 2],
    pub audio: Option<Vec<u8>>,
}

/// チャプターの部分更新
#[derive(Debug, Clone, Default)]
pub struct ChapterPatch {
    pub resolved_choice_text: Option<String>,
}

/// チャプター音声の参照パス
pub fn chapter_audio_ref(chapter_id: u64) -> String {
    format!("/api/chapters/{chapter_id}/audio")
}

/// BGMトラック
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicTrack {
    pub name: String,
    pub url: String,
}
