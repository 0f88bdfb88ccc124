use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::prompts;
use super::{NarrationEngine, NarrationError, NarrationOutput, NarrationRequest};
use crate::domain::types::Choice;

pub const DEFAULT_MODEL: &str = "gpt-4o";
const API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI Chat Completions を使用した物語エンジン
pub struct OpenAiNarrator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    response_format: ResponseFormat,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// モデルが返すJSON本体
#[derive(Deserialize)]
struct ChapterPayload {
    #[serde(default, alias = "text")]
    content: String,
    #[serde(default)]
    choices: Vec<Choice>,
}

impl OpenAiNarrator {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, NarrationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NarrationError::NotAvailable(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: API_BASE.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// モデル応答の本文を解析する
fn parse_chapter(content: &str) -> Result<NarrationOutput, NarrationError> {
    let payload: ChapterPayload = serde_json::from_str(content)
        .map_err(|e| NarrationError::Malformed(format!("JSON parse error: {e}")))?;

    if payload.content.trim().is_empty() {
        return Err(NarrationError::Malformed("empty chapter content".to_string()));
    }

    Ok(NarrationOutput {
        text: payload.content,
        choices: payload.choices,
    })
}

#[async_trait]
impl NarrationEngine for OpenAiNarrator {
    async fn narrate(&self, req: &NarrationRequest) -> Result<NarrationOutput, NarrationError> {
        log::info!(
            "Generating {} chapter {} (previous choice: {})",
            req.genre,
            req.chapter_index,
            req.previous_choice_text.as_deref().unwrap_or("none")
        );

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: prompts::SYSTEM_STORYTELLER.to_string(),
                },
                Message {
                    role: "user",
                    content: prompts::build_user_prompt(req),
                },
            ],
            response_format: ResponseFormat { kind: "json_object" },
            temperature: 0.8,
            max_tokens: 2000,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NarrationError::Timeout
                } else {
                    NarrationError::Failed(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NarrationError::Failed(format!(
                "OpenAI API error: {status} - {body}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| NarrationError::Failed(format!("Response parse error: {e}")))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let output = parse_chapter(&content)?;
        log::debug!(
            "Chapter generated: {} chars, {} choices",
            output.text.len(),
            output.choices.len()
        );
        Ok(output)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
