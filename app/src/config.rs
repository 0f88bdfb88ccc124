use std::net::SocketAddr;
use std::path::PathBuf;

use es_core::domain::error::AppError;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_CONTRACT_RETRIES: u32 = 2;

/// サーバー設定（環境変数から読む）
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// ":memory:" ならインメモリストア
    pub db_path: String,
    pub openai_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub narration_model: Option<String>,
    pub music_dir: PathBuf,
    pub contract_retries: u32,
}

fn default_db_path() -> String {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eternal-storyteller");
    dir.join("stories.db").to_string_lossy().to_string()
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 空文字の値は未設定として扱う
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = get("ES_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|e| AppError::validation(format!("ES_BIND_ADDR: {e}")))?;

        let contract_retries = match get("ES_CONTRACT_RETRIES") {
            Some(v) => v
                .parse()
                .map_err(|e| AppError::validation(format!("ES_CONTRACT_RETRIES: {e}")))?,
            None => DEFAULT_CONTRACT_RETRIES,
        };

        Ok(Self {
            bind_addr,
            db_path: get("ES_DB_PATH").unwrap_or_else(default_db_path),
            openai_api_key: get("OPENAI_API_KEY"),
            elevenlabs_api_key: get("ELEVENLABS_API_KEY"),
            narration_model: get("ES_NARRATION_MODEL"),
            music_dir: get("ES_MUSIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("music")),
            contract_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.port(), 5000);
        assert!(config.db_path.ends_with("stories.db"));
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.music_dir, PathBuf::from("music"));
        assert_eq!(config.contract_retries, DEFAULT_CONTRACT_RETRIES);
    }

    #[test]
    fn test_overrides_and_blank_values() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("ES_BIND_ADDR", "127.0.0.1:8080"),
            ("ES_DB_PATH", ":memory:"),
            ("OPENAI_API_KEY", "  "),
            ("ELEVENLABS_API_KEY", "xi-key"),
            ("ES_CONTRACT_RETRIES", "0"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.db_path, ":memory:");
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.elevenlabs_api_key.as_deref(), Some("xi-key"));
        assert_eq!(config.contract_retries, 0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("ES_BIND_ADDR", "nowhere")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("ES_CONTRACT_RETRIES", "many")])).is_err());
    }
}
