use crate::domain::types::Voice;

/// ナレーター音声カタログ: (id, 表示名, 説明, ElevenLabs voice id)
const CATALOG: [(&str, &str, &str, &str); 3] = [
    ("sarah", "Sarah", "Gentle & Warm", "EXAVITQu4vr4xnSDxMaL"),
    ("david", "David", "Deep & Soothing", "VR6AewLTigWG4xSOukaG"),
    ("luna", "Luna", "Ethereal & Dreamy", "pNInz6obpgDQGcFmaJgB"),
];

pub const DEFAULT_VOICE: &str = "sarah";

pub fn available_voices() -> Vec<Voice> {
    CATALOG
        .iter()
        .map(|(id, name, description, _)| Voice {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
        })
        .collect()
}

pub fn is_known_voice(voice_id: &str) -> bool {
    CATALOG.iter().any(|(id, ..)| *id == voice_id)
}

/// プロバイダ側の voice id。未知の id は sarah にフォールバックする
pub fn provider_voice_id(voice_id: &str) -> &'static str {
    CATALOG
        .iter()
        .find(|(id, ..)| *id == voice_id)
        .or_else(|| CATALOG.iter().find(|(id, ..)| *id == DEFAULT_VOICE))
        .map(|(.., provider)| *provider)
        .unwrap_or(CATALOG[0].3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog() {
        let voices = available_voices();
        assert_eq!(voices.len(), 3);
        assert_eq!(voices[1].name, "David");
        assert_eq!(voices[2].description, "Ethereal & Dreamy");
    }

    #[test]
    fn test_provider_mapping_with_fallback() {
        assert_eq!(provider_voice_id("luna"), "pNInz6obpgDQGcFmaJgB");
        assert_eq!(provider_voice_id("nobody"), provider_voice_id("sarah"));
        assert!(is_known_voice("david"));
        assert!(!is_known_voice("nobody"));
    }
}
