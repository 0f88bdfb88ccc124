use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{NarrationEngine, NarrationError, NarrationOutput, NarrationRequest};
use crate::domain::types::{Choice, Genre};

/// ScriptedNarrator: APIキーなしで動く定型文の物語エンジン。
/// キューに積んだ出力があればそれを優先して返す（テスト用）。
pub struct ScriptedNarrator {
    queued: Mutex<VecDeque<Result<NarrationOutput, NarrationError>>>,
    requests: Mutex<Vec<NarrationRequest>>,
}

impl ScriptedNarrator {
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 次の narrate 呼び出しで返す結果を積む
    pub fn enqueue(&self, result: Result<NarrationOutput, NarrationError>) {
        self.queued.lock().push_back(result);
    }

    /// これまでに受け取ったリクエスト
    pub fn requests(&self) -> Vec<NarrationRequest> {
        self.requests.lock().clone()
    }
}

impl Default for ScriptedNarrator {
    fn default() -> Self {
        Self::new()
    }
}

fn scene(genre: Genre) -> (&'static str, [(&'static str, &'static str); 2]) {
    match genre {
        Genre::Fantasy => (
            "Silver light drifted between the ancient trees, and a small dragon yawned beside a sleeping brook.",
            [
                ("Follow the glowing butterfly", "It flutters toward a hidden glade"),
                ("Rest beside the dragon", "Its warm breath hums a lullaby"),
            ],
        ),
        Genre::Adventure => (
            "The little boat rocked softly as the lantern painted gold on the calm water.",
            [
                ("Row toward the lighthouse", "Its slow beam sweeps the bay"),
                ("Drift along the reeds", "Frogs sing a sleepy chorus"),
            ],
        ),
        Genre::Mystery => (
            "A quiet clock ticked in the library, and one book glowed faintly on the highest shelf.",
            [
                ("Open the glowing book", "Its pages whisper old secrets"),
                ("Follow the ticking sound", "It leads somewhere warm"),
            ],
        ),
        Genre::Peaceful => (
            "Soft rain tapped on the garden leaves while the evening air smelled of lavender.",
            [
                ("Walk to the quiet pond", "Moonlight rests on the water"),
                ("Lie down in the meadow", "Stars blink one by one"),
            ],
        ),
    }
}

#[async_trait]
impl NarrationEngine for ScriptedNarrator {
    async fn narrate(&self, req: &NarrationRequest) -> Result<NarrationOutput, NarrationError> {
        self.requests.lock().push(req.clone());

        if let Some(result) = self.queued.lock().pop_front() {
            return result;
        }

        let (opening, options) = scene(req.genre);
        let text = match &req.previous_choice_text {
            Some(choice) => format!(
                "Chapter {}. You chose to {}. {opening}",
                req.chapter_index,
                choice.to_lowercase()
            ),
            None => format!("Chapter {}. {opening}", req.chapter_index),
        };
        let choices = options
            .iter()
            .enumerate()
            .map(|(i, (label, description))| {
                Choice::new(format!("choice_{}", i + 1), *label, *description)
            })
            .collect();

        Ok(NarrationOutput { text, choices })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
