use serde::{Deserialize, Serialize};

use super::error::AppError;

/// 選択が確定した経路
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    Manual,
    Timeout,
    Voice,
}

/// 選択フェーズの結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Choice {
        choice_id: String,
        path: ResolutionPath,
    },
    /// 誰も選ばないまま眠った
    Sleep,
}

impl Resolution {
    pub fn choice_id(&self) -> Option<&str> {
        match self {
            Self::Choice { choice_id, .. } => Some(choice_id),
            Self::Sleep => None,
        }
    }

    pub fn is_sleep(&self) -> bool {
        matches!(self, Self::Sleep)
    }
}

/// チャプターサイクルの状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    AwaitingPlaybackEnd,
    CollectingChoice,
    Resolved,
}

impl CycleState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingPlaybackEnd => "awaiting_playback_end",
            Self::CollectingChoice => "collecting_choice",
            Self::Resolved => "resolved",
        }
    }
}

/// 状態遷移イベントペイロード
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub chapter_id: Option<u64>,
    pub prev_state: String,
    pub new_state: CycleState,
}

/// チャプターごとの再生→選択→確定サイクル
///
/// 1チャプターにつき選択フェーズは最大1回。確定済みチャプターで
/// 再度サイクルを始めることはできない。
#[derive(Debug)]
pub struct ChoiceCycle {
    state: CycleState,
    chapter_id: Option<u64>,
    outcome: Option<Resolution>,
    last_resolved_chapter: Option<u64>,
    updated_at: String,
}

impl ChoiceCycle {
    pub fn new(now: String) -> Self {
        Self {
            state: CycleState::Idle,
            chapter_id: None,
            outcome: None,
            last_resolved_chapter: None,
            updated_at: now,
        }
    }

    pub fn state(&self) -> &CycleState {
        &self.state
    }

    pub fn chapter_id(&self) -> Option<u64> {
        self.chapter_id
    }

    pub fn outcome(&self) -> Option<&Resolution> {
        self.outcome.as_ref()
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn transition(&mut self, next: CycleState, now: String) -> StateTransition {
        let prev = self.state.as_str().to_string();
        self.state = next;
        self.updated_at = now;
        StateTransition {
            chapter_id: self.chapter_id,
            prev_state: prev,
            new_state: self.state.clone(),
        }
    }

    /// begin_chapter: Idle→AwaitingPlaybackEnd
    pub fn begin_chapter(&mut self, chapter_id: u64, now: String) -> Result<StateTransition, AppError> {
        if self.state != CycleState::Idle {
            return Err(AppError::invalid_state(format!(
                "begin_chapter は {} 状態では実行できません",
                self.state.as_str()
            )));
        }
        if self.last_resolved_chapter == Some(chapter_id) {
            return Err(AppError::invalid_state(format!(
                "チャプター {chapter_id} の選択は確定済みです"
            )));
        }
        self.chapter_id = Some(chapter_id);
        self.outcome = None;
        Ok(self.transition(CycleState::AwaitingPlaybackEnd, now))
    }

    /// on_playback_ended: AwaitingPlaybackEnd→CollectingChoice
    pub fn on_playback_ended(&mut self, now: String) -> Result<StateTransition, AppError> {
        match self.state {
            CycleState::AwaitingPlaybackEnd => Ok(self.transition(CycleState::CollectingChoice, now)),
            ref other => Err(AppError::invalid_state(format!(
                "on_playback_ended は {} 状態では実行できません",
                other.as_str()
            ))),
        }
    }

    /// resolve: CollectingChoice→Resolved
    pub fn resolve(&mut self, outcome: Resolution, now: String) -> Result<StateTransition, AppError> {
        match self.state {
            CycleState::CollectingChoice => {
                self.outcome = Some(outcome);
                self.last_resolved_chapter = self.chapter_id;
                Ok(self.transition(CycleState::Resolved, now))
            }
            ref other => Err(AppError::invalid_state(format!(
                "resolve は {} 状態では実行できません",
                other.as_str()
            ))),
        }
    }

    /// finish: Resolved→Idle。確定した結果を取り出す
    pub fn finish(&mut self, now: String) -> Result<(StateTransition, Resolution), AppError> {
        match self.state {
            CycleState::Resolved => {
                let outcome = self
                    .outcome
                    .take()
                    .ok_or_else(|| AppError::internal("確定結果がありません"))?;
                let t = self.transition(CycleState::Idle, now);
                self.chapter_id = None;
                Ok((t, outcome))
            }
            ref other => Err(AppError::invalid_state(format!(
                "finish は {} 状態では実行できません",
                other.as_str()
            ))),
        }
    }

    /// 中断（ユーザー終了・生成失敗）。どの状態からでも Idle に戻る
    pub fn abandon(&mut self, now: String) -> Option<StateTransition> {
        if self.state == CycleState::Idle {
            return None;
        }
        self.outcome = None;
        let t = self.transition(CycleState::Idle, now);
        self.chapter_id = None;
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> String {
        "2025-01-15T21:30:00Z".to_string()
    }

    fn manual(id: &str) -> Resolution {
        Resolution::Choice {
            choice_id: id.to_string(),
            path: ResolutionPath::Manual,
        }
    }

    #[test]
    fn test_full_cycle() {
        let mut cycle = ChoiceCycle::new(now());
        let t = cycle.begin_chapter(1, now()).unwrap();
        assert_eq!(t.prev_state, "idle");
        assert_eq!(t.new_state, CycleState::AwaitingPlaybackEnd);

        let t = cycle.on_playback_ended(now()).unwrap();
        assert_eq!(t.new_state, CycleState::CollectingChoice);

        let t = cycle.resolve(manual("a"), now()).unwrap();
        assert_eq!(t.new_state, CycleState::Resolved);
        assert_eq!(t.chapter_id, Some(1));

        let (t, outcome) = cycle.finish(now()).unwrap();
        assert_eq!(t.new_state, CycleState::Idle);
        assert_eq!(outcome.choice_id(), Some("a"));
        assert!(cycle.chapter_id().is_none());
    }

    #[test]
    fn test_resolve_before_playback_end_rejected() {
        let mut cycle = ChoiceCycle::new(now());
        cycle.begin_chapter(1, now()).unwrap();
        let err = cycle.resolve(manual("a"), now()).unwrap_err();
        assert!(err.message.contains("awaiting_playback_end"));
    }

    #[test]
    fn test_second_resolve_rejected() {
        let mut cycle = ChoiceCycle::new(now());
        cycle.begin_chapter(1, now()).unwrap();
        cycle.on_playback_ended(now()).unwrap();
        cycle.resolve(manual("a"), now()).unwrap();
        assert!(cycle.resolve(manual("b"), now()).is_err());
        assert_eq!(cycle.outcome().and_then(|o| o.choice_id()), Some("a"));
    }

    #[test]
    fn test_same_chapter_cannot_restart() {
        let mut cycle = ChoiceCycle::new(now());
        cycle.begin_chapter(7, now()).unwrap();
        cycle.on_playback_ended(now()).unwrap();
        cycle.resolve(Resolution::Sleep, now()).unwrap();
        cycle.finish(now()).unwrap();

        assert!(cycle.begin_chapter(7, now()).is_err());
        assert!(cycle.begin_chapter(8, now()).is_ok());
    }

    #[test]
    fn test_begin_while_busy_rejected() {
        let mut cycle = ChoiceCycle::new(now());
        cycle.begin_chapter(1, now()).unwrap();
        assert!(cycle.begin_chapter(2, now()).is_err());
    }

    #[test]
    fn test_abandon_returns_to_idle() {
        let mut cycle = ChoiceCycle::new(now());
        assert!(cycle.abandon(now()).is_none());

        cycle.begin_chapter(1, now()).unwrap();
        cycle.on_playback_ended(now()).unwrap();
        let t = cycle.abandon(now()).unwrap();
        assert_eq!(t.prev_state, "collecting_choice");
        assert_eq!(cycle.state(), &CycleState::Idle);
        assert!(cycle.outcome().is_none());
        // 未確定で中断したチャプターはやり直せる
        assert!(cycle.begin_chapter(1, now()).is_ok());
    }

    #[test]
    fn test_resolution_serde_shape() {
        let json = serde_json::to_value(manual("b")).unwrap();
        assert_eq!(json["kind"], "choice");
        assert_eq!(json["choice_id"], "b");
        assert_eq!(json["path"], "manual");

        let sleep = serde_json::to_value(Resolution::Sleep).unwrap();
        assert_eq!(sleep["kind"], "sleep");
    }
}
