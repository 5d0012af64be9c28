use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// 呼び出し側の評価要求ごとに振られる ID（セッション内で単調増加）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// エンジンへ送った `go` 1回ごとに振られる ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchId(pub u64);

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "search#{}", self.0)
    }
}

/// 局面変化1回分の評価要求。生成後は変更しない。
#[derive(Clone, Debug)]
pub struct EvaluationRequest {
    pub id: RequestId,
    pub fen: String,
    pub depth: u32,
    pub created_at: Instant,
}

/// 評価結果。`score` は手番側から見たセンチポーン値で、詰みは ±[`MATE_SCORE`]。
///
/// [`MATE_SCORE`]: crate::protocol::MATE_SCORE
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub score: i32,
    pub best_move: Option<String>,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub ready: bool,
    pub pending_count: usize,
    /// 現在（または直近）のワーカー世代。再起動ごとに増える。
    pub worker_generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_and_status_serialize_camel_case() {
        let result = EvaluationResult { score: 34, best_move: Some("e2e4".to_string()) };
        assert_eq!(serde_json::to_value(&result).unwrap(), json!({"score": 34, "bestMove": "e2e4"}));

        let none = EvaluationResult { score: 0, best_move: None };
        assert_eq!(serde_json::to_value(&none).unwrap(), json!({"score": 0, "bestMove": null}));

        let status = SessionStatus { ready: true, pending_count: 1, worker_generation: 3 };
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            json!({"ready": true, "pendingCount": 1, "workerGeneration": 3})
        );
        assert_eq!(serde_json::to_value(RequestId(7)).unwrap(), json!(7));
    }

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(RequestId(4).to_string(), "req#4");
        assert_eq!(SearchId(9).to_string(), "search#9");
    }
}
