//! stdout へ出す JSON 行
//!
//! stdout には JSON 以外を書かない（ログは stderr）。

use std::io::{self, Write};

use coach_engine::{EngineResult, EvaluationResult, SessionStatus};
use serde::Serialize;

/// 評価1件の結果行
#[derive(Serialize, Debug)]
pub struct EvaluationLine<'a> {
    pub id: u64,
    pub fen: &'a str,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum Outcome {
    Evaluated(EvaluationResult),
    Failed { error: String },
}

impl<'a> EvaluationLine<'a> {
    pub fn new(id: u64, fen: &'a str, result: EngineResult<EvaluationResult>) -> Self {
        let outcome = match result {
            Ok(result) => Outcome::Evaluated(result),
            Err(e) => Outcome::Failed { error: e.to_string() },
        };
        Self { id, fen, outcome }
    }
}

/// `status` 制御行への応答
#[derive(Serialize, Debug)]
pub struct StatusLine {
    pub status: SessionStatus,
}

/// 1行書いて flush する。
pub fn emit<T: Serialize>(value: &T) -> io::Result<()> {
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    let mut out = io::stdout().lock();
    writeln!(out, "{json}")?;
    out.flush()
}
