//! UCI protocol translation
//!
//! 送信側は (局面, 深さ) を `stop` / `position fen` / `go depth` のコマンド列へ、
//! 受信側はエンジン出力1行を [`EngineLine`] へ変換する。探索1回分の info 行は
//! [`PartialResult`] に畳み込み、`bestmove` で [`EvaluationResult`] に確定させる。

use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::types::EvaluationResult;

/// 詰みスコアを表す番兵値（符号は詰ませる側。正 = 手番側が詰ませる）
pub const MATE_SCORE: i32 = 10_000;

/// エンジンへ送るコマンド
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCommand {
    Uci,
    SetOption { name: String, value: String },
    Position { fen: String },
    Go { depth: u32 },
    Stop,
    Quit,
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineCommand::Uci => f.write_str("uci"),
            EngineCommand::SetOption { name, value } => {
                write!(f, "setoption name {name} value {value}")
            }
            EngineCommand::Position { fen } => write!(f, "position fen {fen}"),
            EngineCommand::Go { depth } => write!(f, "go depth {depth}"),
            EngineCommand::Stop => f.write_str("stop"),
            EngineCommand::Quit => f.write_str("quit"),
        }
    }
}

/// 探索1回分のコマンド列。先頭の `stop` で実行中の探索を打ち切る
/// （UCI エンジンは打ち切った探索にも必ず `bestmove` を返す）。
pub fn search_commands(fen: &str, depth: u32) -> [EngineCommand; 3] {
    [
        EngineCommand::Stop,
        EngineCommand::Position { fen: fen.to_string() },
        EngineCommand::Go { depth: depth.max(1) },
    ]
}

/// 行プロトコルに流してよい局面文字列かを検査し、前後の空白を除いて返す。
///
/// 合法性の判定はルールライブラリ側の責務なので、ここでは盤面フィールドが
/// 8段あることと改行を含まないことだけを見る。
pub fn validate_fen(fen: &str) -> EngineResult<&str> {
    let fen = fen.trim();
    if fen.is_empty() {
        return Err(EngineError::InvalidPosition("empty position".to_string()));
    }
    if fen.chars().any(|c| c == '\n' || c == '\r') {
        return Err(EngineError::InvalidPosition("line break in position".to_string()));
    }
    let board = fen.split_whitespace().next().unwrap_or_default();
    let ranks = board.split('/').count();
    if ranks != 8 {
        return Err(EngineError::InvalidPosition(format!(
            "expected 8 ranks in board field, found {ranks}: {fen}"
        )));
    }
    Ok(fen)
}

/// 評価値（手番側視点）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Score {
    /// センチポーン
    Cp(i32),
    /// N 手詰め（正 = 手番側が詰ます、負 = 詰まされる）
    Mate(i32),
}

impl Score {
    /// センチポーンへ換算する。詰みは手数によらず ±[`MATE_SCORE`]。
    /// `mate 0` は手番側が既に詰んでいる局面なので負側に倒す。
    pub fn to_centipawns(self) -> i32 {
        match self {
            Score::Cp(cp) => cp,
            Score::Mate(n) if n > 0 => MATE_SCORE,
            Score::Mate(_) => -MATE_SCORE,
        }
    }
}

/// `info` 行のうち評価に使う項目
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub multipv: Option<u32>,
    pub score: Option<Score>,
    pub pv: Vec<String>,
    /// `info string ...` の本文
    pub string: Option<String>,
}

impl InfoLine {
    /// `info` に続くトークン列を解析する。
    fn parse(tokens: &[&str]) -> Self {
        let mut info = InfoLine::default();
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i] {
                "depth" => {
                    if i + 1 < tokens.len() {
                        info.depth = tokens[i + 1].parse::<u32>().ok();
                        i += 1;
                    }
                }
                "multipv" => {
                    if i + 1 < tokens.len() {
                        info.multipv = tokens[i + 1].parse::<u32>().ok();
                        i += 1;
                    }
                }
                "score" => {
                    if i + 2 < tokens.len() {
                        match tokens[i + 1] {
                            "cp" => {
                                info.score = tokens[i + 2].parse::<i32>().ok().map(Score::Cp);
                                i += 2;
                            }
                            "mate" => {
                                info.score = tokens[i + 2].parse::<i32>().ok().map(Score::Mate);
                                i += 2;
                            }
                            _ => {}
                        }
                    }
                }
                "pv" => {
                    info.pv = tokens[i + 1..].iter().map(|t| t.to_string()).collect();
                    break;
                }
                "string" => {
                    info.string = Some(tokens[i + 1..].join(" "));
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        info
    }

    /// multipv 指定なし、または multipv=1 の行か
    pub fn is_primary(&self) -> bool {
        self.multipv.is_none_or(|n| n == 1)
    }
}

/// エンジン出力1行の解釈
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineLine {
    UciOk,
    ReadyOk,
    /// `id name ...` / `id author ...`
    Id(String),
    /// ハンドシェイク中に広告されるオプション名
    Option { name: String },
    Info(InfoLine),
    /// 探索完了。`bestmove (none)` は `best_move: None`。
    BestMove { best_move: Option<String>, ponder: Option<String> },
    Other(String),
}

impl EngineLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("uciok") => EngineLine::UciOk,
            Some("readyok") => EngineLine::ReadyOk,
            Some("id") => EngineLine::Id(tokens[1..].join(" ")),
            Some("option") => match parse_option_name(&tokens[1..]) {
                Some(name) => EngineLine::Option { name },
                None => EngineLine::Other(line.to_string()),
            },
            Some("info") => EngineLine::Info(InfoLine::parse(&tokens[1..])),
            Some("bestmove") => {
                let best_move = tokens
                    .get(1)
                    .filter(|mv| **mv != "(none)" && **mv != "0000")
                    .map(|mv| mv.to_string());
                let ponder = match tokens.get(2) {
                    Some(&"ponder") => tokens.get(3).map(|mv| mv.to_string()),
                    _ => None,
                };
                EngineLine::BestMove { best_move, ponder }
            }
            _ => EngineLine::Other(line.to_string()),
        }
    }
}

/// `option name <名前...> type ...` から名前部分を取り出す（名前は空白を含みうる）。
pub fn parse_option_name(tokens: &[&str]) -> Option<String> {
    let start = tokens.iter().position(|t| *t == "name")? + 1;
    let parts: Vec<&str> = tokens[start..].iter().copied().take_while(|t| *t != "type").collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// 探索1回分の途中結果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialResult {
    pub score: Option<i32>,
    pub best_move_candidate: Option<String>,
}

impl PartialResult {
    /// info 行を畳み込む。multipv=1 以外は無視する。
    pub fn apply(&mut self, info: &InfoLine) {
        if !info.is_primary() {
            return;
        }
        if let Some(score) = info.score {
            self.score = Some(score.to_centipawns());
        }
        if let Some(first) = info.pv.first() {
            self.best_move_candidate = Some(first.clone());
        }
    }

    /// `bestmove` で確定させる。スコア未観測なら 0 とする。
    pub fn finish(self, best_move: Option<String>) -> EvaluationResult {
        let score = match self.score {
            Some(score) => score,
            None => {
                log::debug!("incomplete result: bestmove without any score, using 0");
                0
            }
        };
        EvaluationResult {
            score,
            best_move: best_move.or(self.best_move_candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(line: &str) -> InfoLine {
        match EngineLine::parse(line) {
            EngineLine::Info(info) => info,
            other => panic!("expected info line, got {other:?}"),
        }
    }

    #[test]
    fn search_commands_encode_stop_position_go() {
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";
        let lines: Vec<String> = search_commands(fen, 15).iter().map(|c| c.to_string()).collect();
        assert_eq!(lines, vec!["stop".to_string(), format!("position fen {fen}"), "go depth 15".to_string()]);
        assert_eq!(search_commands(fen, 0)[2], EngineCommand::Go { depth: 1 });
    }

    #[test]
    fn setoption_is_rendered_with_value() {
        let cmd = EngineCommand::SetOption { name: "Skill Level".into(), value: "5".into() };
        assert_eq!(cmd.to_string(), "setoption name Skill Level value 5");
    }

    #[test]
    fn info_line_parses_primary_pv() {
        let parsed = info("info depth 10 seldepth 12 multipv 1 score cp 34 nodes 12345 nps 890 pv e2e4 e7e5");
        assert_eq!(parsed.depth, Some(10));
        assert_eq!(parsed.score, Some(Score::Cp(34)));
        assert_eq!(parsed.pv, vec!["e2e4".to_string(), "e7e5".to_string()]);
        assert!(parsed.is_primary());

        let secondary = info("info depth 20 multipv 2 score cp 100 pv d2d4");
        assert!(!secondary.is_primary());
    }

    #[test]
    fn info_string_is_not_parsed_for_scores() {
        let parsed = info("info string NNUE evaluation score cp 999 pv a2a3");
        assert_eq!(parsed.score, None);
        assert!(parsed.pv.is_empty());
        assert_eq!(parsed.string.as_deref(), Some("NNUE evaluation score cp 999 pv a2a3"));
    }

    #[test]
    fn mate_scores_map_to_signed_sentinel() {
        assert_eq!(info("info depth 5 score mate 3 pv f7f8q").score.map(Score::to_centipawns), Some(MATE_SCORE));
        assert_eq!(info("info depth 5 score mate -2").score.map(Score::to_centipawns), Some(-MATE_SCORE));
        assert_eq!(Score::Mate(0).to_centipawns(), -MATE_SCORE);
    }

    #[test]
    fn bestmove_lines() {
        assert_eq!(
            EngineLine::parse("bestmove e2e4 ponder e7e5"),
            EngineLine::BestMove { best_move: Some("e2e4".into()), ponder: Some("e7e5".into()) }
        );
        assert_eq!(
            EngineLine::parse("bestmove (none)"),
            EngineLine::BestMove { best_move: None, ponder: None }
        );
        assert_eq!(EngineLine::parse("uciok"), EngineLine::UciOk);
        assert_eq!(EngineLine::parse("readyok\r"), EngineLine::ReadyOk);
    }

    #[test]
    fn option_names_may_contain_spaces() {
        assert_eq!(
            EngineLine::parse("option name Skill Level type spin default 20 min 0 max 20"),
            EngineLine::Option { name: "Skill Level".into() }
        );
        assert_eq!(parse_option_name(&["type", "check"]), None);
    }

    #[test]
    fn partial_result_keeps_latest_score_and_candidate() {
        let mut partial = PartialResult::default();
        partial.apply(&info("info depth 1 score cp 12 pv d2d4"));
        partial.apply(&info("info depth 2 score cp 34 pv e2e4 e7e5"));
        partial.apply(&info("info depth 2 multipv 2 score cp -50 pv a2a3"));
        partial.apply(&info("info depth 3 currmove g1f3 currmovenumber 2"));
        assert_eq!(partial.score, Some(34));
        assert_eq!(partial.best_move_candidate.as_deref(), Some("e2e4"));

        let result = partial.finish(Some("e2e4".into()));
        assert_eq!(result, EvaluationResult { score: 34, best_move: Some("e2e4".into()) });
    }

    #[test]
    fn finish_without_score_is_neutral() {
        let result = PartialResult::default().finish(Some("g1f3".into()));
        assert_eq!(result, EvaluationResult { score: 0, best_move: Some("g1f3".into()) });

        let mut partial = PartialResult::default();
        partial.apply(&info("info depth 1 pv c2c4"));
        assert_eq!(partial.finish(None).best_move.as_deref(), Some("c2c4"));
    }

    #[test]
    fn fen_validation() {
        let start = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
        assert_eq!(validate_fen(&format!("  {start}\t")), Ok(start));
        assert!(matches!(validate_fen(""), Err(EngineError::InvalidPosition(_))));
        assert!(matches!(validate_fen("8/8/8 w - - 0 1"), Err(EngineError::InvalidPosition(_))));
        assert!(matches!(
            validate_fen("8/8/8/8/8/8/8/8 w - - 0 1\ngo infinite"),
            Err(EngineError::InvalidPosition(_))
        ));
    }
}
