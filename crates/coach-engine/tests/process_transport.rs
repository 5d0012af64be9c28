//! Spawns a small shell script that speaks enough UCI to answer one search.

#![cfg(unix)]

use std::time::Duration;

use coach_engine::{
    EngineConfig, EngineError, EngineSession, EvaluationResult, ProcessLauncher, SessionConfig,
};

const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

const SCRIPT_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    uci)
      echo "id name ShellFish"
      echo "option name Hash type spin default 16 min 1 max 1024"
      echo "uciok"
      ;;
    go*)
      echo "info depth 3 multipv 1 score cp 34 nodes 120 pv e2e4 e7e5"
      echo "bestmove e2e4 ponder e7e5"
      ;;
    quit)
      exit 0
      ;;
  esac
done
"#;

fn script_engine() -> EngineConfig {
    EngineConfig {
        path: "sh".into(),
        args: vec!["-c".to_string(), SCRIPT_ENGINE.to_string()],
        label: Some("shellfish".to_string()),
        ..EngineConfig::default()
    }
}

fn session_config() -> SessionConfig {
    let mut config = SessionConfig { restart_interval_secs: 0, ..SessionConfig::default() };
    config.push_option("Hash=32").unwrap();
    config
}

#[tokio::test]
async fn evaluates_through_child_process() {
    let session = EngineSession::spawn(ProcessLauncher::new(script_engine()), session_config());
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        session.initialize().await?;
        session.evaluate(START_FEN, Some(3)).await
    })
    .await
    .expect("script engine should answer");
    assert_eq!(outcome, Ok(EvaluationResult { score: 34, best_move: Some("e2e4".to_string()) }));

    tokio::time::timeout(Duration::from_secs(10), session.destroy())
        .await
        .expect("destroy should finish");
    assert!(!session.status().ready);
}

#[tokio::test]
async fn missing_binary_fails_initialization() {
    let engine = EngineConfig::new("/nonexistent/coach-engine-binary");
    let session = EngineSession::spawn(ProcessLauncher::new(engine), session_config());
    let result = session.initialize().await;
    assert!(matches!(result, Err(EngineError::Initialization(msg)) if msg.contains("failed to spawn")));
}
