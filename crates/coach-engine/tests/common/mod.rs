//! Shared helpers for session integration tests

#![allow(dead_code)]

use coach_engine::{EngineSession, EngineStub, MemoryLauncher, SessionConfig};
use tokio::sync::mpsc::UnboundedReceiver;

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
pub const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";
pub const MATE_IN_THREE: &str = "5rk1/5Ppp/8/8/8/8/6PP/R5K1 w - - 0 1";

/// Session config without the periodic restart so timers don't interfere.
pub fn test_config() -> SessionConfig {
    SessionConfig { restart_interval_secs: 0, ..SessionConfig::default() }
}

pub struct Harness {
    pub session: EngineSession,
    pub launcher: MemoryLauncher,
    pub stubs: UnboundedReceiver<EngineStub>,
}

pub fn spawn_session(config: SessionConfig) -> Harness {
    let (launcher, stubs) = MemoryLauncher::channel();
    let session = EngineSession::spawn(launcher.clone(), config);
    Harness { session, launcher, stubs }
}

/// Plays the engine side of the handshake: expects `uci`, emits `lines`, then `uciok`.
pub async fn accept_with(stubs: &mut UnboundedReceiver<EngineStub>, lines: &[&str]) -> EngineStub {
    let mut stub = stubs.recv().await.expect("engine should be launched");
    assert_eq!(stub.next_command().await.as_deref(), Some("uci"));
    stub.emit("id name Scripted Stub");
    for line in lines {
        stub.emit(*line);
    }
    stub.emit("uciok");
    stub
}

pub async fn accept(stubs: &mut UnboundedReceiver<EngineStub>) -> EngineStub {
    accept_with(stubs, &[]).await
}

/// Initializes the session against a fresh stub.
pub async fn ready(harness: &mut Harness) -> EngineStub {
    let (init, stub) = tokio::join!(harness.session.initialize(), accept(&mut harness.stubs));
    init.expect("initialize should succeed");
    stub
}

/// Asserts the command sequence of one search.
pub async fn expect_search(stub: &mut EngineStub, fen: &str, depth: u32) {
    assert_eq!(stub.next_command().await.as_deref(), Some("stop"));
    assert_eq!(stub.next_command().await, Some(format!("position fen {fen}")));
    assert_eq!(stub.next_command().await, Some(format!("go depth {depth}")));
}

/// Finishes the current search with a centipawn score.
pub fn reply(stub: &EngineStub, cp: i32, best_move: &str) {
    stub.emit(format!("info depth 15 score cp {cp} pv {best_move}"));
    stub.emit(format!("bestmove {best_move}"));
}

/// Lets the driver task drain whatever is already queued.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
