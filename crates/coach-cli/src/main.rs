//! `coach-eval`: 標準入力の FEN を1行ずつ評価セッションへ流し、結果を JSON 行で出す。
//!
//! ```shell
//! printf '%s\n' \
//!   'rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1' \
//!   'rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1' \
//!   status \
//!   | cargo run -p coach-cli --bin coach-eval -- --engine stockfish --depth 12 --option Threads=2
//! ```
//!
//! FEN 行は受け取った時点で並行に評価を始めるので、続けて流した行は前の行を追い越す
//! （前の行は `superseded` のエラー行になる）。

mod report;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use coach_engine::{CoachConfig, EngineSession, ProcessLauncher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

use report::{EvaluationLine, StatusLine};

#[derive(Parser, Debug)]
#[command(name = "coach-eval", version, about = "evaluate FEN positions from stdin with a UCI engine")]
struct Cli {
    /// TOML config file ([engine] / [session] sections)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engine binary path (overrides [engine].path)
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Extra argument passed to the engine (repeatable)
    #[arg(long = "engine-arg", num_args = 1, allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Default search depth
    #[arg(long)]
    depth: Option<u32>,

    /// Per-evaluation timeout in milliseconds
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Periodic engine restart interval in seconds (0 disables)
    #[arg(long = "restart-interval-secs")]
    restart_interval_secs: Option<u64>,

    /// UCI option as Name=Value (repeatable)
    #[arg(long = "option", num_args = 1)]
    options: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// 設定ファイルを読み、コマンドラインの指定で上書きする。
    fn resolve_config(&self) -> Result<CoachConfig> {
        let mut config = match &self.config {
            Some(path) => CoachConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => CoachConfig::default(),
        };
        if let Some(engine) = &self.engine {
            config.engine.path = engine.clone();
        }
        if !self.engine_args.is_empty() {
            config.engine.args = self.engine_args.clone();
        }
        if let Some(depth) = self.depth {
            config.session.default_depth = depth;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.session.eval_timeout_ms = timeout_ms;
        }
        if let Some(secs) = self.restart_interval_secs {
            config.session.restart_interval_secs = secs;
        }
        for option in &self.options {
            config.session.push_option(option)?;
        }
        config.session.validate()?;
        Ok(config)
    }
}

/// 標準入力1行の解釈
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Skip,
    Stop,
    Restart,
    Status,
    Position(&'a str),
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        match line {
            "" => Input::Skip,
            _ if line.starts_with('#') => Input::Skip,
            "stop" => Input::Stop,
            "restart" => Input::Restart,
            "status" => Input::Status,
            fen => Input::Position(fen),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    use std::io::Write;
    let log_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    )
    .format(|buf, record| writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args()))
    .write_style(env_logger::WriteStyle::Never)
    .target(env_logger::Target::Stderr)
    .init();

    if let Err(e) = run(cli) {
        log::error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(cli: Cli) -> Result<()> {
    let config = cli.resolve_config()?;
    log::info!(
        "engine {} (depth {}, timeout {:?}, restart {:?})",
        config.engine.path.display(),
        config.session.default_depth,
        config.session.eval_timeout(),
        config.session.restart_interval()
    );

    let session = EngineSession::spawn(ProcessLauncher::new(config.engine), config.session);
    session.initialize().await.context("failed to initialize engine")?;

    let mut host = Host::new(session);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        host.handle(&line).await?;
    }
    host.finish().await;
    Ok(())
}

/// 入力行をセッションへの操作に変換し、評価ごとに結果待ちのタスクを持つ。
struct Host {
    session: EngineSession,
    evaluations: JoinSet<io::Result<()>>,
    next_id: u64,
}

impl Host {
    fn new(session: EngineSession) -> Self {
        Self { session, evaluations: JoinSet::new(), next_id: 0 }
    }

    async fn handle(&mut self, line: &str) -> io::Result<()> {
        while let Some(joined) = self.evaluations.try_join_next() {
            log_join(joined);
        }
        match Input::parse(line) {
            Input::Skip => {}
            Input::Stop => self.session.stop(),
            Input::Restart => {
                if let Err(e) = self.session.restart().await {
                    log::warn!("restart failed: {e}");
                }
            }
            Input::Status => {
                let status = self.session.refresh_status().await;
                report::emit(&StatusLine { status })?;
            }
            Input::Position(fen) => {
                self.next_id += 1;
                let id = self.next_id;
                let fen = fen.to_string();
                // 要求はここで送る。後続の制御行より先にドライバへ届く。
                let pending = self.session.evaluate(&fen, None);
                self.evaluations.spawn(async move {
                    let result = pending.await;
                    report::emit(&EvaluationLine::new(id, &fen, result))
                });
            }
        }
        Ok(())
    }

    /// 残りの評価を待ってからセッションを破棄する。
    async fn finish(mut self) {
        log::debug!("stdin closed, waiting for {} evaluation(s)", self.evaluations.len());
        while let Some(joined) = self.evaluations.join_next().await {
            log_join(joined);
        }
        self.session.destroy().await;
    }
}

fn log_join(joined: Result<io::Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("failed to write result: {e}"),
        Err(e) => log::warn!("evaluation task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_engine::{EngineStub, MemoryLauncher, SessionConfig};

    #[test]
    fn parses_repeatable_flags() {
        let cli = Cli::try_parse_from([
            "coach-eval",
            "--engine",
            "/opt/stockfish",
            "--engine-arg",
            "--uci",
            "--engine-arg",
            "bench-off",
            "--depth",
            "12",
            "--timeout-ms",
            "5000",
            "--restart-interval-secs",
            "0",
            "--option",
            "Threads=2",
            "--option",
            "Skill Level=10",
        ])
        .unwrap();
        assert_eq!(cli.engine_args, vec!["--uci", "bench-off"]);
        assert_eq!(cli.options, vec!["Threads=2", "Skill Level=10"]);

        let config = cli.resolve_config().unwrap();
        assert_eq!(config.engine.path, PathBuf::from("/opt/stockfish"));
        assert_eq!(config.session.default_depth, 12);
        assert_eq!(config.session.eval_timeout_ms, 5000);
        assert_eq!(config.session.restart_interval(), None);
        let options: Vec<(&str, String)> = config.session.option_pairs().collect();
        assert_eq!(options, vec![("Skill Level", "10".to_string()), ("Threads", "2".to_string())]);
    }

    #[test]
    fn defaults_without_flags() {
        let cli = Cli::try_parse_from(["coach-eval"]).unwrap();
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.engine.path, PathBuf::from("stockfish"));
        assert!(config.session.options.is_empty());
    }

    #[test]
    fn rejects_bad_overrides() {
        let cli = Cli::try_parse_from(["coach-eval", "--depth", "0"]).unwrap();
        assert!(cli.resolve_config().is_err());
        let cli = Cli::try_parse_from(["coach-eval", "--option", "Threads"]).unwrap();
        assert!(cli.resolve_config().is_err());
        assert!(Cli::try_parse_from(["coach-eval", "--depth", "deep"]).is_err());
    }

    #[test]
    fn input_lines() {
        assert_eq!(Input::parse("   "), Input::Skip);
        assert_eq!(Input::parse("# opening"), Input::Skip);
        assert_eq!(Input::parse("stop"), Input::Stop);
        assert_eq!(Input::parse(" restart "), Input::Restart);
        assert_eq!(Input::parse("status"), Input::Status);
        assert_eq!(
            Input::parse("8/8/8/8/8/8/8/K6k w - - 0 1\r"),
            Input::Position("8/8/8/8/8/8/8/K6k w - - 0 1")
        );
    }

    const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    async fn ready_host() -> (Host, EngineStub) {
        let (launcher, mut stubs) = MemoryLauncher::channel();
        let config = SessionConfig { restart_interval_secs: 0, ..SessionConfig::default() };
        let session = EngineSession::spawn(launcher, config);
        let engine = async {
            let mut stub = stubs.recv().await.unwrap();
            assert_eq!(stub.next_command().await.as_deref(), Some("uci"));
            stub.emit("uciok");
            stub
        };
        let (init, stub) = tokio::join!(session.initialize(), engine);
        init.unwrap();
        (Host::new(session), stub)
    }

    #[tokio::test]
    async fn stop_line_applies_to_earlier_position_lines() {
        let (mut host, mut stub) = ready_host().await;
        host.handle(START_FEN).await.unwrap();
        host.handle("stop").await.unwrap();

        assert_eq!(stub.next_command().await.as_deref(), Some("stop"));
        assert_eq!(stub.next_command().await, Some(format!("position fen {START_FEN}")));
        assert_eq!(stub.next_command().await.as_deref(), Some("go depth 15"));
        assert_eq!(stub.next_command().await.as_deref(), Some("stop"));
        assert_eq!(host.session.refresh_status().await.pending_count, 0);

        stub.emit("info depth 15 score cp 34 pv e2e4");
        stub.emit("bestmove e2e4");
        host.finish().await;
        assert!(stub.is_terminated());
    }

    #[tokio::test]
    async fn status_counts_position_lines_already_read() {
        let (mut host, _stub) = ready_host().await;
        host.handle(START_FEN).await.unwrap();
        assert_eq!(host.session.refresh_status().await.pending_count, 1);
        host.handle("# comment").await.unwrap();
        host.handle("stop").await.unwrap();
        host.finish().await;
    }
}
