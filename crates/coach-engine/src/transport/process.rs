use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use super::{EngineLauncher, EngineTransport, LineSink};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::protocol::EngineCommand;

/// ネイティブ UCI エンジンを子プロセスとして起動する。
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    config: EngineConfig,
}

impl ProcessLauncher {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineLauncher for ProcessLauncher {
    type Transport = ProcessTransport;

    fn launch(&self, sink: LineSink) -> EngineResult<ProcessTransport> {
        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Initialization(format!(
                    "failed to spawn engine at {}: {e}",
                    cfg.path.display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Initialization("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Initialization("no stdout".to_string()))?;

        let label = format!("{}#{}", cfg.label(), sink.generation());
        log::info!("{label}: engine process started (pid {:?})", child.id());

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let reader = tokio::spawn(read_lines(stdout, sink.clone()));
        let writer = tokio::spawn(write_lines(stdin, rx, sink));
        Ok(ProcessTransport {
            child,
            outbound: Some(tx),
            reader,
            writer,
            quit_timeout: cfg.quit_timeout(),
            label,
        })
    }
}

/// 1本のエンジンプロセスに対する入出力をカプセル化する。
pub struct ProcessTransport {
    child: Child,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    quit_timeout: Duration,
    label: String,
}

impl EngineTransport for ProcessTransport {
    fn send(&mut self, command: &EngineCommand) -> EngineResult<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| EngineError::EngineChannel(format!("{}: terminated", self.label)))?;
        log::debug!("{} <= {command}", self.label);
        outbound
            .send(command.to_string())
            .map_err(|_| EngineError::EngineChannel(format!("{}: writer stopped", self.label)))
    }

    fn terminate(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            // quit を送ってから送信側を閉じると、writer が書き切った後に stdin を閉じる
            if let Some(outbound) = self.outbound.take() {
                let _ = outbound.send(EngineCommand::Quit.to_string());
            }
            match time::timeout(self.quit_timeout, self.child.wait()).await {
                Ok(Ok(status)) => log::info!("{}: engine exited ({status})", self.label),
                Ok(Err(e)) => log::warn!("{}: failed to wait for engine: {e}", self.label),
                Err(_) => {
                    log::warn!(
                        "{}: engine did not quit within {:?}, killing",
                        self.label,
                        self.quit_timeout
                    );
                    if let Err(e) = self.child.kill().await {
                        log::warn!("{}: failed to kill engine: {e}", self.label);
                    }
                }
            }
            self.writer.abort();
            self.reader.abort();
        }
    }
}

async fn read_lines(stdout: ChildStdout, sink: LineSink) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !sink.line(line) {
                    return;
                }
            }
            Ok(None) => {
                sink.closed("engine stdout closed");
                return;
            }
            Err(e) => {
                sink.closed(format!("engine stdout read error: {e}"));
                return;
            }
        }
    }
}

async fn write_lines(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>, sink: LineSink) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_line(&mut stdin, &line).await {
            sink.closed(format!("failed to write to engine: {e}"));
            return;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, msg: &str) -> io::Result<()> {
    stdin.write_all(msg.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}
