use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;

use super::{EngineLauncher, EngineTransport, LineSink};
use crate::error::{EngineError, EngineResult};
use crate::protocol::EngineCommand;

/// プロセスを持たないインメモリのワーカー。
///
/// 起動のたびに [`EngineStub`] を受信側へ渡す。スタブを持つ側がエンジンの役を演じ、
/// `next_command` で受け取ったコマンドに `emit` で応答する。テストのほか、
/// エンジンを別の実行環境（ブラウザの worker 等）で動かすホストの橋渡しに使う。
#[derive(Clone, Debug)]
pub struct MemoryLauncher {
    stubs: mpsc::UnboundedSender<EngineStub>,
    failures: Arc<AtomicUsize>,
}

impl MemoryLauncher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineStub>) {
        let (stubs, rx) = mpsc::unbounded_channel();
        (Self { stubs, failures: Arc::new(AtomicUsize::new(0)) }, rx)
    }

    /// 次の `count` 回の起動を失敗させる。
    pub fn fail_next_launches(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl EngineLauncher for MemoryLauncher {
    type Transport = MemoryTransport;

    fn launch(&self, sink: LineSink) -> EngineResult<MemoryTransport> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(EngineError::Initialization("engine launch refused".to_string()));
        }
        let (commands, rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let stub = EngineStub { commands: rx, sink, terminated: Arc::clone(&terminated) };
        self.stubs
            .send(stub)
            .map_err(|_| EngineError::Initialization("no engine stub receiver".to_string()))?;
        Ok(MemoryTransport { commands: Some(commands), terminated })
    }
}

pub struct MemoryTransport {
    commands: Option<mpsc::UnboundedSender<String>>,
    terminated: Arc<AtomicBool>,
}

impl EngineTransport for MemoryTransport {
    fn send(&mut self, command: &EngineCommand) -> EngineResult<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| EngineError::EngineChannel("terminated".to_string()))?;
        commands
            .send(command.to_string())
            .map_err(|_| EngineError::EngineChannel("engine stub dropped".to_string()))
    }

    fn terminate(&mut self) -> impl Future<Output = ()> + Send {
        self.terminated.store(true, Ordering::SeqCst);
        self.commands = None;
        std::future::ready(())
    }
}

/// インメモリワーカーのエンジン側
#[derive(Debug)]
pub struct EngineStub {
    commands: mpsc::UnboundedReceiver<String>,
    sink: LineSink,
    terminated: Arc<AtomicBool>,
}

impl EngineStub {
    /// このスタブが起動されたワーカー世代
    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// 次のコマンド行。ワーカーが破棄されると `None`。
    pub async fn next_command(&mut self) -> Option<String> {
        self.commands.recv().await
    }

    pub fn try_next_command(&mut self) -> Option<String> {
        self.commands.try_recv().ok()
    }

    /// エンジン出力を1行流す。
    pub fn emit(&self, line: impl Into<String>) -> bool {
        self.sink.line(line)
    }

    /// エンジン側の異常終了を模す。
    pub fn crash(&self, reason: impl Into<String>) {
        self.sink.closed(reason)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
