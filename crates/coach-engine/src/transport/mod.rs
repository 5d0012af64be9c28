//! Worker transport
//!
//! エンジンとの行単位の双方向チャネル。業務ロジックは持たない。
//! 受信行は [`LineSink`] 経由でセッションドライバへ渡り、起動時のワーカー世代が
//! 付与される。破棄済みワーカーから遅れて届いた行は世代の不一致で捨てられる。

mod memory;
mod process;

pub use memory::{EngineStub, MemoryLauncher, MemoryTransport};
pub use process::{ProcessLauncher, ProcessTransport};

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::EngineResult;
use crate::protocol::EngineCommand;

/// ワーカーからセッションドライバへ届くイベント
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Line { generation: u64, line: String },
    /// 出力の終端・書き込み失敗・プロセス終了など、チャネルとしての故障
    Closed { generation: u64, reason: String },
}

/// ワーカー1世代分の受信口
#[derive(Clone, Debug)]
pub struct LineSink {
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl LineSink {
    pub(crate) fn new(generation: u64, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { generation, events }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 1行を届ける。セッション側が既に無ければ `false`。
    pub fn line(&self, line: impl Into<String>) -> bool {
        self.events
            .send(WorkerEvent::Line { generation: self.generation, line: line.into() })
            .is_ok()
    }

    /// チャネル故障を報告する。
    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self
            .events
            .send(WorkerEvent::Closed { generation: self.generation, reason: reason.into() });
    }
}

/// 起動済みワーカーへの送信側ハンドル
pub trait EngineTransport: Send + 'static {
    /// コマンドを1行送る。送達できない場合は `EngineChannel`。
    fn send(&mut self, command: &EngineCommand) -> EngineResult<()>;

    /// ワーカーを終了させる。完了時点でワーカーは存在しない。
    fn terminate(&mut self) -> impl Future<Output = ()> + Send;
}

/// ワーカーを1つ起動する。受信行は `sink` へ流す。
pub trait EngineLauncher: Send + Sync + 'static {
    type Transport: EngineTransport;

    fn launch(&self, sink: LineSink) -> EngineResult<Self::Transport>;
}
