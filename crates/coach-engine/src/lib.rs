//! 評価セッション管理
//!
//! 局面が変わるたびに飛んでくる評価要求を、1本の UCI エンジンワーカーに対する
//! 探索へ対応付ける。古い要求の結果が新しい要求に紛れ込まないこと、
//! ワーカーの定期再起動や破棄が呼び出し側から透過であることを保証する。
//!
//! 構成（葉から順に）:
//! - [`transport`]: エンジンとの行単位の双方向チャネル
//! - [`protocol`]: コマンドのエンコードと出力行のデコード
//! - [`correlator`]: 要求と探索の対応付けを行う状態機械
//! - [`session`]: ワーカーの生成・再起動・破棄と公開 API

pub mod config;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{CoachConfig, ConfigError, EngineConfig, SessionConfig};
pub use error::{EngineError, EngineResult};
pub use session::EngineSession;
pub use transport::{
    EngineLauncher, EngineStub, EngineTransport, LineSink, MemoryLauncher, ProcessLauncher,
    WorkerEvent,
};
pub use types::{EvaluationRequest, EvaluationResult, RequestId, SearchId, SessionStatus};
