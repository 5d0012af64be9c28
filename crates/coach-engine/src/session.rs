//! Session lifecycle controller
//!
//! [`EngineSession`] は clone 可能なハンドルで、実体はランタイム上の1タスク
//! （`SessionDriver`）が持つ。要求の対応付け状態・ワーカー・ハンドシェイク状態は
//! すべてこのタスクだけが触るのでロックは要らない。呼び出し側が待つのは
//! `initialize` / `evaluate` / `destroy` / `restart` の完了だけ。

use std::collections::HashSet;
use std::future::{self, Future};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::config::SessionConfig;
use crate::correlator::{Correlator, LineOutcome, Responder};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{EngineCommand, EngineLine, search_commands, validate_fen};
use crate::transport::{EngineLauncher, EngineTransport, LineSink, WorkerEvent};
use crate::types::{EvaluationResult, SessionStatus};

type InitReply = oneshot::Sender<EngineResult<()>>;

enum SessionCommand {
    Initialize(InitReply),
    Evaluate { fen: String, depth: Option<u32>, reply: Responder },
    Stop,
    Destroy(oneshot::Sender<()>),
    Restart(InitReply),
    Status(oneshot::Sender<SessionStatus>),
}

/// 評価セッションへのハンドル。
///
/// 全ハンドルが drop されるとドライバは `destroy` 相当の後始末をして終了する。
#[derive(Clone)]
pub struct EngineSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl EngineSession {
    /// ドライバタスクを起動する。tokio ランタイム上で呼ぶこと。
    /// ワーカーは `initialize` まで起動しない。
    pub fn spawn<L: EngineLauncher>(launcher: L, config: SessionConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let driver = SessionDriver::new(launcher, config, command_rx, status_tx);
        tokio::spawn(driver.run());
        Self { commands, status }
    }

    /// ワーカーを起動し、`uciok` を受け取るまで待つ。準備済みなら即座に返る。
    pub async fn initialize(&self) -> EngineResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Initialize(tx))?;
        rx.await.map_err(|_| driver_gone())?
    }

    /// 局面を評価する。`depth` 省略時は設定の既定深さ。
    ///
    /// 要求は呼び出した時点でドライバへ送られ、返る future は結果を待つだけ。
    /// 後から呼んだ `stop` / `restart` より必ず先に処理される。
    /// future を drop しても要求は取り消されず、結果が捨てられる。
    ///
    /// 後続の要求に追い越された場合は `Superseded`、`stop` / `destroy` で
    /// 打ち切られた場合は `Stopped`、期限切れは `Timeout` で終わる。
    pub fn evaluate(
        &self,
        fen: &str,
        depth: Option<u32>,
    ) -> impl Future<Output = EngineResult<EvaluationResult>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        let sent = self.send(SessionCommand::Evaluate { fen: fen.to_string(), depth, reply: tx });
        async move {
            sent?;
            rx.await.map_err(|_| driver_gone())?
        }
    }

    /// 保留中の評価をすべて `Stopped` にし、エンジンの探索を止める。
    pub fn stop(&self) {
        let _ = self.commands.send(SessionCommand::Stop);
    }

    /// 保留中の評価を止め、ワーカーを終了させる。ワーカーが消えてから返る。
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Destroy(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// `destroy` の後に `initialize`。
    pub async fn restart(&self) -> EngineResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Restart(tx))?;
        rx.await.map_err(|_| driver_gone())?
    }

    /// ドライバが直近に公開した状態。ドライバが処理し終えたコマンドまでしか
    /// 反映しないので、送った直後の `evaluate` は `pending_count` に入っていないことがある。
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// それまでに送ったコマンドをドライバが処理した後の状態。
    pub async fn refresh_status(&self) -> SessionStatus {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Status(tx)).is_err() {
            return self.status();
        }
        rx.await.unwrap_or_else(|_| self.status())
    }

    fn send(&self, command: SessionCommand) -> EngineResult<()> {
        self.commands.send(command).map_err(|_| driver_gone())
    }
}

fn driver_gone() -> EngineError {
    EngineError::EngineChannel("session driver stopped".to_string())
}

fn init_error(e: EngineError) -> EngineError {
    match e {
        EngineError::Initialization(_) => e,
        other => EngineError::Initialization(other.to_string()),
    }
}

enum Phase {
    Idle,
    Handshaking {
        deadline: Instant,
        waiters: Vec<InitReply>,
        /// `option name ...` で広告されたオプション名
        advertised: HashSet<String>,
    },
    Ready,
}

struct Worker<T> {
    transport: T,
    generation: u64,
}

struct SessionDriver<L: EngineLauncher> {
    launcher: L,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    status: watch::Sender<SessionStatus>,
    worker: Option<Worker<L::Transport>>,
    phase: Phase,
    correlator: Correlator,
    /// 起動のたびに増える。destroy でも戻さない（旧ワーカーの遅延行と区別するため）。
    worker_generation: u64,
    /// 呼び出し側が initialize 済みで、destroy していない
    keep_alive: bool,
}

impl<L: EngineLauncher> SessionDriver<L> {
    fn new(
        launcher: L,
        config: SessionConfig,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let correlator = Correlator::new(0, config.eval_timeout());
        Self {
            launcher,
            config,
            commands,
            events_tx,
            events,
            status,
            worker: None,
            phase: Phase::Idle,
            correlator,
            worker_generation: 0,
            keep_alive: false,
        }
    }

    async fn run(mut self) {
        let mut restart_timer = self.config.restart_interval().map(|period| {
            let mut timer = time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = sleep_until(deadline) => self.handle_deadline().await,
                _ = next_tick(&mut restart_timer) => self.scheduled_restart().await,
            }
            self.publish_status();
        }
        log::debug!("all session handles dropped, shutting down");
        self.keep_alive = false;
        self.destroy().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Initialize(reply) => {
                self.keep_alive = true;
                self.begin_initialize(Some(reply)).await;
            }
            SessionCommand::Evaluate { fen, depth, reply } => self.evaluate(fen, depth, reply).await,
            SessionCommand::Stop => self.stop().await,
            SessionCommand::Destroy(reply) => {
                self.keep_alive = false;
                self.destroy().await;
                self.publish_status();
                let _ = reply.send(());
            }
            SessionCommand::Restart(reply) => {
                self.keep_alive = true;
                self.destroy().await;
                self.begin_initialize(Some(reply)).await;
            }
            SessionCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn begin_initialize(&mut self, reply: Option<InitReply>) {
        match &mut self.phase {
            Phase::Ready => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
            Phase::Handshaking { waiters, .. } => {
                waiters.extend(reply);
                return;
            }
            Phase::Idle => {}
        }

        self.worker_generation += 1;
        let generation = self.worker_generation;
        self.correlator.reset(generation, EngineError::Stopped);
        let sink = LineSink::new(generation, self.events_tx.clone());
        let transport = match self.launcher.launch(sink) {
            Ok(transport) => transport,
            Err(e) => {
                log::warn!("engine launch failed (gen {generation}): {e}");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(init_error(e)));
                }
                return;
            }
        };
        self.worker = Some(Worker { transport, generation });
        self.phase = Phase::Handshaking {
            deadline: Instant::now() + self.config.init_timeout(),
            waiters: reply.into_iter().collect(),
            advertised: HashSet::new(),
        };
        log::info!("engine worker gen {generation} launched, waiting for uciok");
        if let Err(e) = self.send_command(&EngineCommand::Uci) {
            self.fail_initialization(e.to_string()).await;
        }
    }

    async fn evaluate(&mut self, fen: String, depth: Option<u32>, reply: Responder) {
        if !matches!(self.phase, Phase::Ready) {
            let _ = reply.send(Err(EngineError::NotInitialized));
            return;
        }
        let fen = match validate_fen(&fen) {
            Ok(fen) => fen.to_string(),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let depth = depth.unwrap_or(self.config.default_depth).max(1);
        let (id, search_id) = self.correlator.submit(fen.clone(), depth, reply, Instant::now());
        for command in search_commands(&fen, depth) {
            if let Err(e) = self.send_command(&command) {
                log::warn!("{id}: failed to start {search_id}: {e}");
                self.on_worker_lost(e.to_string()).await;
                return;
            }
        }
    }

    async fn stop(&mut self) {
        let rejected = self.correlator.reject_all(EngineError::Stopped);
        log::debug!("stop: {rejected} pending evaluation(s) rejected");
        if matches!(self.phase, Phase::Ready) {
            if let Err(e) = self.send_command(&EngineCommand::Stop) {
                self.on_worker_lost(e.to_string()).await;
            }
        }
    }

    async fn destroy(&mut self) {
        if let Phase::Handshaking { waiters, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            for waiter in waiters {
                let _ = waiter.send(Err(EngineError::Stopped));
            }
        }
        let rejected = self.correlator.reject_all(EngineError::Stopped);
        if rejected > 0 {
            log::debug!("destroy: {rejected} pending evaluation(s) rejected");
        }
        self.shutdown_worker().await;
        self.correlator.reset(self.worker_generation, EngineError::Stopped);
    }

    async fn scheduled_restart(&mut self) {
        if !self.keep_alive || matches!(self.phase, Phase::Handshaking { .. }) {
            return;
        }
        log::info!("scheduled engine restart (current gen {})", self.worker_generation);
        self.destroy().await;
        self.begin_initialize(None).await;
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Line { generation, line } => {
                if !self.is_current(generation) {
                    log::debug!("dropping line from retired worker gen {generation}: {line}");
                    return;
                }
                log::trace!("gen {generation} => {line}");
                let parsed = EngineLine::parse(&line);
                if matches!(self.phase, Phase::Handshaking { .. }) {
                    self.on_handshake_line(parsed).await;
                    return;
                }
                match self.correlator.on_line(generation, &parsed) {
                    LineOutcome::Resolved(id) => log::debug!("{id} resolved"),
                    LineOutcome::Discarded => log::trace!("discarded: {line}"),
                    _ => {}
                }
            }
            WorkerEvent::Closed { generation, reason } => {
                if self.is_current(generation) {
                    self.on_worker_lost(reason).await;
                } else {
                    log::debug!("retired worker gen {generation} closed: {reason}");
                }
            }
        }
    }

    async fn on_handshake_line(&mut self, line: EngineLine) {
        match line {
            EngineLine::Option { name } => {
                if let Phase::Handshaking { advertised, .. } = &mut self.phase {
                    advertised.insert(name);
                }
            }
            EngineLine::Id(id) => log::info!("engine {id}"),
            EngineLine::UciOk => self.complete_handshake().await,
            _ => {}
        }
    }

    async fn complete_handshake(&mut self) {
        let commands = match &self.phase {
            Phase::Handshaking { advertised, .. } => self.option_commands(advertised),
            _ => return,
        };
        for command in &commands {
            if let Err(e) = self.send_command(command) {
                self.fail_initialization(e.to_string()).await;
                return;
            }
        }
        let Phase::Handshaking { waiters, .. } = std::mem::replace(&mut self.phase, Phase::Ready)
        else {
            return;
        };
        log::info!("engine worker gen {} ready", self.worker_generation);
        self.publish_status();
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// 設定のオプションのうち、エンジンが広告したものだけを送る。
    /// 何も広告しないエンジンには全部送る。
    fn option_commands(&self, advertised: &HashSet<String>) -> Vec<EngineCommand> {
        let mut commands = Vec::new();
        for (name, value) in self.config.option_pairs() {
            if advertised.is_empty() || advertised.contains(name) {
                commands.push(EngineCommand::SetOption { name: name.to_string(), value });
            } else {
                log::warn!("engine does not advertise option '{name}', skipping");
            }
        }
        commands
    }

    async fn fail_initialization(&mut self, reason: String) {
        log::warn!("engine initialization failed (gen {}): {reason}", self.worker_generation);
        let waiters = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Handshaking { waiters, .. } => waiters,
            _ => Vec::new(),
        };
        self.shutdown_worker().await;
        self.publish_status();
        for waiter in waiters {
            let _ = waiter.send(Err(EngineError::Initialization(reason.clone())));
        }
    }

    async fn on_worker_lost(&mut self, reason: String) {
        if matches!(self.phase, Phase::Handshaking { .. }) {
            self.fail_initialization(reason).await;
            return;
        }
        log::warn!("engine worker gen {} lost: {reason}", self.worker_generation);
        self.phase = Phase::Idle;
        self.correlator.reject_all(EngineError::EngineChannel(reason));
        self.shutdown_worker().await;
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();
        if let Phase::Handshaking { deadline, .. } = &self.phase {
            if *deadline <= now {
                let reason = format!("no uciok within {:?}", self.config.init_timeout());
                self.fail_initialization(reason).await;
            }
        }
        let expired = self.correlator.expire(now);
        if expired.requests.is_empty() {
            return;
        }
        log::warn!("{} evaluation(s) timed out", expired.requests.len());
        if expired.running_search_abandoned && matches!(self.phase, Phase::Ready) {
            if let Err(e) = self.send_command(&EngineCommand::Stop) {
                self.on_worker_lost(e.to_string()).await;
            }
        }
    }

    async fn shutdown_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.transport.terminate().await;
            log::info!("engine worker gen {} terminated", worker.generation);
        }
    }

    fn send_command(&mut self, command: &EngineCommand) -> EngineResult<()> {
        match self.worker.as_mut() {
            Some(worker) => worker.transport.send(command),
            None => Err(EngineError::NotInitialized),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.worker.as_ref().is_some_and(|w| w.generation == generation)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let handshake = match &self.phase {
            Phase::Handshaking { deadline, .. } => Some(*deadline),
            _ => None,
        };
        match (handshake, self.correlator.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            ready: matches!(self.phase, Phase::Ready),
            pending_count: self.correlator.pending_count(),
            worker_generation: self.worker_generation,
        }
    }

    fn publish_status(&self) {
        let status = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending().await,
    }
}
