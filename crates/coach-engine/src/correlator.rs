//! Request correlator
//!
//! UCI エンジンは一度に1つの探索しか持たず、出力にも呼び出し側の要求 ID を含まない。
//! 一方 UI は局面が変わるたびに評価要求を出すので、要求は短時間に積み重なる。
//! ここでは「多数の要求 / 1本の探索」を安全に扱うための対応付けを行う。
//!
//! - `go` 1回につき `bestmove` がちょうど1回返るので、探索は送信順（FIFO）に完了する。
//! - 先頭の探索について最初の出力行を観測した時点で、その探索と要求を対応付ける。
//! - 出力を1行も観測していない要求は、新しい要求の投入で `Superseded` として破棄する。
//!   探索自体は FIFO に孤児として残し、後から届く `bestmove` を黙って消費する。
//!
//! 要求の状態は `Queued`（未観測）→ `Active`（対応付け済み）→ 解決 / 拒否。
//! I/O は持たない。エンジンへのコマンド送信はセッションドライバが行う。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::protocol::{EngineLine, PartialResult};
use crate::types::{EvaluationRequest, EvaluationResult, RequestId, SearchId};

/// 評価結果の返送口
pub type Responder = oneshot::Sender<EngineResult<EvaluationResult>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// 探索は送信済みだが、エンジン出力をまだ観測していない
    Queued,
    /// 探索の出力を観測し、探索と対応付いた
    Active,
}

struct PendingEvaluation {
    request: EvaluationRequest,
    responder: Responder,
    deadline: Instant,
    state: RequestState,
    partial: PartialResult,
}

/// `go` 1回分
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchSession {
    pub search_id: SearchId,
    pub worker_generation: u64,
    /// 探索を起こした要求。拒否済みなら `None`（孤児）。
    pub request: Option<RequestId>,
    /// 出力を1行以上観測したか
    pub observed: bool,
}

/// 出力1行を処理した結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// info 行を要求の途中結果へ反映した
    Attributed(RequestId),
    /// 要求を解決した
    Resolved(RequestId),
    /// 孤児の探索、または探索外の出力なので捨てた
    Discarded,
    /// 別世代のワーカーからの行
    StaleGeneration,
    /// 評価に関係しない行
    Ignored,
}

/// タイムアウト処理の結果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expired {
    pub requests: Vec<RequestId>,
    /// 期限切れの要求が最後に送った探索（= エンジンで実行中の探索）を持っていた
    pub running_search_abandoned: bool,
}

pub struct Correlator {
    worker_generation: u64,
    next_request_id: u64,
    next_search_id: u64,
    eval_timeout: Duration,
    pending: BTreeMap<RequestId, PendingEvaluation>,
    searches: VecDeque<SearchSession>,
    generation_map: HashMap<SearchId, RequestId>,
}

impl Correlator {
    pub fn new(worker_generation: u64, eval_timeout: Duration) -> Self {
        Self {
            worker_generation,
            next_request_id: 1,
            next_search_id: 1,
            eval_timeout,
            pending: BTreeMap::new(),
            searches: VecDeque::new(),
            generation_map: HashMap::new(),
        }
    }

    pub fn worker_generation(&self) -> u64 {
        self.worker_generation
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 送信済みで `bestmove` 未着の探索数（孤児を含む）
    pub fn searches_in_flight(&self) -> usize {
        self.searches.len()
    }

    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.pending.get(&id).map(|p| p.state)
    }

    pub fn request(&self, id: RequestId) -> Option<&EvaluationRequest> {
        self.pending.get(&id).map(|p| &p.request)
    }

    /// 最も近い期限
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// 新しい要求を登録し、その探索を FIFO に積む。
    ///
    /// 呼び出し側は続けて [`search_commands`] をエンジンへ送る。
    /// 出力未観測の要求はここで `Superseded` になる。
    ///
    /// [`search_commands`]: crate::protocol::search_commands
    pub fn submit(
        &mut self,
        fen: String,
        depth: u32,
        responder: Responder,
        now: Instant,
    ) -> (RequestId, SearchId) {
        self.supersede_unobserved();

        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        let search_id = SearchId(self.next_search_id);
        self.next_search_id += 1;

        self.searches.push_back(SearchSession {
            search_id,
            worker_generation: self.worker_generation,
            request: Some(id),
            observed: false,
        });
        let request = EvaluationRequest { id, fen, depth: depth.max(1), created_at: now };
        log::debug!(
            "{id} submitted as {search_id} (gen {}, depth {}): {}",
            self.worker_generation,
            request.depth,
            request.fen
        );
        self.pending.insert(
            id,
            PendingEvaluation {
                request,
                responder,
                deadline: now + self.eval_timeout,
                state: RequestState::Queued,
                partial: PartialResult::default(),
            },
        );
        (id, search_id)
    }

    fn supersede_unobserved(&mut self) {
        let mut superseded = Vec::new();
        for search in self.searches.iter_mut().filter(|s| !s.observed) {
            if let Some(id) = search.request.take() {
                superseded.push(id);
            }
        }
        for id in superseded {
            if let Some(p) = self.pending.remove(&id) {
                log::debug!("{id} superseded before any engine output");
                reject(p, EngineError::Superseded);
            }
        }
    }

    /// エンジン出力1行を対応する要求へ振り分ける。
    pub fn on_line(&mut self, worker_generation: u64, line: &EngineLine) -> LineOutcome {
        if worker_generation != self.worker_generation {
            log::debug!(
                "ignoring output from worker gen {worker_generation} (current {})",
                self.worker_generation
            );
            return LineOutcome::StaleGeneration;
        }
        match line {
            EngineLine::Info(info) => {
                let Some(search_id) = self.observe_front() else {
                    log::debug!("info without a search in flight");
                    return LineOutcome::Discarded;
                };
                let Some(&id) = self.generation_map.get(&search_id) else {
                    return LineOutcome::Discarded;
                };
                match self.pending.get_mut(&id) {
                    Some(p) => {
                        p.partial.apply(info);
                        LineOutcome::Attributed(id)
                    }
                    None => LineOutcome::Discarded,
                }
            }
            EngineLine::BestMove { best_move, .. } => {
                let Some(search_id) = self.observe_front() else {
                    log::debug!("bestmove without a search in flight");
                    return LineOutcome::Discarded;
                };
                self.searches.pop_front();
                let Some(id) = self.generation_map.remove(&search_id) else {
                    log::debug!("{search_id} completed without a live request");
                    return LineOutcome::Discarded;
                };
                match self.pending.remove(&id) {
                    Some(p) => {
                        let result = p.partial.finish(best_move.clone());
                        log::debug!(
                            "{id} resolved by {search_id}: score {} bestmove {:?}",
                            result.score,
                            result.best_move
                        );
                        let _ = p.responder.send(Ok(result));
                        LineOutcome::Resolved(id)
                    }
                    None => LineOutcome::Discarded,
                }
            }
            _ => LineOutcome::Ignored,
        }
    }

    /// 先頭の探索を観測済みにし、初観測なら要求との対応付けを確定する。
    fn observe_front(&mut self) -> Option<SearchId> {
        let search = self.searches.front_mut()?;
        if !search.observed {
            search.observed = true;
            if let Some(id) = search.request {
                self.generation_map.insert(search.search_id, id);
                if let Some(p) = self.pending.get_mut(&id) {
                    p.state = RequestState::Active;
                }
                log::debug!("{} mapped to {id}", search.search_id);
            }
        }
        Some(search.search_id)
    }

    /// 期限切れの要求を `Timeout` で拒否し、対応付けを外す。
    pub fn expire(&mut self, now: Instant) -> Expired {
        let due: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut expired = Expired::default();
        let last_search = self.searches.back().map(|s| s.search_id);
        for id in due {
            if let Some(search_id) = self.detach(id) {
                if Some(search_id) == last_search {
                    expired.running_search_abandoned = true;
                }
            }
            if let Some(p) = self.pending.remove(&id) {
                log::debug!("{id} timed out ({:?} state)", p.state);
                reject(p, EngineError::Timeout);
            }
            expired.requests.push(id);
        }
        expired
    }

    /// 要求を探索から切り離す。切り離した探索の ID を返す。
    fn detach(&mut self, id: RequestId) -> Option<SearchId> {
        let search = self.searches.iter_mut().find(|s| s.request == Some(id))?;
        search.request = None;
        self.generation_map.remove(&search.search_id);
        Some(search.search_id)
    }

    /// 単一要求を拒否する（送信失敗時など）。
    pub fn reject(&mut self, id: RequestId, error: EngineError) {
        self.detach(id);
        if let Some(p) = self.pending.remove(&id) {
            reject(p, error);
        }
    }

    /// 全要求を拒否し、探索をすべて孤児にする。以後の旧探索の出力は捨てられる。
    pub fn reject_all(&mut self, error: EngineError) -> usize {
        for search in self.searches.iter_mut() {
            search.request = None;
        }
        self.generation_map.clear();
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for (_, p) in pending {
            reject(p, error.clone());
        }
        count
    }

    /// 新しいワーカー世代で状態を作り直す。ID の採番も 1 から。
    pub fn reset(&mut self, worker_generation: u64, error: EngineError) {
        self.reject_all(error);
        self.searches.clear();
        self.next_request_id = 1;
        self.next_search_id = 1;
        self.worker_generation = worker_generation;
    }
}

fn reject(p: PendingEvaluation, error: EngineError) {
    let _ = p.responder.send(Err(error));
}
