//! Raft 节点
//!
//! `Node` 把 `RaftState` 放在一把异步锁后面，并负责所有后台任务：
//! 定时驱动、选举投票的并发发送、每个 follower 的日志复制以及向应用层交付
//! 已提交条目。网络调用和应用层发送都在锁外进行。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::sync::{Mutex, MutexGuard, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, RaftError, report};
use crate::event::Event;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyMsg, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::state::{
    ElectionOutcome, ElectionRound, NodeStatus, RaftState, RaftStateOptions, ReplicationStep,
};
use crate::traits::{ClientResult, Network, RaftResult, Storage};
use crate::types::{Command, ElectionEpoch, LogIndex, NodeId, Term};

struct NodeInner {
    id: NodeId,
    options: RaftStateOptions,
    state: Mutex<RaftState>,
    network: Arc<dyn Network>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    apply_notify: Arc<Notify>,
    killed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// 单个 Raft 节点的句柄，克隆开销很小
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// 创建节点：加载持久化状态并启动定时驱动与应用任务
    pub async fn new(
        options: RaftStateOptions,
        network: Arc<dyn Network>,
        storage: Arc<dyn Storage>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> RaftResult<Node> {
        options.validate()?;

        let apply_notify = Arc::new(Notify::new());
        let state = RaftState::new(options.clone(), storage, apply_notify.clone()).await?;
        let (shutdown_tx, _) = watch::channel(false);

        let node = Node {
            inner: Arc::new(NodeInner {
                id: options.id,
                options,
                state: Mutex::new(state),
                network,
                apply_tx,
                apply_notify,
                killed: AtomicBool::new(false),
                shutdown_tx,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        };

        let timers = tokio::spawn(node.clone().run_timers(node.inner.shutdown_tx.subscribe()));
        let applier = tokio::spawn(node.clone().run_applier(node.inner.shutdown_tx.subscribe()));
        node.inner.tasks.lock().extend([timers, applier]);

        info!(
            "Node {} started with peers {:?}",
            node.inner.id, node.inner.options.peers
        );
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    /// 提交一条命令；只有 Leader 接受，返回 (index, term)，不保证最终提交
    pub async fn start(&self, command: Command) -> ClientResult<(LogIndex, Term)> {
        let (index, term) = {
            let Some(mut state) = self.lock_live().await else {
                return Err(ClientError::Shutdown);
            };
            state.propose(command).await?
        };

        // 不等心跳，立即开始复制
        self.broadcast_append_entries(term);
        Ok((index, term))
    }

    /// (当前任期, 是否认为自己是 Leader)
    pub async fn get_state(&self) -> (Term, bool) {
        let state = self.inner.state.lock().await;
        (state.current_term, state.is_leader())
    }

    pub async fn status(&self) -> NodeStatus {
        self.inner.state.lock().await.status()
    }

    /// 停止节点：后台任务退出后返回，此后不会再写存储或交付条目
    pub async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        // 等待正在执行的临界区结束，之后所有临界区都会看到 killed
        drop(self.inner.state.lock().await);

        let handles = std::mem::take(&mut *self.inner.tasks.lock());
        for result in join_all(handles).await {
            if let Err(err) = result {
                error!("Node {} background task failed: {}", self.inner.id, err);
            }
        }
        info!("Node {} killed", self.inner.id);
    }

    /// 处理来自候选人的 RequestVote
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        let Some(mut state) = self.lock_live().await else {
            return Err(RaftError::Shutdown(self.inner.id));
        };
        state.handle_request_vote(request).await
    }

    /// 处理来自 Leader 的 AppendEntries
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let Some(mut state) = self.lock_live().await else {
            return Err(RaftError::Shutdown(self.inner.id));
        };
        state.handle_append_entries(request).await
    }

    /// 获取状态锁；节点已停止时返回 None
    async fn lock_live(&self) -> Option<MutexGuard<'_, RaftState>> {
        let guard = self.inner.state.lock().await;
        if self.is_killed() { None } else { Some(guard) }
    }

    // === 后台任务 ===

    async fn run_timers(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.inner.options.timer_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let (event, term) = {
                let Some(mut state) = self.lock_live().await else {
                    break;
                };
                (state.poll_timers(Instant::now()), state.current_term)
            };

            match event {
                Some(Event::ElectionTimeout) => self.run_election().await,
                Some(Event::HeartbeatTimeout) => self.broadcast_append_entries(term),
                None => {}
            }
        }
        debug!("Node {} timer driver stopped", self.inner.id);
    }

    async fn run_election(&self) {
        let round = {
            let Some(mut state) = self.lock_live().await else {
                return;
            };
            match state.start_election().await {
                Ok(Some(round)) => round,
                Ok(None) => return,
                Err(err) => {
                    report(self.inner.id, &err, "start_election", None);
                    return;
                }
            }
        };

        let ElectionRound {
            epoch,
            request,
            peers,
            outcome,
        } = round;

        for peer in peers {
            tokio::spawn(self.clone().request_vote_from(peer, epoch, request.clone()));
        }

        let node = self.clone();
        tokio::spawn(async move {
            match outcome.await {
                Ok(ElectionOutcome::Won { term }) => {
                    // 立即宣告领导权
                    node.broadcast_append_entries(term);
                }
                Ok(ElectionOutcome::Lost { term }) => {
                    debug!("Node {} election for term {} ended without a win", node.inner.id, term);
                }
                Err(_) => {}
            }
        });
    }

    /// 向单个节点请求投票，传输失败时重试直到本轮选举结束
    async fn request_vote_from(self, peer: NodeId, epoch: ElectionEpoch, request: RequestVoteRequest) {
        loop {
            {
                let Some(state) = self.lock_live().await else {
                    return;
                };
                if !state.election_active(epoch) {
                    return;
                }
            }

            match self
                .inner
                .network
                .request_vote(self.inner.id, peer, request.clone())
                .await
            {
                Ok(response) => {
                    let Some(mut state) = self.lock_live().await else {
                        return;
                    };
                    if let Err(err) = state
                        .handle_request_vote_response(epoch, peer, response)
                        .await
                    {
                        report(self.inner.id, &err, "handle_request_vote_response", Some(peer));
                    }
                    return;
                }
                Err(err) => {
                    report(self.inner.id, &err, "request_vote", Some(peer));
                    sleep(self.inner.options.rpc_retry_backoff).await;
                }
            }
        }
    }

    /// 向所有 follower 开启新一轮复制（心跳与新条目共用）
    fn broadcast_append_entries(&self, term: Term) {
        for peer in self.inner.options.peers.iter().copied() {
            if peer == self.inner.id {
                continue;
            }
            tokio::spawn(self.clone().replicate_to(peer, term));
        }
    }

    /// 单个 follower 的复制循环：被新一轮取代或失去领导权时结束
    async fn replicate_to(self, peer: NodeId, term: Term) {
        let round = {
            let Some(mut state) = self.lock_live().await else {
                return;
            };
            match state.begin_replication_round(peer, term) {
                Some(round) => round,
                None => return,
            }
        };

        loop {
            let request = {
                let Some(state) = self.lock_live().await else {
                    return;
                };
                match state.build_append_entries(peer, term, round) {
                    Some(request) => request,
                    None => return,
                }
            };

            match self
                .inner
                .network
                .append_entries(self.inner.id, peer, request.clone())
                .await
            {
                Ok(response) => {
                    let Some(mut state) = self.lock_live().await else {
                        return;
                    };
                    match state
                        .handle_append_entries_response(peer, &request, response)
                        .await
                    {
                        Ok(ReplicationStep::Retry) => continue,
                        Ok(ReplicationStep::Done | ReplicationStep::Stop) => return,
                        Err(err) => {
                            report(self.inner.id, &err, "handle_append_entries_response", Some(peer));
                            return;
                        }
                    }
                }
                Err(err) => {
                    report(self.inner.id, &err, "append_entries", Some(peer));
                    sleep(self.inner.options.rpc_retry_backoff).await;
                }
            }
        }
    }

    /// 唯一的应用任务：按顺序把已提交条目交付给应用层，每条只交付一次
    async fn run_applier(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.inner.apply_notify.notified() => {}
                _ = shutdown.changed() => return,
            }

            loop {
                let batch = {
                    let Some(state) = self.lock_live().await else {
                        return;
                    };
                    state.committed_entries()
                };
                let Some(last) = batch.last().map(|msg| msg.index) else {
                    break;
                };

                for msg in batch {
                    if self.is_killed() {
                        return;
                    }
                    tokio::select! {
                        sent = self.inner.apply_tx.send(msg) => {
                            if sent.is_err() {
                                warn!("Node {} apply channel closed, stopping applier", self.inner.id);
                                return;
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }

                let Some(mut state) = self.lock_live().await else {
                    return;
                };
                state.mark_applied(last);
            }
        }
    }
}
