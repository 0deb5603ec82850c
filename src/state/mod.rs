//! Raft State Machine Module
//!
//! This module contains the core `RaftState` struct, the single piece of
//! mutable node state guarded by the node lock. Its implementation is split
//! across multiple files:
//!
//! - `mod.rs` - State struct definition, options and role transitions
//! - `election.rs` - Election handling and the RequestVote handler
//! - `replication.rs` - Log replication and the AppendEntries handler
//! - `client.rs` - Client proposals and the apply pipeline

mod client;
mod election;
mod replication;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::{ConfigError, RaftError};
use crate::event::{Event, Role};
use crate::log::RaftLog;
use crate::message::HardState;
use crate::timer::{ElectionTimer, HeartbeatTicker};
use crate::traits::{RaftResult, Storage, StorageResult};
use crate::types::{ElectionEpoch, LogIndex, NodeId, ReplicationRound, Term};

pub use election::{ElectionOutcome, ElectionRound};
pub use replication::ReplicationStep;

/// Raft 状态机配置选项
#[derive(Debug, Clone)]
pub struct RaftStateOptions {
    pub id: NodeId,
    /// 集群全部成员（包含自己）
    pub peers: Vec<NodeId>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// 定时驱动任务的轮询粒度
    pub timer_tick: Duration,
    /// RPC 传输失败后重试前的等待时间
    pub rpc_retry_backoff: Duration,
    /// 每次交付给应用层的最大日志条数
    pub apply_batch_size: u64,
}

impl Default for RaftStateOptions {
    fn default() -> Self {
        Self {
            id: 0,
            peers: vec![0],
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(15),
            timer_tick: Duration::from_millis(5),
            rpc_retry_backoff: Duration::from_millis(10),
            apply_batch_size: 64,
        }
    }
}

impl RaftStateOptions {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            id,
            peers,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::EmptyPeers);
        }
        if !self.peers.contains(&self.id) {
            return Err(ConfigError::SelfNotInPeers(self.id));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(*peer) {
                return Err(ConfigError::DuplicatePeer(*peer));
            }
        }
        if self.election_timeout_min.is_zero()
            || self.election_timeout_min > self.election_timeout_max
        {
            return Err(ConfigError::InvalidElectionTimeout {
                min_ms: self.election_timeout_min.as_millis(),
                max_ms: self.election_timeout_max.as_millis(),
            });
        }
        // 心跳周期至少比选举超时下限短一个数量级，否则会产生误选举
        if self.heartbeat_interval.is_zero()
            || self.heartbeat_interval * 10 > self.election_timeout_min
        {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat_ms: self.heartbeat_interval.as_millis(),
                election_min_ms: self.election_timeout_min.as_millis(),
            });
        }
        if self.timer_tick.is_zero() || self.timer_tick > self.heartbeat_interval {
            return Err(ConfigError::TickTooCoarse {
                tick_ms: self.timer_tick.as_millis(),
                heartbeat_ms: self.heartbeat_interval.as_millis(),
            });
        }
        if self.apply_batch_size == 0 {
            return Err(ConfigError::ZeroApplyBatch);
        }
        Ok(())
    }
}

/// Point-in-time view of a node, taken under the node lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Raft 状态机（可变状态，无 Clone）
pub struct RaftState {
    // 节点标识与配置
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub leader_id: Option<NodeId>,

    // 核心状态
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,

    // 日志与提交状态
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,

    // Leader 专用状态
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    replication_rounds: HashMap<NodeId, ReplicationRound>,

    // 选举跟踪（仅 Candidate 状态有效）
    election: Option<election::ElectionTracker>,
    election_epoch: ElectionEpoch,

    // 定时器
    election_timer: ElectionTimer,
    heartbeat: HeartbeatTicker,

    // 外部依赖
    storage: Arc<dyn Storage>,
    apply_notify: Arc<Notify>,

    pub options: RaftStateOptions,
}

impl RaftState {
    /// 初始化状态，从存储加载持久化数据
    pub async fn new(
        options: RaftStateOptions,
        storage: Arc<dyn Storage>,
        apply_notify: Arc<Notify>,
    ) -> RaftResult<Self> {
        let (hard_state, log) = match storage.load().await {
            Ok(Some(state)) => (state.hard_state, RaftLog::from_entries(state.log)?),
            Ok(None) => (HardState::default(), RaftLog::new()),
            Err(err) => {
                error!("Node {} failed to load persistent state: {}", options.id, err);
                return Err(RaftError::Storage(err));
            }
        };

        info!(
            "Node {} restored term {} voted_for {:?} with {} log entries",
            options.id,
            hard_state.term,
            hard_state.voted_for,
            log.last_index()
        );

        Ok(RaftState {
            id: options.id,
            peers: options.peers.clone(),
            leader_id: None,
            role: Role::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            replication_rounds: HashMap::new(),
            election: None,
            election_epoch: 0,
            election_timer: ElectionTimer::new(
                options.election_timeout_min,
                options.election_timeout_max,
            ),
            heartbeat: HeartbeatTicker::new(options.heartbeat_interval),
            storage,
            apply_notify,
            options,
        })
    }

    /// 获取除自己外的对等节点列表
    pub fn other_peers(&self) -> Vec<NodeId> {
        self.peers.iter().copied().filter(|p| *p != self.id).collect()
    }

    /// 多数派阈值（包含自己）
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// 统一保存持久化状态
    pub async fn persist(&self) -> StorageResult<()> {
        self.storage
            .save(&self.hard_state(), self.log.entries())
            .await
    }

    /// 观察到更高任期：先更新任期、清空投票，再按需降级。
    /// 返回任期是否变化；持久化由调用方在回复前完成。
    pub(crate) fn observe_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }
        info!(
            "Node {} updating term from {} to {} (role {})",
            self.id, self.current_term, term, self.role
        );
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        if self.role != Role::Follower {
            self.become_follower();
        }
        true
    }

    /// 降级为 Follower：停止心跳，重启选举定时器，放弃进行中的选举
    pub(crate) fn become_follower(&mut self) {
        let was = self.role;
        self.role = Role::Follower;
        self.heartbeat.stop();
        self.clear_leader_state();
        self.conclude_election(false);
        let timeout = self.election_timer.reset();
        info!(
            "Node {} stepped down from {} to Follower in term {} (election timeout {:?})",
            self.id, was, self.current_term, timeout
        );
    }

    /// 清理 Leader 专用状态（角色切换时调用）
    fn clear_leader_state(&mut self) {
        self.next_index.clear();
        self.match_index.clear();
        self.replication_rounds.clear();
    }

    /// 定时器轮询：Leader 只关心心跳，其余角色只关心选举超时
    pub fn poll_timers(&mut self, now: Instant) -> Option<Event> {
        match self.role {
            Role::Leader => self.heartbeat.due(now).then_some(Event::HeartbeatTimeout),
            Role::Follower | Role::Candidate => self
                .election_timer
                .expired(now)
                .then_some(Event::ElectionTimeout),
        }
    }

    pub(crate) fn reset_election_timer(&mut self) {
        self.election_timer.reset();
    }

    /// 推进提交索引并唤醒应用任务
    pub(crate) fn advance_commit_index(&mut self, new_commit: LogIndex) {
        if new_commit <= self.commit_index {
            return;
        }
        debug_assert!(new_commit <= self.log.last_index());
        info!(
            "Node {} updating commit index from {} to {}",
            self.id, self.commit_index, new_commit
        );
        self.commit_index = new_commit;
        self.apply_notify.notify_one();
    }
}
