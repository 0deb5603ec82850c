//! Election handling for Raft state machine

use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::RaftState;
use crate::event::Role;
use crate::message::{HardState, RequestVoteRequest, RequestVoteResponse};
use crate::traits::RaftResult;
use crate::types::{ElectionEpoch, NodeId, Term};

/// 一次选举的最终结果，每个选举轮次只会产生一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Won { term: Term },
    Lost { term: Term },
}

/// 进行中选举的跟踪状态
pub(crate) struct ElectionTracker {
    pub epoch: ElectionEpoch,
    pub term: Term,
    pub granted: HashSet<NodeId>,
    outcome_tx: Option<oneshot::Sender<ElectionOutcome>>,
}

/// Everything the node needs to run one election outside the lock.
#[derive(Debug)]
pub struct ElectionRound {
    pub epoch: ElectionEpoch,
    pub request: RequestVoteRequest,
    pub peers: Vec<NodeId>,
    pub outcome: oneshot::Receiver<ElectionOutcome>,
}

impl RaftState {
    /// 处理选举超时：递增任期，成为 Candidate 并为自己投票
    pub(crate) async fn start_election(&mut self) -> RaftResult<Option<ElectionRound>> {
        if self.role == Role::Leader {
            info!(target: "raft", "Node {} is the leader and will not start a new election", self.id);
            return Ok(None);
        }

        // 放弃上一轮未完成的选举
        self.conclude_election(false);

        info!(
            "Node {} starting election for term {}",
            self.id,
            self.current_term + 1
        );

        // 先落盘新任期和自投票，成功后才切换为 Candidate
        let timeout = self.election_timer.reset();
        let hard_state = HardState {
            term: self.current_term + 1,
            voted_for: Some(self.id),
        };
        self.storage.save(&hard_state, self.log.entries()).await?;

        self.current_term = hard_state.term;
        self.role = Role::Candidate;
        self.voted_for = hard_state.voted_for;
        self.leader_id = None;

        // 生成新选举轮次并初始化跟踪状态
        self.election_epoch += 1;
        let epoch = self.election_epoch;
        let (outcome_tx, outcome) = oneshot::channel();
        self.election = Some(ElectionTracker {
            epoch,
            term: self.current_term,
            granted: HashSet::from([self.id]),
            outcome_tx: Some(outcome_tx),
        });

        debug!(
            "Node {} election epoch {} armed, next timeout in {:?}",
            self.id, epoch, timeout
        );

        let round = ElectionRound {
            epoch,
            request: RequestVoteRequest {
                term: self.current_term,
                candidate_id: self.id,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            },
            peers: self.other_peers(),
            outcome,
        };

        // 单节点集群自己的一票即是多数
        self.check_election_result();

        Ok(Some(round))
    }

    /// 该轮选举是否仍在进行
    pub fn election_active(&self, epoch: ElectionEpoch) -> bool {
        self.role == Role::Candidate
            && self
                .election
                .as_ref()
                .is_some_and(|tracker| tracker.epoch == epoch)
    }

    /// 处理投票请求
    pub(crate) async fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        if request.term < self.current_term {
            info!(
                "Node {} rejecting vote for {}: stale term {} < {}",
                self.id, request.candidate_id, request.term, self.current_term
            );
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // 处理更高任期（先于投票资格判断）
        let mut dirty = self.observe_term(request.term);

        let can_vote =
            self.voted_for.is_none() || self.voted_for == Some(request.candidate_id);
        let log_ok = self
            .log
            .is_up_to_date(request.last_log_index, request.last_log_term);

        let vote_granted = can_vote && log_ok;
        if vote_granted {
            if self.voted_for != Some(request.candidate_id) {
                self.voted_for = Some(request.candidate_id);
                dirty = true;
            }
            self.reset_election_timer();
            info!(
                "Node {} granting vote to {} for term {}",
                self.id, request.candidate_id, self.current_term
            );
        } else if !can_vote {
            info!(
                "Node {} rejecting vote for {} in term {}, already voted for {:?}",
                self.id, request.candidate_id, self.current_term, self.voted_for
            );
        } else {
            info!(
                "Node {} rejecting vote for {}, logs not up-to-date (candidate {}/{}, local {}/{})",
                self.id,
                request.candidate_id,
                request.last_log_index,
                request.last_log_term,
                self.log.last_index(),
                self.log.last_term()
            );
        }

        if dirty {
            self.persist().await?;
        }

        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        })
    }

    /// 处理投票响应
    pub(crate) async fn handle_request_vote_response(
        &mut self,
        epoch: ElectionEpoch,
        peer: NodeId,
        response: RequestVoteResponse,
    ) -> RaftResult<()> {
        // 处理更高任期
        if response.term > self.current_term {
            info!(
                "Node {} abandoning election: peer {} reported higher term {} (current term {})",
                self.id, peer, response.term, self.current_term
            );
            self.observe_term(response.term);
            self.persist().await?;
            return Ok(());
        }

        if !self.election_active(epoch) {
            debug!(
                "Node {} ignoring vote response from {} for finished election epoch {}",
                self.id, peer, epoch
            );
            return Ok(());
        }

        let Some(tracker) = self.election.as_mut() else {
            return Ok(());
        };
        if response.term != tracker.term {
            warn!(
                "Node {} ignoring vote response from {} with term {} (election term {})",
                self.id, peer, response.term, tracker.term
            );
            return Ok(());
        }

        if response.vote_granted {
            tracker.granted.insert(peer);
            debug!(
                "Node {} received vote from {} ({} granted)",
                self.id,
                peer,
                tracker.granted.len()
            );
        } else {
            debug!("Node {} was denied a vote by {}", self.id, peer);
        }

        self.check_election_result();
        Ok(())
    }

    /// 检查选举结果
    pub(crate) fn check_election_result(&mut self) {
        let won = self
            .election
            .as_ref()
            .is_some_and(|tracker| tracker.granted.len() >= self.quorum());
        if won {
            self.become_leader();
        }
    }

    /// 成为 Leader
    pub(crate) fn become_leader(&mut self) {
        info!(
            "Node {} becoming leader for term {} (previous role: {})",
            self.id, self.current_term, self.role
        );

        self.role = Role::Leader;
        self.leader_id = Some(self.id);

        // 初始化复制状态
        let next = self.log.last_index() + 1;
        self.clear_leader_state();
        for peer in self.other_peers() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        self.heartbeat.start();
        self.conclude_election(true);
    }

    /// 结束当前选举并兑现结果（每轮只兑现一次）
    pub(crate) fn conclude_election(&mut self, won: bool) {
        let Some(mut tracker) = self.election.take() else {
            return;
        };
        let outcome = if won {
            ElectionOutcome::Won { term: tracker.term }
        } else {
            ElectionOutcome::Lost { term: tracker.term }
        };
        if let Some(tx) = tracker.outcome_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}
