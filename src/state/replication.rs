//! Log replication handling for Raft state machine

use tracing::{debug, error, info, warn};

use super::RaftState;
use crate::event::Role;
use crate::log::MergeUndo;
use crate::message::{AppendEntriesRequest, AppendEntriesResponse};
use crate::traits::RaftResult;
use crate::types::{LogIndex, NodeId, ReplicationRound, Term};

/// 处理完一次 AppendEntries 响应后复制循环该做什么
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStep {
    /// 本轮结束（成功或响应已过期）
    Done,
    /// next_index 已回退，立即重发
    Retry,
    /// 不再是该任期的 Leader，停止复制
    Stop,
}

impl RaftState {
    /// 为 follower 开启新一轮复制，旧轮次的重试随之失效
    pub(crate) fn begin_replication_round(
        &mut self,
        peer: NodeId,
        term: Term,
    ) -> Option<ReplicationRound> {
        if self.role != Role::Leader || self.current_term != term {
            return None;
        }
        let round = self.replication_rounds.entry(peer).or_insert(0);
        *round += 1;
        Some(*round)
    }

    /// 构造发往 follower 的 AppendEntries（携带从 next_index 开始的全部条目）
    pub(crate) fn build_append_entries(
        &self,
        peer: NodeId,
        term: Term,
        round: ReplicationRound,
    ) -> Option<AppendEntriesRequest> {
        if self.role != Role::Leader || self.current_term != term {
            return None;
        }
        if self.replication_rounds.get(&peer) != Some(&round) {
            debug!(
                "Node {} replication round {} to {} superseded",
                self.id, round, peer
            );
            return None;
        }

        let next_index = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            error!(
                "Node {} has next_index {} for {} beyond its log (last index {})",
                self.id,
                next_index,
                peer,
                self.log.last_index()
            );
            return None;
        };

        Some(AppendEntriesRequest {
            term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next_index),
            leader_commit: self.commit_index,
        })
    }

    /// 处理 AppendEntries 请求（心跳与日志复制共用）
    pub(crate) async fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // 过期 Leader 的请求直接拒绝，不重置选举定时器
        if request.term < self.current_term {
            debug!(
                "Node {} rejecting AppendEntries from {}: stale term {} < {}",
                self.id, request.leader_id, request.term, self.current_term
            );
            return Ok(AppendEntriesResponse::rejected(self.current_term, None, None));
        }

        let mut dirty = self.observe_term(request.term);

        if self.role == Role::Leader {
            error!(
                "Node {} received AppendEntries from {} while leading term {}",
                self.id, request.leader_id, self.current_term
            );
            panic!(
                "two leaders ({} and {}) in term {}",
                self.id, request.leader_id, self.current_term
            );
        }
        if self.role == Role::Candidate {
            info!(
                "Node {} found leader {} for term {}, abandoning candidacy",
                self.id, request.leader_id, self.current_term
            );
            self.become_follower();
        }

        self.leader_id = Some(request.leader_id);
        self.reset_election_timer();

        let (response, merged, new_commit) = self.accept_entries(request);
        dirty |= merged.is_some();

        // 回复和提交之前必须落盘；失败时撤销本次合并
        if dirty {
            if let Err(err) = self.persist().await {
                if let Some(undo) = merged {
                    warn!(
                        "Node {} failed to persist entries from leader, rolling back: {}",
                        self.id, err
                    );
                    self.log.undo_merge(undo);
                }
                return Err(err.into());
            }
        }

        // 只能提交与 Leader 确认一致的前缀
        if let Some(new_commit) = new_commit {
            self.advance_commit_index(new_commit);
        }
        Ok(response)
    }

    /// 一致性检查并合并日志。返回回复、合并的撤销记录和可提交的位置，
    /// 持久化与推进提交索引由调用方负责。
    fn accept_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, Option<MergeUndo>, Option<LogIndex>) {
        let prev_log_index = request.prev_log_index;

        match self.log.term_at(prev_log_index) {
            None => {
                debug!(
                    "Node {} missing entry {} (last index {}), asking {} to back up",
                    self.id,
                    prev_log_index,
                    self.log.last_index(),
                    request.leader_id
                );
                let response = AppendEntriesResponse::rejected(
                    self.current_term,
                    Some(self.log.last_index() + 1),
                    None,
                );
                return (response, None, None);
            }
            Some(term) if term != request.prev_log_term => {
                let conflict_index = self.log.first_index_of_term(prev_log_index);
                debug!(
                    "Node {} log mismatch at {}: local term {} vs leader term {}, conflict index {}",
                    self.id, prev_log_index, term, request.prev_log_term, conflict_index
                );
                let response = AppendEntriesResponse::rejected(
                    self.current_term,
                    Some(conflict_index),
                    Some(term),
                );
                return (response, None, None);
            }
            Some(_) => {}
        }

        let contiguous = request
            .entries
            .iter()
            .enumerate()
            .all(|(i, entry)| entry.index == prev_log_index + 1 + i as u64);
        if !contiguous {
            warn!(
                "Node {} rejecting non-contiguous entries from {} after index {}",
                self.id, request.leader_id, prev_log_index
            );
            let response = AppendEntriesResponse::rejected(self.current_term, None, None);
            return (response, None, None);
        }

        if let Some(conflict) = self.log.find_conflict(prev_log_index, &request.entries) {
            if conflict <= self.commit_index {
                error!(
                    "Node {} asked to overwrite committed entry {} (commit index {})",
                    self.id, conflict, self.commit_index
                );
                panic!(
                    "node {} would truncate committed entry {}",
                    self.id, conflict
                );
            }
            info!(
                "Node {} truncating conflicting entries from index {}",
                self.id, conflict
            );
        }

        let last_new_index = prev_log_index + request.entries.len() as u64;
        let merged = self.log.merge(prev_log_index, request.entries);
        let new_commit = request.leader_commit.min(last_new_index);

        (
            AppendEntriesResponse::accepted(self.current_term),
            merged,
            Some(new_commit),
        )
    }

    /// 处理 AppendEntries 响应
    pub(crate) async fn handle_append_entries_response(
        &mut self,
        peer: NodeId,
        request: &AppendEntriesRequest,
        response: AppendEntriesResponse,
    ) -> RaftResult<ReplicationStep> {
        if response.term > self.current_term {
            info!(
                "Node {} stepping down: follower {} reported higher term {} (current term {})",
                self.id, peer, response.term, self.current_term
            );
            self.observe_term(response.term);
            self.persist().await?;
            return Ok(ReplicationStep::Stop);
        }

        if self.role != Role::Leader || self.current_term != request.term {
            debug!(
                "Node {} ignoring AppendEntries response from {} for term {}",
                self.id, peer, request.term
            );
            return Ok(ReplicationStep::Stop);
        }

        if response.success {
            let matched = request.prev_log_index + request.entries.len() as u64;
            let match_index = self.match_index.entry(peer).or_insert(0);
            if matched > *match_index {
                *match_index = matched;
            }
            let next_index = self.next_index.entry(peer).or_insert(matched + 1);
            *next_index = (*next_index).max(matched + 1);
            debug!(
                "Node {} replicated to {} up to index {}",
                self.id, peer, matched
            );
            self.update_commit_index();
            return Ok(ReplicationStep::Done);
        }

        let current_next = self.next_index.get(&peer).copied();
        if current_next != Some(request.prev_log_index + 1) {
            // next_index 已被其他响应移动，这个拒绝已经过期
            debug!(
                "Node {} ignoring stale rejection from {} (prev {}, next {:?})",
                self.id, peer, request.prev_log_index, current_next
            );
            // 已被回退得更低时按新位置立即重发；被取代的轮次会在构造请求时退出
            return Ok(match current_next {
                Some(next) if next <= request.prev_log_index => ReplicationStep::Retry,
                _ => ReplicationStep::Done,
            });
        }

        let new_next = self.backup_next_index(request.prev_log_index, &response);
        debug!(
            "Node {} backing up next_index for {} from {} to {}",
            self.id,
            peer,
            request.prev_log_index + 1,
            new_next
        );
        self.next_index.insert(peer, new_next);
        Ok(ReplicationStep::Retry)
    }

    /// 根据冲突提示计算新的 next_index，结果限定在 [1, prev_log_index]
    fn backup_next_index(
        &self,
        prev_log_index: LogIndex,
        response: &AppendEntriesResponse,
    ) -> LogIndex {
        let hinted = response
            .conflict_term
            .and_then(|term| self.log.last_index_of_term(term))
            .map(|index| index + 1)
            .or(response.conflict_index)
            .unwrap_or(prev_log_index);
        hinted.clamp(1, prev_log_index.max(1))
    }

    /// Leader 推进提交索引：只按多数派提交当前任期的条目
    pub(crate) fn update_commit_index(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let quorum = self.quorum();
        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            match self.log.term_at(candidate) {
                Some(term) if term == self.current_term => {
                    let replicas = 1 + self
                        .match_index
                        .values()
                        .filter(|&&matched| matched >= candidate)
                        .count();
                    if replicas >= quorum {
                        self.advance_commit_index(candidate);
                        return;
                    }
                }
                // 更早任期的条目只能随当前任期条目间接提交
                _ => return,
            }
            candidate -= 1;
        }
    }
}
