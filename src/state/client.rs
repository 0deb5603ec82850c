//! Client request handling for Raft state machine

use tracing::{debug, error, info, warn};

use super::RaftState;
use crate::error::ClientError;
use crate::message::ApplyMsg;
use crate::traits::ClientResult;
use crate::types::{Command, LogIndex, Term};

impl RaftState {
    /// 处理客户端提议：只有 Leader 追加并持久化，返回 (index, term)
    pub(crate) async fn propose(&mut self, cmd: Command) -> ClientResult<(LogIndex, Term)> {
        if !self.is_leader() {
            debug!(
                "Node {} rejecting proposal (role {}, leader {:?})",
                self.id, self.role, self.leader_id
            );
            return Err(ClientError::NotLeader {
                term: self.current_term,
                leader: self.leader_id,
            });
        }

        let term = self.current_term;
        let index = self.log.append(term, cmd);

        if let Err(err) = self.persist().await {
            error!(
                "Node {} failed to persist proposal at index {}: {}",
                self.id, index, err
            );
            self.log.truncate_from(index);
            return Err(ClientError::Internal(anyhow::anyhow!(
                "failed to persist entry {}: {}",
                index,
                err
            )));
        }

        info!(
            "Node {} appended client command at index {} in term {}",
            self.id, index, term
        );

        // 单节点集群无需等待复制
        self.update_commit_index();
        Ok((index, term))
    }

    /// 取出下一批待应用的已提交条目
    pub(crate) fn committed_entries(&self) -> Vec<ApplyMsg> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let high = self
            .commit_index
            .min(self.last_applied + self.options.apply_batch_size);
        self.log
            .slice(self.last_applied + 1, high)
            .iter()
            .map(|entry| ApplyMsg {
                index: entry.index,
                term: entry.term,
                command: entry.command.clone(),
            })
            .collect()
    }

    /// 记录已交付给应用层的位置
    pub(crate) fn mark_applied(&mut self, index: LogIndex) {
        if index <= self.last_applied {
            return;
        }
        if index > self.commit_index {
            warn!(
                "Node {} asked to mark {} applied beyond commit index {}",
                self.id, index, self.commit_index
            );
            return;
        }
        debug!(
            "Node {} applied entries {}..={}",
            self.id,
            self.last_applied + 1,
            index
        );
        self.last_applied = index;
    }
}
