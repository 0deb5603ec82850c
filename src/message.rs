use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageError;
use crate::types::{Command, LogIndex, NodeId, Term};

// === 核心状态与逻辑 ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
}

// === 网络接口 ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// follower 建议的下一个发送位置
    pub conflict_index: Option<LogIndex>,
    /// 用于更高效的日志冲突处理
    pub conflict_term: Option<Term>,
}

impl AppendEntriesResponse {
    pub(crate) fn accepted(term: Term) -> Self {
        Self {
            term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        }
    }

    pub(crate) fn rejected(
        term: Term,
        conflict_index: Option<LogIndex>,
        conflict_term: Option<Term>,
    ) -> Self {
        Self {
            term,
            success: false,
            conflict_index,
            conflict_term,
        }
    }
}

/// 已提交日志交付给上层服务的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyMsg {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// 持久化镜像：HardState 加完整日志
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn encode(hard_state: &HardState, log: &[LogEntry]) -> Result<Vec<u8>, StorageError> {
        let config = bincode::config::standard();
        let image = (hard_state, log);
        Ok(bincode::encode_to_vec(image, config)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        let config = bincode::config::standard();
        let ((hard_state, log), _): ((HardState, Vec<LogEntry>), usize) =
            bincode::decode_from_slice(data, config).map_err(|e| {
                warn!("Failed to decode persistent state: {}", e);
                e
            })?;
        Ok(Self { hard_state, log })
    }
}
