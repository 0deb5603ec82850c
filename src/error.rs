use thiserror::Error;
use tracing::{debug, error, warn};

use crate::types::{NodeId, Term};

/// 顶层Raft错误类型
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node {0} has been shut down")]
    Shutdown(NodeId),
}

/// RPC通信相关错误（对调用方而言全部等价于 ok = false）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Remote handler failed: {0}")]
    Remote(String),
}

/// 存储相关错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Corrupted data at index {0}")]
    DataCorruption(u64),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// 客户端相关错误
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not leader (term {term}, current leader: {leader:?})")]
    NotLeader { term: Term, leader: Option<NodeId> },

    #[error("Node has been shut down")]
    Shutdown,

    #[error("Internal error {0}")]
    Internal(anyhow::Error),
}

/// 配置校验错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Peer list is empty")]
    EmptyPeers,

    #[error("Node {0} is not in its own peer list")]
    SelfNotInPeers(NodeId),

    #[error("Peer {0} is listed more than once")]
    DuplicatePeer(NodeId),

    #[error("Invalid election timeout range {min_ms}ms..={max_ms}ms")]
    InvalidElectionTimeout { min_ms: u128, max_ms: u128 },

    #[error("Heartbeat interval {heartbeat_ms}ms is too close to election timeout {election_min_ms}ms")]
    HeartbeatTooSlow {
        heartbeat_ms: u128,
        election_min_ms: u128,
    },

    #[error("Timer tick {tick_ms}ms must not exceed heartbeat interval {heartbeat_ms}ms")]
    TickTooCoarse { tick_ms: u128, heartbeat_ms: u128 },

    #[error("Apply batch size must be positive")]
    ZeroApplyBatch,
}

// === 统一错误处理机制 ===
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Fatal,       // 协议或持久化无法继续
    Recoverable, // 可以重试的错误
    Ignorable,   // 仅需记录日志的错误
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::NodeNotFound(_) => ErrorSeverity::Recoverable,
            RpcError::Network(_) => ErrorSeverity::Ignorable,
            RpcError::Timeout => ErrorSeverity::Ignorable,
            RpcError::Remote(_) => ErrorSeverity::Recoverable,
        }
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Encode(_) => ErrorSeverity::Fatal,
            StorageError::Decode(_) => ErrorSeverity::Fatal,
            StorageError::DataCorruption(_) => ErrorSeverity::Fatal,
            StorageError::Unavailable(_) => ErrorSeverity::Recoverable,
        }
    }
}

impl ErrorHandler for RaftError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RaftError::Rpc(e) => e.severity(),
            RaftError::Storage(e) => e.severity(),
            RaftError::Client(_) => ErrorSeverity::Ignorable,
            RaftError::Config(_) => ErrorSeverity::Fatal,
            RaftError::Shutdown(_) => ErrorSeverity::Ignorable,
        }
    }
}

/// 按严重程度统一记录回调错误
pub fn report<E>(node: NodeId, err: &E, operation: &str, target: Option<NodeId>)
where
    E: ErrorHandler + std::fmt::Display,
{
    let ctx = match target {
        Some(t) => format!("{} from {} to {}", operation, node, t),
        None => format!("{} on {}", operation, node),
    };

    match err.severity() {
        ErrorSeverity::Fatal => error!("[FATAL] {} failed: {}", ctx, err),
        ErrorSeverity::Recoverable => warn!("[RECOVERABLE] {} failed: {} - Will retry", ctx, err),
        ErrorSeverity::Ignorable => debug!("[IGNORABLE] {} failed: {}", ctx, err),
    }
}
