use async_trait::async_trait;

use crate::error::{ClientError, RaftError, RpcError, StorageError};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, HardState, LogEntry, PersistentState,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;

// 结果类型别名
pub type RaftResult<T> = Result<T, RaftError>;
pub type RpcResult<T> = Result<T, RpcError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ClientResult<T> = Result<T, ClientError>;

/// Outbound RPC transport.
///
/// A call either yields the peer's reply or an `RpcError`. The core does not
/// distinguish a dead peer from a lost request or a lost reply: every error is
/// retried the same way, so implementations may time out, drop or fail calls
/// freely but must eventually return.
#[async_trait]
pub trait Network: Send + Sync {
    async fn request_vote(
        &self,
        from: NodeId,
        target: NodeId,
        args: RequestVoteRequest,
    ) -> RpcResult<RequestVoteResponse>;

    async fn append_entries(
        &self,
        from: NodeId,
        target: NodeId,
        args: AppendEntriesRequest,
    ) -> RpcResult<AppendEntriesResponse>;
}

/// Durable home of a node's persistent state (`currentTerm`, `votedFor`, log).
///
/// `save` is awaited while the node lock is held, after every mutation and
/// before any reply that depends on it leaves the node. `load` is called
/// once, when the node is constructed.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, hard_state: &HardState, log: &[LogEntry]) -> StorageResult<()>;
    async fn load(&self) -> StorageResult<Option<PersistentState>>;
}
