//! A Raft consensus node.
//!
//! Each [`Node`] elects leaders, replicates an append-only command log across
//! its peers, persists `currentTerm`, `votedFor` and the log through a
//! [`Storage`] before answering RPCs, and delivers committed commands to the
//! application in log order over an [`ApplyMsg`] channel. Peers are reached
//! through a [`Network`] whose calls may be delayed, dropped or fail.

pub mod error;
pub mod event;
pub mod log;
pub mod message;
pub mod mock;
pub mod node;
pub mod state;
pub mod storage;
pub mod timer;
pub mod traits;
pub mod types;

pub use error::*;
pub use event::{Event, Role};
pub use log::RaftLog;
pub use message::*;
pub use node::Node;
pub use state::{NodeStatus, RaftState, RaftStateOptions};
pub use storage::MemStorage;
pub use traits::*;
pub use types::*;
