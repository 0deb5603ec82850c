use std::fmt::{self, Display};

/// 定时器产生的事件（由定时驱动任务分发）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// 选举超时（Follower/Candidate 触发）
    ElectionTimeout,
    /// 心跳超时（Leader 触发日志同步）
    HeartbeatTimeout,
}

/// Raft 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}
