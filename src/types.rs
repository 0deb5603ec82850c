// 类型定义
pub type NodeId = u64;
pub type Command = Vec<u8>;
pub type Term = u64;
pub type LogIndex = u64;

/// 选举轮次编号（用于过滤已结束选举的迟到响应）
pub type ElectionEpoch = u64;

/// 复制轮次编号（每个 follower 独立递增，新一轮会取代旧一轮的重试）
pub type ReplicationRound = u64;
