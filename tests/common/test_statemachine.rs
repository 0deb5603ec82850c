use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use raft_consensus::{ApplyMsg, Command, LogIndex, NodeId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

// --- 业务命令定义 ---
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Command {
        serde_json::to_vec(self).expect("Failed to serialize KvCommand")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// 所有节点共享的检查器：同一 index 只能应用同一条命令
#[derive(Clone, Default)]
pub struct ApplyChecker {
    committed: Arc<Mutex<HashMap<LogIndex, Command>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl ApplyChecker {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn record_error(&self, message: String) {
        error!("{}", message);
        self.errors.lock().unwrap().push(message);
    }
}

/// 单个节点（单次启动）交付给应用层的条目
#[derive(Clone, Default)]
pub struct AppliedLog {
    entries: Arc<Mutex<Vec<ApplyMsg>>>,
}

impl AppliedLog {
    pub fn entries(&self) -> Vec<ApplyMsg> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn get(&self, index: LogIndex) -> Option<ApplyMsg> {
        let entries = self.entries.lock().unwrap();
        index
            .checked_sub(1)
            .and_then(|i| entries.get(i as usize))
            .cloned()
    }

    /// 按 KvCommand 重放已应用的条目
    pub fn kv_state(&self) -> HashMap<String, String> {
        let mut data = HashMap::new();
        for msg in self.entries.lock().unwrap().iter() {
            match KvCommand::decode(&msg.command) {
                Ok(KvCommand::Set { key, value }) => {
                    data.insert(key, value);
                }
                Ok(KvCommand::Delete { key }) => {
                    data.remove(&key);
                }
                Err(_) => {}
            }
        }
        data
    }

    /// 消费节点的 apply 流，检查顺序与跨节点一致性
    pub fn spawn_consumer(
        &self,
        id: NodeId,
        mut rx: mpsc::Receiver<ApplyMsg>,
        checker: ApplyChecker,
    ) -> tokio::task::JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                debug!("Node {} applied index {} term {}", id, msg.index, msg.term);
                let conflicting = {
                    let mut committed = checker.committed.lock().unwrap();
                    match committed.get(&msg.index) {
                        Some(existing) => *existing != msg.command,
                        None => {
                            committed.insert(msg.index, msg.command.clone());
                            false
                        }
                    }
                };
                if conflicting {
                    checker.record_error(format!(
                        "node {} applied a different command at index {}",
                        id, msg.index
                    ));
                }

                let mut entries = log.entries.lock().unwrap();
                let expected = entries.len() as LogIndex + 1;
                if msg.index != expected {
                    checker.record_error(format!(
                        "node {} applied index {} out of order, expected {}",
                        id, msg.index, expected
                    ));
                }
                entries.push(msg);
            }
        })
    }
}
