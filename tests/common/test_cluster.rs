// test_cluster.rs
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raft_consensus::mock::{MockNetworkConfig, MockNetworkHub};
use raft_consensus::{
    ApplyMsg, ClientError, Command, LogIndex, MemStorage, Node, NodeId, NodeStatus,
    RaftStateOptions, Term,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::common::test_statemachine::{AppliedLog, ApplyChecker};

#[derive(Clone)]
pub struct TestClusterConfig {
    pub node_ids: Vec<NodeId>,
    pub network: MockNetworkConfig,
}

impl TestClusterConfig {
    pub fn new(n: u64) -> Self {
        Self {
            node_ids: (0..n).collect(),
            network: MockNetworkConfig::default(),
        }
    }
}

pub struct TestCluster {
    config: TestClusterConfig,
    hub: MockNetworkHub,
    storages: HashMap<NodeId, MemStorage>,
    nodes: Mutex<HashMap<NodeId, Node>>,
    applied: Mutex<HashMap<NodeId, AppliedLog>>,
    checker: ApplyChecker,
}

impl TestCluster {
    pub async fn new(config: TestClusterConfig) -> Self {
        let hub = MockNetworkHub::new(config.network.clone());
        let storages = config
            .node_ids
            .iter()
            .map(|id| (*id, MemStorage::new()))
            .collect();
        let cluster = TestCluster {
            config,
            hub,
            storages,
            nodes: Mutex::new(HashMap::new()),
            applied: Mutex::new(HashMap::new()),
            checker: ApplyChecker::default(),
        };

        for id in cluster.config.node_ids.clone() {
            cluster.start_node(id).await;
        }
        info!("TestCluster created with {} nodes", cluster.config.node_ids.len());
        cluster
    }

    pub fn hub(&self) -> &MockNetworkHub {
        &self.hub
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.config.node_ids.clone()
    }

    pub fn storage(&self, id: NodeId) -> MemStorage {
        self.storages[&id].clone()
    }

    /// 启动（或重启）节点：复用同一份存储，新开一条 apply 流
    pub async fn start_node(&self, id: NodeId) {
        let options = RaftStateOptions::new(id, self.config.node_ids.clone());
        let (apply_tx, apply_rx) = mpsc::channel(256);
        let applied = AppliedLog::default();
        applied.spawn_consumer(id, apply_rx, self.checker.clone());

        let node = match Node::new(
            options,
            Arc::new(self.hub.clone()),
            Arc::new(self.storage(id)),
            apply_tx,
        )
        .await
        {
            Ok(node) => node,
            Err(e) => panic!("Failed to create node {}: {}", id, e),
        };

        self.hub.register(id, node.clone());
        self.applied.lock().unwrap().insert(id, applied);
        self.nodes.lock().unwrap().insert(id, node);
        info!("Started node {}", id);
    }

    /// 模拟崩溃：停止节点并从网络上摘除，存储保留
    pub async fn crash_node(&self, id: NodeId) {
        let node = self.nodes.lock().unwrap().remove(&id);
        self.hub.unregister(id);
        match node {
            Some(node) => {
                node.kill().await;
                info!("Crashed node {}", id);
            }
            None => warn!("Attempted to crash non-running node {}", id),
        }
    }

    pub async fn restart_node(&self, id: NodeId) {
        self.crash_node(id).await;
        self.start_node(id).await;
    }

    pub fn isolate_node(&self, id: NodeId) {
        info!("Isolating node {}", id);
        self.hub.isolate(id);
    }

    pub fn restore_node(&self, id: NodeId) {
        info!("Restoring node {}", id);
        self.hub.restore(id);
    }

    pub fn get_node(&self, id: NodeId) -> Option<Node> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    /// 运行中且未被隔离的节点
    pub fn live_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|node| !self.hub.is_isolated(node.id()))
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.id());
        nodes
    }

    pub async fn status(&self, id: NodeId) -> Option<NodeStatus> {
        let node = self.get_node(id)?;
        Some(node.status().await)
    }

    /// 按任期统计自认为是 Leader 的节点，同一任期出现两个直接失败
    pub async fn leaders_by_term(&self) -> BTreeMap<Term, Vec<NodeId>> {
        let mut leaders: BTreeMap<Term, Vec<NodeId>> = BTreeMap::new();
        for node in self.live_nodes() {
            let (term, is_leader) = node.get_state().await;
            if is_leader {
                leaders.entry(term).or_default().push(node.id());
            }
        }
        for (term, ids) in &leaders {
            assert!(ids.len() <= 1, "term {} has {} leaders: {:?}", term, ids.len(), ids);
        }
        leaders
    }

    /// 等待并返回唯一的 Leader（取最高任期）
    pub async fn check_one_leader(&self) -> NodeId {
        for _ in 0..10 {
            sleep(Duration::from_millis(500)).await;
            let leaders = self.leaders_by_term().await;
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }
        panic!("expected one leader, got none");
    }

    pub async fn check_no_leader(&self) {
        for node in self.live_nodes() {
            let (term, is_leader) = node.get_state().await;
            assert!(
                !is_leader,
                "node {} unexpectedly leads term {}",
                node.id(),
                term
            );
        }
    }

    /// 所有在线节点的任期一致
    pub async fn check_terms(&self) -> Term {
        let mut agreed = None;
        for node in self.live_nodes() {
            let (term, _) = node.get_state().await;
            match agreed {
                None => agreed = Some(term),
                Some(t) => assert_eq!(t, term, "servers disagree on term"),
            }
        }
        agreed.unwrap_or(0)
    }

    pub fn applied(&self, id: NodeId) -> Vec<ApplyMsg> {
        self.applied
            .lock()
            .unwrap()
            .get(&id)
            .map(AppliedLog::entries)
            .unwrap_or_default()
    }

    pub fn kv_state(&self, id: NodeId) -> HashMap<String, String> {
        self.applied
            .lock()
            .unwrap()
            .get(&id)
            .map(AppliedLog::kv_state)
            .unwrap_or_default()
    }

    /// 有多少节点已经应用了 `index`，以及应用的命令
    pub fn n_committed(&self, index: LogIndex) -> (usize, Option<Command>) {
        let applied = self.applied.lock().unwrap();
        let mut count = 0;
        let mut command: Option<Command> = None;
        for (id, log) in applied.iter() {
            if let Some(msg) = log.get(index) {
                if let Some(existing) = &command {
                    assert_eq!(
                        existing, &msg.command,
                        "node {} applied a different command at index {}",
                        id, index
                    );
                }
                count += 1;
                command = Some(msg.command);
            }
        }
        (count, command)
    }

    /// 等待至少 `n` 个节点应用 `index`
    pub async fn wait_committed(&self, index: LogIndex, n: usize, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        loop {
            let (count, command) = self.n_committed(index);
            if count >= n {
                return command;
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// 提交一条命令并等待 `expected` 个节点应用它，返回其 index。
    /// `retry` 为 false 时第一次提交失败就判定测试失败。
    pub async fn one(&self, command: Command, expected: usize, retry: bool) -> LogIndex {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let mut started = None;
            for node in self.live_nodes() {
                match node.start(command.clone()).await {
                    Ok((index, _)) => {
                        started = Some(index);
                        break;
                    }
                    Err(ClientError::NotLeader { .. }) => {}
                    Err(e) => warn!("Node {} failed to start command: {}", node.id(), e),
                }
            }

            match started {
                Some(index) => {
                    let applied = self
                        .wait_committed(index, expected, Duration::from_secs(2))
                        .await;
                    if applied.as_ref() == Some(&command) {
                        return index;
                    }
                    if !retry {
                        panic!("one({:?}) failed to reach agreement at index {}", command, index);
                    }
                }
                None => sleep(Duration::from_millis(50)).await,
            }
        }
        panic!("one({:?}) failed to reach agreement", command);
    }

    /// 顺序与跨节点一致性检查的累计结果
    pub fn check_apply_errors(&self) {
        let errors = self.checker.errors();
        assert!(errors.is_empty(), "apply errors: {:?}", errors);
    }

    pub fn rpc_count(&self) -> u64 {
        self.hub.rpc_count()
    }

    pub async fn shutdown(&self) {
        let nodes: Vec<Node> = self.nodes.lock().unwrap().drain().map(|(_, n)| n).collect();
        for node in nodes {
            self.hub.unregister(node.id());
            node.kill().await;
        }
        info!("TestCluster shut down");
    }
}
