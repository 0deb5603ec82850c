use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::RpcError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::node::Node;
use crate::traits::{Network, RpcResult};
use crate::types::NodeId;

// --- 模拟网络配置 ---

/// 模拟网络行为的配置
#[derive(Debug, Clone)]
pub struct MockNetworkConfig {
    /// 基础延迟 (毫秒)
    pub base_latency_ms: u64,
    /// 额外随机延迟的最大值 (毫秒)
    pub jitter_max_ms: u64,
    /// 请求丢失的概率 (0.0 - 1.0)
    pub drop_rate: f64,
    /// 请求已被处理但回复丢失的概率 (0.0 - 1.0)
    pub reply_drop_rate: f64,
    /// 失败的调用在返回错误前等待的时间 (毫秒)
    pub failure_delay_ms: u64,
}

impl Default for MockNetworkConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 1,
            jitter_max_ms: 2,
            drop_rate: 0.0,
            reply_drop_rate: 0.0,
            failure_delay_ms: 20,
        }
    }
}

impl MockNetworkConfig {
    /// 高延迟、会丢包的网络
    pub fn unreliable() -> Self {
        Self {
            base_latency_ms: 5,
            jitter_max_ms: 25,
            drop_rate: 0.1,
            reply_drop_rate: 0.1,
            failure_delay_ms: 50,
        }
    }
}

// --- 模拟网络核心 ---

/// 内部共享状态
struct MockNetworkHubInner {
    /// 已注册的节点，RPC 直接调用它们的处理函数
    nodes: RwLock<HashMap<NodeId, Node>>,
    /// 被隔离的节点：进出的消息全部丢失
    isolated: RwLock<HashSet<NodeId>>,
    config: RwLock<MockNetworkConfig>,
    rng: Mutex<StdRng>,
    rpc_count: AtomicU64,
}

/// 模拟网络的中心枢纽：所有节点共享同一个实例作为 `Network`
#[derive(Clone)]
pub struct MockNetworkHub {
    inner: Arc<MockNetworkHubInner>,
}

/// 一次调用在网络上的命运
enum Delivery {
    Deliver(Duration),
    Fail(Duration),
}

impl MockNetworkHub {
    pub fn new(config: MockNetworkConfig) -> Self {
        Self {
            inner: Arc::new(MockNetworkHubInner {
                nodes: RwLock::new(HashMap::new()),
                isolated: RwLock::new(HashSet::new()),
                config: RwLock::new(config),
                rng: Mutex::new(StdRng::from_os_rng()),
                rpc_count: AtomicU64::new(0),
            }),
        }
    }

    /// 注册节点（重启后用新实例替换旧实例）
    pub fn register(&self, id: NodeId, node: Node) {
        self.inner.nodes.write().insert(id, node);
    }

    pub fn unregister(&self, id: NodeId) -> Option<Node> {
        self.inner.nodes.write().remove(&id)
    }

    /// 断开节点与所有其他节点的连接
    pub fn isolate(&self, id: NodeId) {
        trace!("MockNetwork: isolating node {}", id);
        self.inner.isolated.write().insert(id);
    }

    pub fn restore(&self, id: NodeId) {
        trace!("MockNetwork: restoring node {}", id);
        self.inner.isolated.write().remove(&id);
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.inner.isolated.read().contains(&id)
    }

    /// 动态更新网络配置
    pub fn set_config(&self, config: MockNetworkConfig) {
        *self.inner.config.write() = config;
    }

    /// 目前为止发起的 RPC 总数
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::Relaxed)
    }

    fn connected(&self, from: NodeId, target: NodeId) -> bool {
        let isolated = self.inner.isolated.read();
        !isolated.contains(&from) && !isolated.contains(&target)
    }

    fn plan(&self, from: NodeId, target: NodeId) -> Delivery {
        let config = self.inner.config.read().clone();
        let failure = Duration::from_millis(config.failure_delay_ms);
        if !self.connected(from, target) {
            return Delivery::Fail(failure);
        }
        let mut rng = self.inner.rng.lock();
        if config.drop_rate > 0.0 && rng.random::<f64>() < config.drop_rate {
            trace!("MockNetwork: dropping request from {} to {}", from, target);
            return Delivery::Fail(failure);
        }
        let jitter = if config.jitter_max_ms > 0 {
            rng.random_range(0..=config.jitter_max_ms)
        } else {
            0
        };
        Delivery::Deliver(Duration::from_millis(config.base_latency_ms + jitter))
    }

    fn drop_reply(&self) -> bool {
        let rate = self.inner.config.read().reply_drop_rate;
        rate > 0.0 && self.inner.rng.lock().random::<f64>() < rate
    }

    /// 模拟一次往返：延迟、丢包、隔离都在这里决定，处理函数在目标节点上执行
    async fn round_trip<T, F, Fut>(&self, from: NodeId, target: NodeId, handler: F) -> RpcResult<T>
    where
        F: FnOnce(Node) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        self.inner.rpc_count.fetch_add(1, Ordering::Relaxed);

        let latency = match self.plan(from, target) {
            Delivery::Deliver(latency) => latency,
            Delivery::Fail(delay) => {
                tokio::time::sleep(delay).await;
                return Err(RpcError::Timeout);
            }
        };
        tokio::time::sleep(latency).await;

        // 延迟期间网络可能已经变化
        if !self.connected(from, target) {
            return Err(RpcError::Network(format!("{} unreachable from {}", target, from)));
        }
        let node = self.inner.nodes.read().get(&target).cloned();
        let Some(node) = node else {
            return Err(RpcError::NodeNotFound(target));
        };

        let reply = handler(node).await?;

        if !self.connected(from, target) || self.drop_reply() {
            trace!("MockNetwork: dropping reply from {} to {}", target, from);
            let delay = Duration::from_millis(self.inner.config.read().failure_delay_ms);
            tokio::time::sleep(delay).await;
            return Err(RpcError::Timeout);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Network for MockNetworkHub {
    async fn request_vote(
        &self,
        from: NodeId,
        target: NodeId,
        args: RequestVoteRequest,
    ) -> RpcResult<RequestVoteResponse> {
        self.round_trip(from, target, |node| async move {
            node.handle_request_vote(args)
                .await
                .map_err(|e| RpcError::Remote(e.to_string()))
        })
        .await
    }

    async fn append_entries(
        &self,
        from: NodeId,
        target: NodeId,
        args: AppendEntriesRequest,
    ) -> RpcResult<AppendEntriesResponse> {
        self.round_trip(from, target, |node| async move {
            node.handle_append_entries(args)
                .await
                .map_err(|e| RpcError::Remote(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote_request() -> RequestVoteRequest {
        RequestVoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_target_is_an_error() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        let result = hub.request_vote(1, 2, vote_request()).await;
        assert_eq!(result, Err(RpcError::NodeNotFound(2)));
        assert_eq!(hub.rpc_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_sender_times_out() {
        let hub = MockNetworkHub::new(MockNetworkConfig::default());
        hub.isolate(1);
        assert!(hub.is_isolated(1));
        let result = hub.request_vote(1, 2, vote_request()).await;
        assert_eq!(result, Err(RpcError::Timeout));

        hub.restore(1);
        assert!(!hub.is_isolated(1));
        let result = hub.request_vote(1, 2, vote_request()).await;
        assert_eq!(result, Err(RpcError::NodeNotFound(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_drop_rate_fails_every_call() {
        let hub = MockNetworkHub::new(MockNetworkConfig {
            drop_rate: 1.0,
            ..Default::default()
        });
        for _ in 0..5 {
            assert_eq!(
                hub.request_vote(1, 2, vote_request()).await,
                Err(RpcError::Timeout)
            );
        }
        assert_eq!(hub.rpc_count(), 5);
    }
}
