use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::message::{HardState, LogEntry, PersistentState};
use crate::traits::{Storage, StorageResult};

pub struct MemStorageInner {
    image: Mutex<Option<Vec<u8>>>, // 最近一次保存的编码镜像
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

/// 内存存储实现（用于测试和单机场景）
///
/// 每次 `save` 都把 HardState 与完整日志编码成一个镜像替换旧值，
/// 克隆出来的句柄共享同一份镜像，可以在节点重启后交给新节点继续使用。
#[derive(Clone)]
pub struct MemStorage {
    inner: Arc<MemStorageInner>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemStorageInner {
                image: Mutex::new(None),
                saves: AtomicU64::new(0),
                fail_saves: AtomicBool::new(false),
            }),
        }
    }

    /// 独立副本：复制当前镜像，之后互不影响
    pub fn fork(&self) -> Self {
        let image = self.image.lock().clone();
        let forked = Self::new();
        *forked.image.lock() = image;
        forked
    }

    /// 当前镜像的字节数
    pub fn raft_state_size(&self) -> usize {
        self.image.lock().as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// 让后续 save 全部失败（测试持久化失败路径）
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// 解码当前镜像，不经过 Storage trait
    pub fn snapshot_state(&self) -> StorageResult<Option<PersistentState>> {
        match self.image.lock().as_deref() {
            Some(data) => PersistentState::decode(data).map(Some),
            None => Ok(None),
        }
    }
}

impl Deref for MemStorage {
    type Target = MemStorageInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn save(&self, hard_state: &HardState, log: &[LogEntry]) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::Relaxed) {
            warn!("MemStorage rejecting save (term {})", hard_state.term);
            return Err(StorageError::Unavailable("saves disabled".to_string()));
        }
        let data = PersistentState::encode(hard_state, log)?;
        debug!(
            "MemStorage saving term {} voted_for {:?} with {} entries ({} bytes)",
            hard_state.term,
            hard_state.voted_for,
            log.len(),
            data.len()
        );
        *self.image.lock() = Some(data);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self) -> StorageResult<Option<PersistentState>> {
        self.snapshot_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: format!("cmd{}", index).into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_empty_storage_loads_nothing() {
        let storage = MemStorage::new();
        assert!(storage.load().await.unwrap().is_none());
        assert_eq!(storage.raft_state_size(), 0);
        assert_eq!(storage.save_count(), 0);
    }

    #[tokio::test]
    async fn test_save_replaces_image() {
        let storage = MemStorage::new();
        let hs = HardState {
            term: 2,
            voted_for: Some(3),
        };
        storage.save(&hs, &[entry(1, 1), entry(2, 2)]).await.unwrap();
        let first_size = storage.raft_state_size();
        assert!(first_size > 0);

        let hs = HardState {
            term: 3,
            voted_for: None,
        };
        storage.save(&hs, &[entry(1, 1)]).await.unwrap();

        let state = storage.load().await.unwrap().unwrap();
        assert_eq!(state.hard_state, hs);
        assert_eq!(state.log, vec![entry(1, 1)]);
        assert_eq!(storage.save_count(), 2);
        assert!(storage.raft_state_size() < first_size);
    }

    #[tokio::test]
    async fn test_clones_share_and_forks_diverge() {
        let storage = MemStorage::new();
        let shared = storage.clone();
        storage
            .save(&HardState { term: 1, voted_for: Some(1) }, &[entry(1, 1)])
            .await
            .unwrap();

        let forked = storage.fork();
        assert_eq!(shared.load().await.unwrap(), forked.load().await.unwrap());

        storage
            .save(&HardState { term: 5, voted_for: None }, &[])
            .await
            .unwrap();
        assert_eq!(shared.load().await.unwrap().unwrap().hard_state.term, 5);
        assert_eq!(forked.load().await.unwrap().unwrap().hard_state.term, 1);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_image() {
        let storage = MemStorage::new();
        storage
            .save(&HardState { term: 1, voted_for: None }, &[])
            .await
            .unwrap();

        storage.set_fail_saves(true);
        let result = storage
            .save(&HardState { term: 9, voted_for: None }, &[])
            .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(storage.load().await.unwrap().unwrap().hard_state.term, 1);
    }

    #[tokio::test]
    async fn test_garbage_image_fails_to_decode() {
        let storage = MemStorage::new();
        *storage.image.lock() = Some(vec![0xff; 3]);
        assert!(matches!(storage.load().await, Err(StorageError::Decode(_))));
    }
}
