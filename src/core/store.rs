use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use super::errors::{Result, UploadError};
use super::types::{BatchSnapshot, BatchStatus, FileStatus};

/// 批次状态在存储中的固定键
pub const STATE_KEY: &str = "upload-batch";

/// 存储适配器 - 以不透明字节保存和恢复批次状态
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取键对应的数据，不存在时返回 None
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 覆盖写入键对应的数据
    async fn save(&self, key: &str, data: &[u8]) -> Result<()>;
}

/// 内存存储，进程退出即丢失
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries
            .lock()
            .map_err(|_| UploadError::store("memory store poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut entries = self.entries
            .lock()
            .map_err(|_| UploadError::store("memory store poisoned"))?;
        entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// 文件存储，每个键对应目录下的一个 `<key>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // 先写临时文件再重命名，避免写到一半的状态文件
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

pub(crate) fn encode(snapshot: &BatchSnapshot) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(snapshot)?)
}

/// Decodes a persisted batch and rehydrates it for a fresh process.
///
/// Transfers cannot survive a restart, so `uploading` records come back as `paused`,
/// and the size aggregates are recomputed from the records themselves.
pub(crate) fn decode(data: &[u8]) -> Result<BatchSnapshot> {
    let mut snapshot: BatchSnapshot = serde_json::from_slice(data)?;

    for file in snapshot.files.iter_mut() {
        match file.status {
            FileStatus::Uploading => file.status = FileStatus::Paused,
            FileStatus::Validating => file.status = FileStatus::Pending,
            _ => {}
        }

        if file.status == FileStatus::Completed {
            file.progress = 100;
        } else {
            file.progress = file.progress.min(99);
            file.uploaded_at = None;
        }
    }

    if snapshot.status == BatchStatus::Uploading {
        snapshot.status = BatchStatus::Paused;
    }

    snapshot.total_size = snapshot.files.iter().map(|file| file.size).sum();
    snapshot.uploaded_size = snapshot.files
        .iter()
        .filter(|file| file.status == FileStatus::Completed)
        .map(|file| file.size)
        .sum();

    Ok(snapshot)
}
