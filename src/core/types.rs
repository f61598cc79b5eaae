use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 文件唯一标识，在加入队列时生成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 批次标识，`reset()` 时重新生成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单个文件的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// 等待中（在队列中）
    Pending,
    /// 校验中，仅在加入队列时同步出现
    Validating,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal moves of the per-file state machine.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;

        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Pending)
                | (Validating, Failed)
                | (Pending, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Uploading, Paused)
                | (Paused, Uploading)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// 批次整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Idle,
    Uploading,
    Paused,
    Completed,
    /// 调度器本身不会进入该状态，留给调用方解释
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 分块描述信息，仅作记录，不驱动分块重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub index: u32,
    pub byte_start: u64,
    pub byte_end: u64,
    pub uploaded: bool,
}

impl ChunkInfo {
    /// Splits `size` bytes into `[start, end)` ranges of at most `chunk_size` bytes.
    pub fn plan(size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
        if size == 0 || chunk_size == 0 {
            return Vec::new();
        }

        (0..size.div_ceil(chunk_size))
            .map(|index| {
                let byte_start = index * chunk_size;
                ChunkInfo {
                    index: index as u32,
                    byte_start,
                    byte_end: (byte_start + chunk_size).min(size),
                    uploaded: false,
                }
            })
            .collect()
    }
}

/// 调用方提交的文件
#[derive(Debug, Clone)]
pub struct FileInput {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileInput {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// 单个文件的生命周期记录
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFile {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub status: FileStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkInfo>>,
    /// 文件内容只保存在内存中，不参与持久化
    #[serde(skip)]
    pub(crate) data: Option<Bytes>,
}

impl UploadFile {
    pub(crate) fn from_input(input: FileInput) -> Self {
        Self {
            id: FileId::new(),
            size: input.size(),
            name: input.name,
            mime_type: input.mime_type,
            status: FileStatus::Pending,
            progress: 0,
            error: None,
            uploaded_at: None,
            retry_count: 0,
            chunks: None,
            data: Some(input.data),
        }
    }

    /// Whether the in-memory payload is present. Rehydrated records have none.
    pub fn has_payload(&self) -> bool {
        self.data.is_some()
    }

    pub(crate) fn transport_file(&self) -> Option<TransportFile> {
        self.data.as_ref().map(|data| TransportFile {
            id: self.id,
            name: self.name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
            data: data.clone(),
        })
    }
}

/// 交给传输函数的文件视图
#[derive(Debug, Clone)]
pub struct TransportFile {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub data: Bytes,
}

/// 批次聚合状态，文件按插入顺序保存
#[derive(Debug, Clone)]
pub struct BatchState {
    pub id: BatchId,
    pub files: IndexMap<FileId, UploadFile>,
    pub status: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub uploaded_size: u64,
}

impl Default for BatchState {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchState {
    pub fn new() -> Self {
        Self {
            id: BatchId::new(),
            files: IndexMap::new(),
            status: BatchStatus::Idle,
            started_at: None,
            completed_at: None,
            total_size: 0,
            uploaded_size: 0,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.files.values().any(|file| file.status == FileStatus::Failed)
    }

    pub fn all_terminal(&self) -> bool {
        self.files.values().all(|file| file.status.is_terminal())
    }

    /// 按字节加权的实时总进度（0-100）
    pub fn overall_progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }

        let weighted: f64 = self.files
            .values()
            .map(|file| file.progress as f64 / 100.0 * file.size as f64)
            .sum();

        weighted / self.total_size as f64 * 100.0
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            id: self.id,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            total_size: self.total_size,
            uploaded_size: self.uploaded_size,
            files: self.files.values().cloned().collect(),
        }
    }
}

/// 批次快照，同时也是持久化格式
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_size: u64,
    pub uploaded_size: u64,
    pub files: Vec<UploadFile>,
}

impl BatchSnapshot {
    pub fn file(&self, id: FileId) -> Option<&UploadFile> {
        self.files.iter().find(|file| file.id == id)
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|file| file.status == status).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    FileAdded,
    FileRemoved,
    UploadStart,
    UploadProgress,
    UploadComplete,
    UploadError,
    UploadPaused,
    UploadResumed,
    UploadCancelled,
    BatchComplete,
    ValidationError,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventData {
    File {
        name: String,
        size: u64,
    },
    Progress {
        progress: u8,
    },
    Error {
        message: String,
    },
    Validation {
        errors: Vec<String>,
    },
    Batch {
        #[serde(rename = "batchId")]
        batch_id: BatchId,
        status: BatchStatus,
        #[serde(rename = "totalSize")]
        total_size: u64,
        #[serde(rename = "uploadedSize")]
        uploaded_size: u64,
    },
}

/// 推送给订阅者的事件
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
    pub timestamp: DateTime<Utc>,
}

impl UploadEvent {
    pub fn new(kind: EventKind, file_id: Option<FileId>, data: Option<EventData>) -> Self {
        Self {
            kind,
            file_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

// 静态断言确保类型是 Send 的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadFile>();
        assert_send::<UploadEvent>();
        assert_send::<BatchSnapshot>();
    }
};
