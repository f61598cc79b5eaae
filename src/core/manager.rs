use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::config::UploadConfig;
use super::errors::{Result, UploadError};
use super::queue::UploadQueue;
use super::scheduler::{ManagerCommand, RunHandle, UploadScheduler};
use super::store::StateStore;
use super::traits::Transport;
use super::types::{BatchSnapshot, FileId, FileInput, UploadEvent, UploadFile};
use super::validation::{self, ValidationResult};

/// 上传管理器 - 可克隆的句柄，所有操作都以命令的形式交给调度器
#[derive(Clone)]
pub struct UploadManager {
    config: Arc<UploadConfig>,
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// 上传管理器句柄 - 包含管理器和调度器任务
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    /// Drops this handle's manager and waits for the scheduler to exit.
    ///
    /// The scheduler only stops once every clone of the manager is gone.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.manager);
        self.worker_handle.await
            .map_err(|err| UploadError::internal(format!("Worker panic: {}", err)))
    }
}

impl UploadManager {
    /// 创建管理器并启动调度器，会先从 `store` 恢复上一次的批次
    pub fn new(config: UploadConfig, store: Arc<dyn StateStore>) -> UploadManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let queue = UploadQueue::new(config.clone(), store, event_tx.clone());
        let worker_handle = tokio::spawn(UploadScheduler::new(queue).run(command_rx));

        let manager = Self {
            config: Arc::new(config),
            command_tx,
            event_tx,
        };

        UploadManagerHandle {
            manager,
            worker_handle,
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::ManagerShutdown)?;

        // 等待响应
        reply_rx.await.map_err(|_| UploadError::ManagerShutdown)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 按当前配置校验文件，不修改队列
    pub fn validate(&self, file: &FileInput) -> ValidationResult {
        validation::validate(&self.config, file.size(), &file.mime_type)
    }

    /// Add files, returning the created records in input order
    pub async fn add_files(&self, files: Vec<FileInput>) -> Result<Vec<UploadFile>> {
        self.call(|reply| ManagerCommand::AddFiles { files, reply }).await
    }

    /// Remove a file, cancelling its session first if it is uploading
    pub async fn remove_file(&self, id: FileId) -> Result<UploadFile> {
        self.call(|reply| ManagerCommand::RemoveFile { id, reply }).await?
    }

    /// 清除已结束的文件
    pub async fn clear_completed(&self) -> Result<Vec<FileId>> {
        self.call(|reply| ManagerCommand::ClearCompleted { reply }).await
    }

    /// 取消所有会话、清空记录并生成新的批次 id
    pub async fn reset(&self) -> Result<()> {
        self.call(|reply| ManagerCommand::Reset { reply }).await
    }

    /// Re-attach the payload of a record restored from the store
    pub async fn attach_file(&self, id: FileId, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.call(|reply| ManagerCommand::AttachFile { id, data, reply }).await?
    }

    /// 开始上传所有 pending/paused 的文件，批次已在上传中时不做任何事
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<RunHandle> {
        self.call(|reply| ManagerCommand::Start { transport, reply }).await
    }

    /// Pause the batch: in-flight sessions are cancelled and their files land in `paused`
    pub async fn pause(&self) -> Result<()> {
        self.call(|reply| ManagerCommand::Pause { reply }).await?
    }

    /// Resume a paused batch
    pub async fn resume(&self, transport: Arc<dyn Transport>) -> Result<RunHandle> {
        self.call(|reply| ManagerCommand::Resume { transport, reply }).await?
    }

    /// Cancel upload
    pub async fn cancel_upload(&self, id: FileId) -> Result<()> {
        self.call(|reply| ManagerCommand::CancelUpload { id, reply }).await?
    }

    /// 取消所有未结束的文件，批次回到 idle
    pub async fn cancel_all(&self) -> Result<()> {
        self.call(|reply| ManagerCommand::CancelAll { reply }).await
    }

    /// failed 的文件重新排队并启动
    pub async fn retry_failed(&self, transport: Arc<dyn Transport>) -> Result<RunHandle> {
        self.call(|reply| ManagerCommand::RetryFailed { transport, reply }).await
    }

    /// Get file
    pub async fn get_file(&self, id: FileId) -> Result<Option<UploadFile>> {
        self.call(|reply| ManagerCommand::GetFile { id, reply }).await
    }

    /// Get all files in insertion order
    pub async fn get_files(&self) -> Result<Vec<UploadFile>> {
        Ok(self.batch().await?.files)
    }

    pub async fn batch(&self) -> Result<BatchSnapshot> {
        self.call(|reply| ManagerCommand::GetBatch { reply }).await
    }

    /// 按字节加权的实时总进度（0-100）
    pub async fn overall_progress(&self) -> Result<f64> {
        self.call(|reply| ManagerCommand::OverallProgress { reply }).await
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F>
    where
        F: Fn(&UploadEvent) -> bool,
    {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
