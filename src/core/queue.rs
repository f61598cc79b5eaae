use std::sync::Arc;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::broadcast;
use crate::config::UploadConfig;
use super::errors::{Result, UploadError};
use super::store::{self, StateStore, STATE_KEY};
use super::types::{
    BatchSnapshot,
    BatchState,
    BatchStatus,
    ChunkInfo,
    EventData,
    EventKind,
    FileId,
    FileInput,
    FileStatus,
    UploadEvent,
    UploadFile,
};
use super::validation::{self, ValidationResult};

/// 上传队列 - 持有批次内所有文件、状态机和持久化
///
/// 只由调度器在自己的事件循环里修改，不需要加锁。
pub struct UploadQueue {
    config: UploadConfig,
    state: BatchState,
    store: Arc<dyn StateStore>,
    event_tx: broadcast::Sender<UploadEvent>,
}

impl UploadQueue {
    pub fn new(
        config: UploadConfig,
        store: Arc<dyn StateStore>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) -> Self {
        Self {
            config,
            state: BatchState::new(),
            store,
            event_tx,
        }
    }

    /// 从存储中恢复上一次的批次
    pub async fn restore(&mut self) -> Result<bool> {
        let Some(data) = self.store.load(STATE_KEY).await? else {
            return Ok(false);
        };

        let snapshot = store::decode(&data)?;
        tracing::info!(
            batch_id = %snapshot.id,
            files = snapshot.files.len(),
            status = %snapshot.status,
            "restored upload batch"
        );

        self.state = BatchState {
            id: snapshot.id,
            files: snapshot.files.into_iter().map(|file| (file.id, file)).collect(),
            status: snapshot.status,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
            total_size: snapshot.total_size,
            uploaded_size: snapshot.uploaded_size,
        };

        Ok(true)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn status(&self) -> BatchStatus {
        self.state.status
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        self.state.snapshot()
    }

    pub fn get(&self, id: &FileId) -> Option<&UploadFile> {
        self.state.files.get(id)
    }

    /// Ids of every file in `status`, in insertion order.
    pub fn ids_with_status(&self, status: FileStatus) -> Vec<FileId> {
        self.state.files
            .values()
            .filter(|file| file.status == status)
            .map(|file| file.id)
            .collect()
    }

    pub fn validate(&self, input: &FileInput) -> ValidationResult {
        validation::validate(&self.config, input.size(), &input.mime_type)
    }

    /// 批量加入文件，校验失败的文件记为 failed 而不是丢弃
    pub async fn add_files(&mut self, inputs: Vec<FileInput>) -> Vec<UploadFile> {
        let mut added = Vec::with_capacity(inputs.len());

        for input in inputs {
            let validation = self.config.validate_before_upload.then(|| self.validate(&input));

            let mut file = UploadFile::from_input(input);
            file.status = FileStatus::Validating;
            if self.config.enable_chunking {
                file.chunks = Some(ChunkInfo::plan(file.size, self.config.chunk_size));
            }

            let rejected = match validation {
                Some(result) if !result.valid => {
                    file.status = FileStatus::Failed;
                    file.error = Some(result.joined());
                    Some(result.errors)
                }
                _ => {
                    file.status = FileStatus::Pending;
                    None
                }
            };

            let id = file.id;
            self.state.total_size += file.size;
            self.emit(EventKind::FileAdded, Some(id), Some(EventData::File {
                name: file.name.clone(),
                size: file.size,
            }));

            if let Some(errors) = rejected {
                tracing::debug!(file_id = %id, name = %file.name, "file rejected by validation");
                self.emit(EventKind::ValidationError, Some(id), Some(EventData::Validation { errors }));
            }

            self.state.files.insert(id, file.clone());
            added.push(file);
        }

        self.persist().await;
        added
    }

    /// 删除记录并回滚大小统计，调用前需先取消进行中的会话
    pub async fn remove_file(&mut self, id: FileId) -> Result<UploadFile> {
        let file = self.state.files
            .shift_remove(&id)
            .ok_or(UploadError::NotFound(id))?;

        self.forget_sizes(&file);
        self.emit(EventKind::FileRemoved, Some(id), None);
        self.persist().await;

        Ok(file)
    }

    /// 清除所有 completed/failed/cancelled 的文件，返回被清除的 id
    pub async fn clear_completed(&mut self) -> Vec<FileId> {
        let finished: Vec<FileId> = self.state.files
            .values()
            .filter(|file| file.status.is_terminal())
            .map(|file| file.id)
            .collect();

        for id in &finished {
            if let Some(file) = self.state.files.shift_remove(id) {
                self.forget_sizes(&file);
                self.emit(EventKind::FileRemoved, Some(*id), None);
            }
        }

        if !finished.is_empty() {
            self.persist().await;
        }

        finished
    }

    /// 丢弃所有记录并生成新的批次 id
    pub async fn reset(&mut self) {
        self.state = BatchState::new();
        self.persist().await;
    }

    /// 重新挂载文件内容（恢复后的记录没有内容）
    pub fn attach(&mut self, id: FileId, data: Bytes) -> Result<()> {
        let file = self.file_mut(id)?;

        if !matches!(file.status, FileStatus::Pending | FileStatus::Paused) {
            return Err(UploadError::InvalidTransition { id, action: "attach", status: file.status });
        }
        if data.len() as u64 != file.size {
            return Err(UploadError::Validation(vec![format!(
                "Payload is {} bytes but the record expects {}",
                data.len(),
                file.size
            )]));
        }

        file.data = Some(data);
        Ok(())
    }

    /// 上传前重新校验等待中的文件，未通过时记为 failed 并返回 false
    pub fn revalidate(&mut self, id: FileId) -> Result<bool> {
        let file = self.state.files.get(&id).ok_or(UploadError::NotFound(id))?;
        if !self.config.validate_before_upload || file.status != FileStatus::Pending {
            return Ok(true);
        }

        let result = validation::validate(&self.config, file.size, &file.mime_type);
        self.transition(id, FileStatus::Validating)?;
        if result.valid {
            self.transition(id, FileStatus::Pending)?;
            return Ok(true);
        }

        let file = self.transition(id, FileStatus::Failed)?;
        file.error = Some(result.joined());
        tracing::debug!(file_id = %id, name = %file.name, "file rejected by validation before upload");
        self.emit(EventKind::ValidationError, Some(id), Some(EventData::Validation { errors: result.errors }));

        Ok(false)
    }

    pub fn set_status(&mut self, status: BatchStatus) {
        self.state.status = status;
    }

    pub fn mark_started(&mut self) {
        self.state.status = BatchStatus::Uploading;
        self.state.started_at = Some(Utc::now());
        self.state.completed_at = None;
    }

    pub fn mark_batch_completed(&mut self) {
        self.state.status = BatchStatus::Completed;
        self.state.completed_at = Some(Utc::now());
    }

    pub fn mark_uploading(&mut self, id: FileId) -> Result<()> {
        self.transition(id, FileStatus::Uploading)?;
        Ok(())
    }

    /// 更新进度，保持单调不减且在完成前不超过 99，返回当前进度
    pub fn set_progress(&mut self, id: FileId, percent: u8) -> Option<u8> {
        let file = self.state.files.get_mut(&id)?;
        if file.status != FileStatus::Uploading {
            return None;
        }

        file.progress = file.progress.max(percent.min(99));
        Some(file.progress)
    }

    pub fn mark_completed(&mut self, id: FileId) -> Result<()> {
        let file = self.transition(id, FileStatus::Completed)?;
        file.progress = 100;
        file.error = None;
        file.uploaded_at = Some(Utc::now());
        if let Some(chunks) = file.chunks.as_mut() {
            chunks.iter_mut().for_each(|chunk| chunk.uploaded = true);
        }

        let size = file.size;
        self.state.uploaded_size += size;
        Ok(())
    }

    pub fn mark_failed(&mut self, id: FileId, error: String) -> Result<()> {
        let file = self.transition(id, FileStatus::Failed)?;
        file.error = Some(error);
        Ok(())
    }

    /// 暂停时保留进度和重试次数
    pub fn mark_paused(&mut self, id: FileId) -> Result<()> {
        self.transition(id, FileStatus::Paused)?;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, id: FileId) -> Result<()> {
        self.transition(id, FileStatus::Cancelled)?;
        Ok(())
    }

    /// failed -> pending，进度归零、清除错误、重试次数加一
    pub fn reset_failed(&mut self) -> Vec<FileId> {
        let mut reset = Vec::new();

        for file in self.state.files.values_mut() {
            if file.status == FileStatus::Failed {
                file.status = FileStatus::Pending;
                file.progress = 0;
                file.error = None;
                file.retry_count += 1;
                if let Some(chunks) = file.chunks.as_mut() {
                    chunks.iter_mut().for_each(|chunk| chunk.uploaded = false);
                }
                reset.push(file.id);
            }
        }

        reset
    }

    pub fn emit(&self, kind: EventKind, file_id: Option<FileId>, data: Option<EventData>) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.event_tx.send(UploadEvent::new(kind, file_id, data));
    }

    pub fn batch_data(&self) -> EventData {
        EventData::Batch {
            batch_id: self.state.id,
            status: self.state.status,
            total_size: self.state.total_size,
            uploaded_size: self.state.uploaded_size,
        }
    }

    /// 保存状态，失败只记录日志，内存状态仍然有效
    pub async fn persist(&self) {
        let result = match store::encode(&self.state.snapshot()) {
            Ok(data) => self.store.save(STATE_KEY, &data).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            tracing::warn!(batch_id = %self.state.id, error = %err, "failed to persist upload batch");
        }
    }

    fn file_mut(&mut self, id: FileId) -> Result<&mut UploadFile> {
        self.state.files.get_mut(&id).ok_or(UploadError::NotFound(id))
    }

    fn transition(&mut self, id: FileId, next: FileStatus) -> Result<&mut UploadFile> {
        let file = self.file_mut(id)?;
        if !file.status.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                id,
                action: transition_action(next),
                status: file.status,
            });
        }

        file.status = next;
        Ok(file)
    }

    fn forget_sizes(&mut self, file: &UploadFile) {
        self.state.total_size = self.state.total_size.saturating_sub(file.size);
        if file.status == FileStatus::Completed {
            self.state.uploaded_size = self.state.uploaded_size.saturating_sub(file.size);
        }
    }
}

fn transition_action(next: FileStatus) -> &'static str {
    match next {
        FileStatus::Pending => "requeue",
        FileStatus::Validating => "validate",
        FileStatus::Uploading => "upload",
        FileStatus::Paused => "pause",
        FileStatus::Completed => "complete",
        FileStatus::Failed => "fail",
        FileStatus::Cancelled => "cancel",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    fn queue_with(config: UploadConfig) -> (UploadQueue, MemoryStore, broadcast::Receiver<UploadEvent>) {
        let store = MemoryStore::new();
        let (event_tx, event_rx) = broadcast::channel(64);
        let queue = UploadQueue::new(config, Arc::new(store.clone()), event_tx);
        (queue, store, event_rx)
    }

    fn input(name: &str, size: usize) -> FileInput {
        FileInput::new(name, "application/octet-stream", vec![1u8; size])
    }

    #[tokio::test]
    async fn test_add_files_keeps_order_and_counts_sizes() {
        let (mut queue, store, mut events) = queue_with(UploadConfig::default());

        let added = queue.add_files(vec![input("a", 10), input("b", 20), input("c", 30)]).await;

        let names: Vec<_> = added.iter().map(|file| file.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(added.iter().all(|file| file.status == FileStatus::Pending));
        assert_eq!(queue.state().total_size, 60);
        assert_eq!(queue.state().uploaded_size, 0);
        assert!(store.get(STATE_KEY).is_some());

        for _ in 0..3 {
            assert_eq!(events.recv().await.unwrap().kind, EventKind::FileAdded);
        }
    }

    #[tokio::test]
    async fn test_oversized_file_is_recorded_as_failed() {
        let config = UploadConfig { max_file_size: 1000, ..Default::default() };
        let (mut queue, _store, mut events) = queue_with(config);

        let added = queue.add_files(vec![input("big", 2000)]).await;

        assert_eq!(added[0].status, FileStatus::Failed);
        assert!(added[0].error.as_deref().unwrap().contains("exceeds the maximum allowed size"));
        assert_eq!(queue.state().total_size, 2000);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::FileAdded);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ValidationError);
    }

    #[tokio::test]
    async fn test_validation_can_be_disabled() {
        let config = UploadConfig { max_file_size: 1, validate_before_upload: false, ..Default::default() };
        let (mut queue, _store, _events) = queue_with(config);

        let added = queue.add_files(vec![input("big", 10)]).await;
        assert_eq!(added[0].status, FileStatus::Pending);
    }

    #[tokio::test]
    async fn test_chunk_plan_recorded_when_enabled() {
        let config = UploadConfig { enable_chunking: true, chunk_size: 4, ..Default::default() };
        let (mut queue, _store, _events) = queue_with(config);

        let added = queue.add_files(vec![input("a", 10)]).await;
        assert_eq!(added[0].chunks.as_ref().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_remove_completed_file_reverses_sizes() {
        let (mut queue, _store, _events) = queue_with(UploadConfig::default());
        let added = queue.add_files(vec![input("a", 10), input("b", 20)]).await;
        let id = added[0].id;

        queue.mark_uploading(id).unwrap();
        queue.mark_completed(id).unwrap();
        assert_eq!(queue.state().uploaded_size, 10);

        queue.remove_file(id).await.unwrap();
        assert_eq!(queue.state().total_size, 20);
        assert_eq!(queue.state().uploaded_size, 0);
        assert!(matches!(queue.remove_file(id).await, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_completed_leaves_active_files() {
        let (mut queue, _store, _events) = queue_with(UploadConfig::default());
        let ids: Vec<_> = queue
            .add_files(vec![input("a", 1), input("b", 2), input("c", 3), input("d", 4)])
            .await
            .into_iter()
            .map(|file| file.id)
            .collect();

        queue.mark_uploading(ids[0]).unwrap();
        queue.mark_completed(ids[0]).unwrap();
        queue.mark_uploading(ids[1]).unwrap();
        queue.mark_failed(ids[1], "boom".into()).unwrap();
        queue.mark_uploading(ids[2]).unwrap();

        let cleared = queue.clear_completed().await;

        assert_eq!(cleared, vec![ids[0], ids[1]]);
        assert_eq!(queue.state().files.len(), 2);
        assert_eq!(queue.state().total_size, 7);
        assert_eq!(queue.state().uploaded_size, 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_capped_until_complete() {
        let (mut queue, _store, _events) = queue_with(UploadConfig::default());
        let id = queue.add_files(vec![input("a", 10)]).await[0].id;

        assert_eq!(queue.set_progress(id, 10), None);
        queue.mark_uploading(id).unwrap();
        assert_eq!(queue.set_progress(id, 40), Some(40));
        assert_eq!(queue.set_progress(id, 20), Some(40));
        assert_eq!(queue.set_progress(id, 100), Some(99));

        queue.mark_completed(id).unwrap();
        let file = queue.get(&id).unwrap();
        assert_eq!(file.progress, 100);
        assert!(file.uploaded_at.is_some());
    }

    #[tokio::test]
    async fn test_reset_failed_increments_retry_count() {
        let (mut queue, _store, _events) = queue_with(UploadConfig::default());
        let id = queue.add_files(vec![input("a", 10)]).await[0].id;
        queue.mark_uploading(id).unwrap();
        queue.set_progress(id, 60);
        queue.mark_failed(id, "network down".into()).unwrap();

        assert_eq!(queue.reset_failed(), vec![id]);

        let file = queue.get(&id).unwrap();
        assert_eq!(file.status, FileStatus::Pending);
        assert_eq!(file.progress, 0);
        assert_eq!(file.error, None);
        assert_eq!(file.retry_count, 1);
    }

    #[tokio::test]
    async fn test_revalidate_rejects_retried_oversized_file() {
        let config = UploadConfig { max_file_size: 1000, ..Default::default() };
        let (mut queue, _store, mut events) = queue_with(config);
        let added = queue.add_files(vec![input("big", 2000), input("ok", 10)]).await;
        let (big, ok) = (added[0].id, added[1].id);
        let admission_error = added[0].error.clone();
        while events.try_recv().is_ok() {}

        assert_eq!(queue.reset_failed(), vec![big]);
        assert_eq!(queue.get(&big).unwrap().status, FileStatus::Pending);

        assert!(!queue.revalidate(big).unwrap());
        let file = queue.get(&big).unwrap();
        assert_eq!(file.status, FileStatus::Failed);
        assert_eq!(file.error, admission_error);
        assert_eq!(file.retry_count, 1);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::ValidationError);

        assert!(queue.revalidate(ok).unwrap());
        assert_eq!(queue.get(&ok).unwrap().status, FileStatus::Pending);
        assert!(matches!(queue.revalidate(FileId::new()), Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_revalidate_skipped_when_validation_disabled() {
        let config = UploadConfig { max_file_size: 1, validate_before_upload: false, ..Default::default() };
        let (mut queue, _store, _events) = queue_with(config);
        let id = queue.add_files(vec![input("big", 10)]).await[0].id;

        assert!(queue.revalidate(id).unwrap());
        assert_eq!(queue.get(&id).unwrap().status, FileStatus::Pending);
    }

    #[tokio::test]
    async fn test_restore_reattach_and_reset() {
        let store = MemoryStore::new();
        let (event_tx, _) = broadcast::channel(16);
        let mut queue = UploadQueue::new(UploadConfig::default(), Arc::new(store.clone()), event_tx.clone());
        let id = queue.add_files(vec![input("a", 10)]).await[0].id;
        queue.mark_started();
        queue.mark_uploading(id).unwrap();
        queue.set_progress(id, 30);
        queue.persist().await;
        let old_batch = queue.state().id;

        let mut restored = UploadQueue::new(UploadConfig::default(), Arc::new(store), event_tx);
        assert!(restored.restore().await.unwrap());
        let file = restored.get(&id).unwrap();
        assert_eq!(file.status, FileStatus::Paused);
        assert_eq!(file.progress, 30);
        assert!(!file.has_payload());
        assert_eq!(restored.status(), BatchStatus::Paused);

        assert!(restored.attach(id, Bytes::from(vec![0u8; 3])).is_err());
        restored.attach(id, Bytes::from(vec![0u8; 10])).unwrap();
        assert!(restored.get(&id).unwrap().has_payload());

        restored.reset().await;
        assert!(restored.state().files.is_empty());
        assert_ne!(restored.state().id, old_batch);
        assert_eq!(restored.status(), BatchStatus::Idle);
    }
}
