use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use super::errors::{Result, TransportError, UploadError};
use super::queue::UploadQueue;
use super::traits::{ProgressReporter, Transport};
use super::types::{
    BatchSnapshot,
    BatchStatus,
    EventData,
    EventKind,
    FileId,
    FileInput,
    FileStatus,
    UploadFile,
};

/// 上传管理器命令
pub(crate) enum ManagerCommand {
    /// 批量添加
    AddFiles {
        files: Vec<FileInput>,
        reply: oneshot::Sender<Vec<UploadFile>>,
    },

    /// 删除单个文件
    RemoveFile {
        id: FileId,
        reply: oneshot::Sender<Result<UploadFile>>,
    },

    /// 清除所有 <Completed/Failed/Cancelled> 状态的文件
    ClearCompleted {
        reply: oneshot::Sender<Vec<FileId>>,
    },

    /// 重置整个批次
    Reset {
        reply: oneshot::Sender<()>,
    },

    /// 重新挂载文件内容
    AttachFile {
        id: FileId,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },

    Start {
        transport: Arc<dyn Transport>,
        reply: oneshot::Sender<RunHandle>,
    },

    Pause {
        reply: oneshot::Sender<Result<()>>,
    },

    Resume {
        transport: Arc<dyn Transport>,
        reply: oneshot::Sender<Result<RunHandle>>,
    },

    CancelUpload {
        id: FileId,
        reply: oneshot::Sender<Result<()>>,
    },

    CancelAll {
        reply: oneshot::Sender<()>,
    },

    RetryFailed {
        transport: Arc<dyn Transport>,
        reply: oneshot::Sender<RunHandle>,
    },

    /// 获取文件信息
    GetFile {
        id: FileId,
        reply: oneshot::Sender<Option<UploadFile>>,
    },

    /// 获取批次快照
    GetBatch {
        reply: oneshot::Sender<BatchSnapshot>,
    },

    OverallProgress {
        reply: oneshot::Sender<f64>,
    },
}

/// 会话发回调度器的消息，带会话序号以丢弃已暂停/取消会话的迟到消息
pub(crate) enum SessionMessage {
    Progress {
        id: FileId,
        session: u64,
        percent: u8,
    },

    Finished {
        id: FileId,
        session: u64,
        result: std::result::Result<(), TransportError>,
    },
}

/// 一次运行的句柄，`wait` 返回运行结束时的批次状态
#[derive(Debug)]
pub struct RunHandle {
    done_rx: oneshot::Receiver<BatchStatus>,
}

impl RunHandle {
    /// Resolves with `completed`, `paused`, or `idle` once the run stops.
    pub async fn wait(self) -> Result<BatchStatus> {
        self.done_rx.await.map_err(|_| UploadError::ManagerShutdown)
    }
}

struct ActiveSession {
    session: u64,
    token: CancellationToken,
}

/// 调度器 - 上传队列的唯一持有者
///
/// 命令、进度和会话结果都在同一个事件循环里处理；并发上限由信号量保证，
/// 每个会话任务持有一个许可，直到传输真正返回。
pub struct UploadScheduler {
    queue: UploadQueue,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    transport: Option<Arc<dyn Transport>>,
    work_list: VecDeque<FileId>,
    active: HashMap<FileId, ActiveSession>,
    next_session: u64,
    run_waiters: Vec<oneshot::Sender<BatchStatus>>,
    session_tx: mpsc::UnboundedSender<SessionMessage>,
    session_rx: mpsc::UnboundedReceiver<SessionMessage>,
}

impl UploadScheduler {
    pub(crate) fn new(queue: UploadQueue) -> Self {
        let max_concurrent = queue.config().concurrency();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        Self {
            queue,
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            transport: None,
            work_list: VecDeque::new(),
            active: HashMap::new(),
            next_session: 0,
            run_waiters: Vec::new(),
            session_tx,
            session_rx,
        }
    }

    pub(crate) async fn run(mut self, mut command_rx: mpsc::Receiver<ManagerCommand>) {
        // 恢复之前的状态
        if let Err(err) = self.queue.restore().await {
            tracing::warn!(error = %err, "failed to restore upload batch, starting empty");
        }

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = self.session_rx.recv() => {
                    self.handle_session_message(message).await;
                }
            }
        }

        for (_, active) in self.active.drain() {
            active.token.cancel();
        }
        self.queue.persist().await;
        tracing::debug!("upload scheduler stopped");
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::AddFiles { files, reply } => {
                let added = self.queue.add_files(files).await;
                let _ = reply.send(added);
            }
            ManagerCommand::RemoveFile { id, reply } => {
                let result = self.remove_file(id).await;
                let _ = reply.send(result);
            }
            ManagerCommand::ClearCompleted { reply } => {
                let cleared = self.queue.clear_completed().await;
                let _ = reply.send(cleared);
            }
            ManagerCommand::Reset { reply } => {
                self.reset().await;
                let _ = reply.send(());
            }
            ManagerCommand::AttachFile { id, data, reply } => {
                let _ = reply.send(self.queue.attach(id, data));
            }
            ManagerCommand::Start { transport, reply } => {
                let handle = self.start(transport).await;
                let _ = reply.send(handle);
            }
            ManagerCommand::Pause { reply } => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            ManagerCommand::Resume { transport, reply } => {
                let result = self.resume(transport).await;
                let _ = reply.send(result);
            }
            ManagerCommand::CancelUpload { id, reply } => {
                let result = self.cancel_upload(id).await;
                let _ = reply.send(result);
            }
            ManagerCommand::CancelAll { reply } => {
                self.cancel_all().await;
                let _ = reply.send(());
            }
            ManagerCommand::RetryFailed { transport, reply } => {
                let handle = self.retry_failed(transport).await;
                let _ = reply.send(handle);
            }
            ManagerCommand::GetFile { id, reply } => {
                let _ = reply.send(self.queue.get(&id).cloned());
            }
            ManagerCommand::GetBatch { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            ManagerCommand::OverallProgress { reply } => {
                let _ = reply.send(self.queue.state().overall_progress());
            }
        }
    }

    async fn start(&mut self, transport: Arc<dyn Transport>) -> RunHandle {
        let handle = self.run_handle();

        // 已经在上传中，不重复启动
        if self.queue.status() == BatchStatus::Uploading {
            return handle;
        }

        self.transport = Some(transport);
        self.queue.mark_started();
        self.queue.emit(EventKind::UploadStart, None, Some(self.queue.batch_data()));
        tracing::info!(batch_id = %self.queue.state().id, "upload batch started");

        self.work_list = self.queue.state().files
            .values()
            .filter(|file| matches!(file.status, FileStatus::Pending | FileStatus::Paused))
            .map(|file| file.id)
            .collect();

        self.queue.persist().await;
        self.fill_slots().await;
        self.check_drained().await;

        handle
    }

    async fn pause(&mut self) -> Result<()> {
        let status = self.queue.status();
        if status != BatchStatus::Uploading {
            return Err(UploadError::InvalidState { action: "pause", status });
        }

        self.queue.set_status(BatchStatus::Paused);
        for (id, active) in self.active.drain() {
            active.token.cancel();
            if let Err(err) = self.queue.mark_paused(id) {
                tracing::warn!(file_id = %id, error = %err, "failed to pause session");
            }
        }
        self.work_list.clear();

        self.queue.emit(EventKind::UploadPaused, None, Some(self.queue.batch_data()));
        self.queue.persist().await;
        tracing::info!(batch_id = %self.queue.state().id, "upload batch paused");
        self.finish_run(BatchStatus::Paused);

        Ok(())
    }

    async fn resume(&mut self, transport: Arc<dyn Transport>) -> Result<RunHandle> {
        let status = self.queue.status();
        if status != BatchStatus::Paused {
            return Err(UploadError::InvalidState { action: "resume", status });
        }

        let handle = self.run_handle();
        self.transport = Some(transport);
        self.queue.set_status(BatchStatus::Uploading);
        self.queue.emit(EventKind::UploadResumed, None, Some(self.queue.batch_data()));
        tracing::info!(batch_id = %self.queue.state().id, "upload batch resumed");

        // 先恢复暂停的文件，再处理还没开始的文件
        let mut work_list = self.queue.ids_with_status(FileStatus::Paused);
        work_list.extend(self.queue.ids_with_status(FileStatus::Pending));
        self.work_list = work_list.into();

        self.queue.persist().await;
        self.fill_slots().await;
        self.check_drained().await;

        Ok(handle)
    }

    async fn cancel_upload(&mut self, id: FileId) -> Result<()> {
        let status = self.queue
            .get(&id)
            .map(|file| file.status)
            .ok_or(UploadError::NotFound(id))?;

        if status.is_terminal() {
            return Err(UploadError::InvalidTransition { id, action: "cancel", status });
        }

        if let Some(active) = self.active.remove(&id) {
            active.token.cancel();
        }
        self.work_list.retain(|queued| *queued != id);
        self.queue.mark_cancelled(id)?;
        self.queue.emit(EventKind::UploadCancelled, Some(id), None);
        tracing::debug!(file_id = %id, "upload cancelled");

        self.queue.persist().await;
        self.fill_slots().await;
        self.check_drained().await;

        Ok(())
    }

    async fn cancel_all(&mut self) {
        for (_, active) in self.active.drain() {
            active.token.cancel();
        }
        self.work_list.clear();

        let targets: Vec<FileId> = self.queue.state().files
            .values()
            .filter(|file| !file.status.is_terminal())
            .map(|file| file.id)
            .collect();

        for id in targets {
            match self.queue.mark_cancelled(id) {
                Ok(()) => self.queue.emit(EventKind::UploadCancelled, Some(id), None),
                Err(err) => tracing::warn!(file_id = %id, error = %err, "failed to cancel file"),
            }
        }

        self.queue.set_status(BatchStatus::Idle);
        self.queue.persist().await;
        tracing::info!(batch_id = %self.queue.state().id, "all uploads cancelled");
        self.finish_run(BatchStatus::Idle);
    }

    async fn retry_failed(&mut self, transport: Arc<dyn Transport>) -> RunHandle {
        let reset = self.queue.reset_failed();
        tracing::info!(files = reset.len(), "retrying failed uploads");

        if self.queue.status() != BatchStatus::Uploading {
            return self.start(transport).await;
        }

        // 运行中直接追加到工作列表
        let handle = self.run_handle();
        self.work_list.extend(reset);
        self.queue.persist().await;
        self.fill_slots().await;

        handle
    }

    async fn remove_file(&mut self, id: FileId) -> Result<UploadFile> {
        if let Some(active) = self.active.remove(&id) {
            active.token.cancel();
        }
        self.work_list.retain(|queued| *queued != id);

        let removed = self.queue.remove_file(id).await?;
        self.fill_slots().await;
        self.check_drained().await;

        Ok(removed)
    }

    async fn reset(&mut self) {
        for (_, active) in self.active.drain() {
            active.token.cancel();
        }
        self.work_list.clear();
        self.transport = None;

        self.queue.reset().await;
        tracing::info!(batch_id = %self.queue.state().id, "upload batch reset");
        self.finish_run(BatchStatus::Idle);
    }

    /// 在并发上限内从工作列表中取出文件启动会话
    async fn fill_slots(&mut self) {
        let mut changed = false;

        while self.queue.status() == BatchStatus::Uploading && self.active.len() < self.max_concurrent {
            let Some(&id) = self.work_list.front() else {
                break;
            };

            let runnable = self.queue.get(&id).is_some_and(|file| {
                matches!(file.status, FileStatus::Pending | FileStatus::Paused) && file.has_payload()
            });
            if !runnable {
                // 已删除、已取消或没有内容的文件直接跳过
                self.work_list.pop_front();
                continue;
            }

            // 重试放回来的文件可能本来就没通过校验
            if !self.queue.revalidate(id).unwrap_or(false) {
                self.work_list.pop_front();
                changed = true;
                continue;
            }

            // 被取消但传输还没返回的会话仍占着许可
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            self.work_list.pop_front();
            changed |= self.launch(id, permit);
        }

        if changed {
            self.queue.persist().await;
        }
    }

    fn launch(&mut self, id: FileId, permit: OwnedSemaphorePermit) -> bool {
        let Some(transport) = self.transport.clone() else {
            return false;
        };
        let Some(file) = self.queue.get(&id).and_then(UploadFile::transport_file) else {
            return false;
        };
        if let Err(err) = self.queue.mark_uploading(id) {
            tracing::warn!(file_id = %id, error = %err, "cannot start upload");
            return false;
        }

        self.next_session += 1;
        let session = self.next_session;
        let token = CancellationToken::new();
        self.active.insert(id, ActiveSession { session, token: token.clone() });
        self.queue.emit(EventKind::UploadStart, Some(id), None);
        tracing::debug!(file_id = %id, session, name = %file.name, "upload session started");

        let progress_tx = self.session_tx.clone();
        let reporter = ProgressReporter::new(move |percent| {
            let _ = progress_tx.send(SessionMessage::Progress { id, session, percent });
        });

        let session_tx = self.session_tx.clone();
        tokio::spawn(async move {
            let result = transport.upload(file, reporter, token).await;
            drop(permit);

            let _ = session_tx.send(SessionMessage::Finished { id, session, result });
        });

        true
    }

    async fn handle_session_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Progress { id, session, percent } => {
                if !self.is_current(id, session) {
                    return;
                }

                if let Some(progress) = self.queue.set_progress(id, percent) {
                    self.queue.emit(EventKind::UploadProgress, Some(id), Some(EventData::Progress { progress }));
                    self.queue.persist().await;
                }
            }
            SessionMessage::Finished { id, session, result } => {
                if self.is_current(id, session) {
                    self.active.remove(&id);
                    self.finish_session(id, result);
                    self.queue.persist().await;
                } else {
                    tracing::debug!(file_id = %id, session, "discarding outcome of stale session");
                }

                // 会话结束释放了许可
                self.fill_slots().await;
                self.check_drained().await;
            }
        }
    }

    /// 只处理仍在 `active` 中的会话；暂停、取消和删除都会先移除会话，结果在此之前已被丢弃
    fn finish_session(&mut self, id: FileId, result: std::result::Result<(), TransportError>) {
        let outcome = match result {
            Ok(()) => self.queue.mark_completed(id).map(|_| {
                tracing::debug!(file_id = %id, "upload completed");
                self.queue.emit(EventKind::UploadComplete, Some(id), None);
            }),
            Err(err) => {
                tracing::debug!(file_id = %id, error = %err, "upload failed");
                self.queue.mark_failed(id, err.message.clone()).map(|_| {
                    self.queue.emit(EventKind::UploadError, Some(id), Some(EventData::Error {
                        message: err.message,
                    }));
                })
            }
        };

        if let Err(err) = outcome {
            tracing::warn!(file_id = %id, error = %err, "failed to record upload outcome");
        }
    }

    /// 工作列表和活跃会话都清空后结束本次运行
    async fn check_drained(&mut self) {
        if self.queue.status() != BatchStatus::Uploading
            || !self.work_list.is_empty()
            || !self.active.is_empty()
        {
            return;
        }

        if self.queue.state().all_terminal() {
            self.queue.mark_batch_completed();
            self.queue.emit(EventKind::BatchComplete, None, Some(self.queue.batch_data()));
            tracing::info!(
                batch_id = %self.queue.state().id,
                failed = self.queue.state().has_failures(),
                "upload batch completed"
            );
        } else {
            // 还有无法调度的文件（运行中新加入或缺少内容），回到空闲
            self.queue.set_status(BatchStatus::Idle);
            tracing::info!(batch_id = %self.queue.state().id, "upload run drained with unfinished files");
        }

        self.queue.persist().await;
        let status = self.queue.status();
        self.finish_run(status);
    }

    fn is_current(&self, id: FileId, session: u64) -> bool {
        self.active.get(&id).is_some_and(|active| active.session == session)
    }

    fn run_handle(&mut self) -> RunHandle {
        let (done_tx, done_rx) = oneshot::channel();
        self.run_waiters.push(done_tx);
        RunHandle { done_rx }
    }

    fn finish_run(&mut self, status: BatchStatus) {
        for waiter in self.run_waiters.drain(..) {
            let _ = waiter.send(status);
        }
    }
}
