use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use crate::core::{ProgressReporter, Transport, TransportError, TransportFile};
use crate::utils::{RetryExecutor, RetryOutcome};

/// 在单个文件的会话内按退避策略重试传输
///
/// 默认的批次流程不自动重试，需要时由调用方显式包装。重试记录以文件 id 为键，
/// 每次会话开始时重置。
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    executor: Arc<RetryExecutor>,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>, executor: Arc<RetryExecutor>) -> Self {
        Self { inner, executor }
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }
}

#[async_trait]
impl Transport for RetryingTransport {
    async fn upload(
        &self,
        file: TransportFile,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let operation_id = file.id.to_string();
        self.executor.reset(&operation_id).await;

        let inner: &dyn Transport = self.inner.as_ref();
        let attempt_cancel = cancel.clone();
        let run = self.executor.with_retry(&operation_id, move |_| {
            inner.upload(file.clone(), progress.clone(), attempt_cancel.clone())
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.executor.reset(&operation_id).await;
                return Err(TransportError::new("Upload was cancelled"));
            }
            outcome = run => outcome,
        };

        match outcome {
            Ok(RetryOutcome::Success { .. }) => Ok(()),
            Ok(RetryOutcome::Failure { error, attempts }) => {
                tracing::debug!(file_id = %operation_id, attempts, "transport retries exhausted");
                Err(error)
            }
            Err(err) => Err(TransportError::new(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use bytes::Bytes;
    use crate::core::{transport_fn, FileId};
    use crate::utils::{RetryBuilder, RetryStatus};

    fn file() -> TransportFile {
        TransportFile {
            id: FileId::new(),
            name: "a.bin".to_string(),
            size: 4,
            mime_type: "application/octet-stream".to_string(),
            data: Bytes::from_static(b"abcd"),
        }
    }

    fn executor() -> Arc<RetryExecutor> {
        let executor = RetryBuilder::new()
            .max_attempts(3)
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(100))
            .executor()
            .unwrap();
        Arc::new(executor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = transport_fn({
            let calls = calls.clone();
            move |_file, _progress, _cancel| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(TransportError::new("connection reset"))
                    } else {
                        Ok(())
                    }
                }
            }
        });

        let transport = RetryingTransport::new(inner, executor());
        let file = file();
        let id = file.id.to_string();

        transport.upload(file, ProgressReporter::noop(), CancellationToken::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let record = transport.executor().record(&id).await.unwrap();
        assert_eq!(record.status, RetryStatus::Success);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_transport_error() {
        let inner = transport_fn(|_file, _progress, _cancel| async {
            Err(TransportError::new("503 service unavailable"))
        });
        let transport = RetryingTransport::new(inner, executor());

        let err = transport
            .upload(file(), ProgressReporter::noop(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.message, "503 service unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let inner = transport_fn(|_file, _progress, _cancel| async {
            Err(TransportError::new("flaky"))
        });
        let transport = RetryingTransport::new(inner, executor());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .upload(file(), ProgressReporter::noop(), cancel)
            .await
            .unwrap_err();

        assert_eq!(err.message, "Upload was cancelled");
    }
}
