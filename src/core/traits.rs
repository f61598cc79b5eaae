use std::future::Future;
use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use super::errors::TransportError;
use super::types::TransportFile;

/// 传输 trait - 由调用方注入，负责单个文件的完整传输
///
/// 实现方需要：
/// - 通过 `progress` 多次报告 0-100 的百分比
/// - 在 `cancel` 触发后尽快中止自身的 IO
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(
        &self,
        file: TransportFile,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;
}

/// 进度回调，按调用顺序转发给所属的调度器
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u8) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(sink) }
    }

    /// A reporter that drops every update.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: u8) {
        (self.sink)(percent.min(100));
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// 用闭包实现的传输
pub struct FnTransport<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(TransportFile, ProgressReporter, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TransportError>> + Send,
{
    async fn upload(
        &self,
        file: TransportFile,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        (self.f)(file, progress, cancel).await
    }
}

/// Wraps an async closure as a shared [`Transport`].
pub fn transport_fn<F, Fut>(f: F) -> Arc<dyn Transport>
where
    F: Fn(TransportFile, ProgressReporter, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    Arc::new(FnTransport { f })
}
