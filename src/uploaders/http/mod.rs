use std::pin::Pin;
use std::task::{Context, Poll};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client};
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::config::HttpConfig;
use crate::core::{ProgressReporter, Result, Transport, TransportError, TransportFile, UploadError};

/// 默认的流式分块大小
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// 简单 HTTP 上传器：一次 POST 发送整个文件
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpUploader {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|err| UploadError::config(format!("invalid endpoint '{}': {}", config.endpoint, err)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| UploadError::config(err.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
        })
    }

    async fn send(&self, file: TransportFile, progress: ProgressReporter) -> Result<(), TransportError> {
        let metadata = metadata_header(&file);
        let chunks = split(&file.data, STREAM_CHUNK_SIZE);
        let body = Body::wrap_stream(ProgressStream::new(
            futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>)),
            file.size,
            progress,
        ));

        let mut request = self.client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, file.mime_type.as_str())
            .header("Upload-Metadata", metadata)
            .body(body);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::new(format!(
                "Upload failed with status {}: {}",
                status.as_u16(),
                message.trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for HttpUploader {
    async fn upload(
        &self,
        file: TransportFile,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::new("Upload was cancelled")),
            result = self.send(file, progress) => result,
        }
    }
}

/// tus 风格的元数据头：`filename <base64>,filetype <base64>`
fn metadata_header(file: &TransportFile) -> String {
    format!(
        "filename {},filetype {}",
        STANDARD.encode(&file.name),
        STANDARD.encode(&file.mime_type)
    )
}

fn split(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..data.len())
        .step_by(chunk_size.max(1))
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

pin_project! {
    /// 统计已发送字节并按百分比报告进度
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        sent: u64,
        total: u64,
        last_percent: Option<u8>,
        reporter: ProgressReporter,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total: u64, reporter: ProgressReporter) -> Self {
        Self {
            inner,
            sent: 0,
            total,
            last_percent: None,
            reporter,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                *this.sent += chunk.len() as u64;
                let percent = if *this.total == 0 {
                    100
                } else {
                    (*this.sent * 100 / *this.total).min(100) as u8
                };

                // 百分比没有变化时不重复报告
                if *this.last_percent != Some(percent) {
                    *this.last_percent = Some(percent);
                    this.reporter.report(percent);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
