//! 通用的退避重试，与上传无关，可以包装任意异步操作。

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use crate::config::RetryConfig;
use crate::core::{Result, UploadError};

/// 第 `attempt` 次（从 1 开始）失败后的退避延迟
///
/// `unit` 取值 [-1, 1]，决定抖动落在 `[-delay*jitter, +delay*jitter]` 的哪个位置。
pub fn backoff_delay(config: &RetryConfig, attempt: u32, unit: f64) -> Duration {
    let base = config.base_delay.as_millis() as f64;
    let max = config.max_delay.as_millis() as f64;
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

    let delay = (base * config.backoff_multiplier.powi(exponent)).min(max);
    let jitter = delay * config.jitter_factor * unit.clamp(-1.0, 1.0);
    let upper = (max * (1.0 + config.jitter_factor)).floor();

    Duration::from_millis((delay + jitter).round().clamp(0.0, upper) as u64)
}

/// 带随机抖动的退避延迟
pub fn jittered_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let unit = rand::thread_rng().gen_range(-1.0..=1.0);
    backoff_delay(config, attempt, unit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Success,
    Exhausted,
}

/// 单个操作的重试记录，按调用方给定的 id 保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: RetryStatus,
}

impl Default for RetryRecord {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            last_error: None,
            status: RetryStatus::Pending,
        }
    }
}

/// 重试结果：成功带数据，耗尽带最后一次错误
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { data: T, attempts: u32 },
    Failure { error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> std::result::Result<T, E> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure { error, .. } => Err(error),
        }
    }
}

/// 重试执行器
///
/// 同一个 `operation_id` 的并发调用不会去重，由调用方保证。
pub struct RetryExecutor {
    config: RetryConfig,
    records: RwLock<HashMap<String, RetryRecord>>,
    tokens: RwLock<HashMap<String, CancellationToken>>,
    root: CancellationToken,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            records: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn record(&self, operation_id: &str) -> Option<RetryRecord> {
        self.records.read().await.get(operation_id).cloned()
    }

    /// 清除记录，耗尽的操作需要先重置才能再次执行
    pub async fn reset(&self, operation_id: &str) {
        self.records.write().await.remove(operation_id);
    }

    /// 取消某个操作正在进行的重试循环
    pub async fn cancel(&self, operation_id: &str) {
        if let Some(token) = self.tokens.read().await.get(operation_id) {
            token.cancel();
        }
    }

    /// Cancels every retry loop started by this executor, now and in the future.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub async fn with_retry<F, Fut, T, E>(&self, operation_id: &str, operation: F) -> Result<RetryOutcome<T, E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.with_retry_notify(operation_id, operation, |_, _, _| {}).await
    }

    /// 执行带重试的操作，每次等待前调用 `on_retry(attempt, delay, error)`
    pub async fn with_retry_notify<F, Fut, T, E, N>(
        &self,
        operation_id: &str,
        mut operation: F,
        mut on_retry: N,
    ) -> Result<RetryOutcome<T, E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
        N: FnMut(u32, Duration, &E),
    {
        let mut attempts = {
            let mut records = self.records.write().await;
            let record = records.entry(operation_id.to_string()).or_default();
            match record.status {
                RetryStatus::Exhausted => {
                    return Err(UploadError::RetryExhausted {
                        attempts: record.attempts,
                        last_error: record.last_error.clone().unwrap_or_default(),
                    });
                }
                RetryStatus::Success => *record = RetryRecord::default(),
                RetryStatus::Pending | RetryStatus::Retrying => {}
            }
            record.attempts
        };

        let token = self.root.child_token();
        self.tokens.write().await.insert(operation_id.to_string(), token.clone());

        let result = loop {
            if token.is_cancelled() {
                break Err(UploadError::Cancelled);
            }

            attempts += 1;
            self.update(operation_id, |record| {
                record.attempts = attempts;
                record.status = RetryStatus::Retrying;
                record.last_attempt_at = Some(Utc::now());
                record.next_retry_at = None;
            }).await;

            let error = match operation(token.clone()).await {
                Ok(data) => {
                    self.update(operation_id, |record| {
                        record.status = RetryStatus::Success;
                        record.last_error = None;
                    }).await;
                    break Ok(RetryOutcome::Success { data, attempts });
                }
                Err(error) => error,
            };

            // 被取消打断的尝试不计数，记录里只保留真正完成的次数
            if token.is_cancelled() {
                attempts -= 1;
                break Err(UploadError::Cancelled);
            }

            let message = error.to_string();
            if attempts >= self.config.max_attempts {
                tracing::warn!(operation_id, attempts, error = %message, "retry attempts exhausted");
                self.update(operation_id, |record| {
                    record.status = RetryStatus::Exhausted;
                    record.last_error = Some(message);
                }).await;
                break Ok(RetryOutcome::Failure { error, attempts });
            }

            let delay = jittered_delay(&self.config, attempts);
            let next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|delay| Utc::now() + delay);
            self.update(operation_id, |record| {
                record.last_error = Some(message.clone());
                record.next_retry_at = next_retry_at;
            }).await;

            tracing::warn!(
                operation_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "operation failed, retrying"
            );
            on_retry(attempts, delay, &error);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = token.cancelled() => break Err(UploadError::Cancelled),
            }
        };

        if matches!(result, Err(UploadError::Cancelled)) {
            self.update(operation_id, |record| {
                record.attempts = attempts;
                record.status = RetryStatus::Pending;
                record.next_retry_at = None;
            }).await;
        }
        self.tokens.write().await.remove(operation_id);

        result
    }

    async fn update(&self, operation_id: &str, f: impl FnOnce(&mut RetryRecord)) {
        let mut records = self.records.write().await;
        f(records.entry(operation_id.to_string()).or_default());
    }
}

/// 执行带重试的操作，不保存记录，也不支持取消
pub async fn retry_with_config<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if attempt < max_attempts => {
                let delay = jittered_delay(config, attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
                sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// 使用默认配置执行重试
pub async fn retry<F, Fut, T, E>(operation: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    retry_with_config(&RetryConfig::default(), operation).await
}

/// 重试构建器
pub struct RetryBuilder {
    config: RetryConfig,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }

    pub fn executor(self) -> Result<RetryExecutor> {
        RetryExecutor::new(self.config)
    }

    pub async fn run<F, Fut, T, E>(self, operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        retry_with_config(&self.config, operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> RetryConfig {
        RetryBuilder::new()
            .max_attempts(3)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
            .backoff_multiplier(2.0)
            .jitter_factor(0.5)
            .build()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = config();

        assert_eq!(backoff_delay(&config, 1, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3, 0.0), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 10, 0.0), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = config();

        assert_eq!(backoff_delay(&config, 1, -1.0), Duration::from_millis(50));
        assert_eq!(backoff_delay(&config, 1, 1.0), Duration::from_millis(150));
        assert_eq!(backoff_delay(&config, 20, 1.0), Duration::from_millis(1500));

        for attempt in 1..=12 {
            let delay = jittered_delay(&config, attempt);
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let executor = RetryExecutor::new(config()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();

        let outcome = executor
            .with_retry_notify(
                "op",
                |_token| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("flaky")
                        } else {
                            Ok(42)
                        }
                    }
                },
                |attempt, _delay, _error| retries.push(attempt),
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.into_result().unwrap(), 42);
        assert_eq!(retries, vec![1, 2]);
        assert_eq!(executor.record("op").await.unwrap().status, RetryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let executor = RetryExecutor::new(config()).unwrap();

        let outcome = executor
            .with_retry("op", |_token| async { Err::<(), _>("server down") })
            .await
            .unwrap();

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 3);

        let record = executor.record("op").await.unwrap();
        assert_eq!(record.status, RetryStatus::Exhausted);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error.as_deref(), Some("server down"));

        // 耗尽后必须先重置
        let again = executor.with_retry("op", |_token| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(again, Err(UploadError::RetryExhausted { attempts: 3, .. })));

        executor.reset("op").await;
        let outcome = executor.with_retry("op", |_token| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_aborts_loop() {
        let executor = Arc::new(RetryExecutor::new(config()).unwrap());
        let calls = Arc::new(AtomicU32::new(0));

        let task = tokio::spawn({
            let executor = executor.clone();
            let calls = calls.clone();
            async move {
                executor
                    .with_retry("op", |_token| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>("nope") }
                    })
                    .await
            }
        });

        // 第一次失败后进入退避等待
        tokio::time::sleep(Duration::from_millis(10)).await;
        executor.cancel("op").await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.record("op").await.unwrap().status, RetryStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_last_attempt_does_not_use_it_up() {
        let executor = Arc::new(
            RetryBuilder::new()
                .max_attempts(2)
                .base_delay(Duration::from_millis(100))
                .max_delay(Duration::from_millis(1000))
                .executor()
                .unwrap(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        // 第一次失败，第二次一直挂起直到被取消
        let task = tokio::spawn({
            let executor = executor.clone();
            let calls = calls.clone();
            async move {
                executor
                    .with_retry("op", |token| {
                        let attempt = calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if attempt > 0 {
                                token.cancelled().await;
                            }
                            Err::<(), _>("aborted")
                        }
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        executor.cancel("op").await;

        assert!(matches!(task.await.unwrap(), Err(UploadError::Cancelled)));
        let record = executor.record("op").await.unwrap();
        assert_eq!(record.status, RetryStatus::Pending);
        assert_eq!(record.attempts, 1);

        // 下一轮仍有一次真实尝试，并以普通的耗尽结果结束
        let outcome = executor
            .with_retry("op", |_token| async { Err::<(), _>("server down") })
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::Failure { error: "server down", attempts: 2 }));
        assert_eq!(executor.record("op").await.unwrap().status, RetryStatus::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_new_loops() {
        let executor = RetryExecutor::new(config()).unwrap();
        executor.cancel_all();

        let result = executor.with_retry("op", |_token| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_retry() {
        let mut count = 0;
        let result = retry(|| {
            count += 1;
            let current = count;
            async move {
                if current < 3 {
                    Err("timeout")
                } else {
                    Ok(current)
                }
            }
        }).await;

        assert_eq!(result.unwrap(), 3);

        let mut count = 0;
        let result = RetryBuilder::new()
            .max_attempts(2)
            .run(|| {
                count += 1;
                async { Err::<(), _>("timeout") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count, 2);
    }
}
