use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{Result, UploadError};

// Duration 以毫秒序列化
fn serialize_millis<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// 上传队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 单个文件最大字节数
    pub max_file_size: u64,
    /// 允许的 MIME 类型，空表示不限制，支持 `image/*`
    pub allowed_types: Vec<String>,
    /// 最大并发上传数
    pub max_concurrent: usize,
    /// 分块大小（仅作记录）
    pub chunk_size: u64,
    /// 是否生成分块信息（仅作记录）
    pub enable_chunking: bool,
    /// 加入队列时是否校验
    pub validate_before_upload: bool,
    /// 事件广播缓冲区大小
    pub event_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024, // 100MB
            allowed_types: Vec::new(),
            max_concurrent: 3,
            chunk_size: 5 * 1024 * 1024, // 5MB
            enable_chunking: false,
            validate_before_upload: true,
            event_capacity: 256,
        }
    }
}

impl UploadConfig {
    pub fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// 重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub base_delay: Duration,
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 抖动比例，取值 [0, 1]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(UploadError::config("max_attempts must be at least 1"));
        }
        if self.backoff_multiplier <= 1.0 {
            return Err(UploadError::config("backoff_multiplier must be greater than 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(UploadError::config("jitter_factor must be within [0, 1]"));
        }
        if self.base_delay > self.max_delay {
            return Err(UploadError::config("base_delay must not exceed max_delay"));
        }
        Ok(())
    }
}

/// 持久化位置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 状态文件目录，未设置时只保存在内存中
    pub dir: Option<PathBuf>,
}

/// HTTP 上传端点
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub endpoint: String,
    pub token: Option<String>,
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:1080/files".to_string(),
            token: None,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub upload: UploadConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Settings> {
        let settings: Settings = toml::from_str(content)
            .map_err(|err| UploadError::config(err.to_string()))?;
        settings.retry.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let settings = Settings::from_toml(r#"
            [upload]
            max_concurrent = 2
            allowed_types = ["image/*", "application/pdf"]

            [retry]
            base_delay = 250
        "#).unwrap();

        assert_eq!(settings.upload.max_concurrent, 2);
        assert_eq!(settings.upload.allowed_types.len(), 2);
        assert!(settings.upload.validate_before_upload);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.retry.max_attempts, 3);
        assert!(settings.store.dir.is_none());
    }

    #[test]
    fn test_invalid_retry_config_rejected() {
        let err = Settings::from_toml("[retry]\njitter_factor = 1.5\n").unwrap_err();
        assert!(matches!(err, UploadError::Config(_)));

        let config = RetryConfig { backoff_multiplier: 1.0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_concurrency_is_at_least_one() {
        let config = UploadConfig { max_concurrent: 0, ..Default::default() };
        assert_eq!(config.concurrency(), 1);
    }
}
