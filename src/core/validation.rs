//! 文件准入校验：大小、类型、空文件。纯函数，无 IO。

use crate::config::UploadConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn joined(&self) -> String {
        self.errors.join("; ")
    }
}

/// 根据配置校验文件元数据
pub fn validate(config: &UploadConfig, size: u64, mime_type: &str) -> ValidationResult {
    let mut errors = Vec::new();

    if size == 0 {
        errors.push("File is empty".to_string());
    }

    if size > config.max_file_size {
        errors.push(format!(
            "File size {} exceeds the maximum allowed size of {} bytes",
            size, config.max_file_size
        ));
    }

    if !is_type_allowed(&config.allowed_types, mime_type) {
        errors.push(format!("File type '{}' is not allowed", mime_type));
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

fn is_type_allowed(allowed: &[String], mime_type: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let mime_type = mime_type.trim().to_ascii_lowercase();
    allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_suffix("/*") {
            Some(prefix) => mime_type
                .split_once('/')
                .is_some_and(|(top, _)| top == prefix),
            None => pattern == "*/*" || pattern == mime_type,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploadConfig {
        UploadConfig {
            max_file_size: 1000,
            allowed_types: vec!["image/*".to_string(), "application/pdf".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_valid_file() {
        let result = validate(&config(), 500, "image/png");
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_rejects_oversized_file() {
        let result = validate(&config(), 2000, "application/pdf");
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("exceeds the maximum allowed size"));
    }

    #[test]
    fn test_rejects_empty_and_disallowed_type_together() {
        let result = validate(&config(), 0, "text/plain");
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
        assert!(result.joined().contains("empty"));
        assert!(result.joined().contains("text/plain"));
    }

    #[test]
    fn test_empty_allow_list_accepts_any_type() {
        let config = UploadConfig { allowed_types: Vec::new(), ..config() };
        assert!(validate(&config, 10, "application/x-whatever").valid);
    }
}
