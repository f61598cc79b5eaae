use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 速度计算器，基于滑动窗口内的字节样本
pub struct SpeedCalculator {
    /// 历史记录 (时间, 累计字节数)
    history: VecDeque<(Instant, u64)>,
    /// 历史窗口大小
    window_size: Duration,
    /// 最大历史记录数
    max_entries: usize,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration) -> Self {
        Self {
            history: VecDeque::new(),
            window_size,
            max_entries: 100,
        }
    }

    /// 添加数据点
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    pub fn add_sample_at(&mut self, now: Instant, bytes: u64) {
        // 累计字节数回退（例如重试后进度归零）时重新计算
        if self.history.back().is_some_and(|&(_, last)| bytes < last) {
            self.history.clear();
        }
        self.history.push_back((now, bytes));

        // 移除过期的数据点
        while let Some(&(time, _)) = self.history.front() {
            if now.duration_since(time) > self.window_size {
                self.history.pop_front();
            } else {
                break;
            }
        }

        while self.history.len() > self.max_entries {
            self.history.pop_front();
        }
    }

    /// 计算当前速度（字节/秒）
    pub fn speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };

        let duration = last.0.duration_since(first.0).as_secs_f64();
        if duration > 0.0 {
            (last.1 - first.1) as f64 / duration
        } else {
            0.0
        }
    }

    /// 估算剩余时间
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.speed();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化速度
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// 格式化持续时间
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_over_window() {
        let start = Instant::now();
        let mut calculator = SpeedCalculator::new(Duration::from_secs(5));

        assert_eq!(calculator.speed(), 0.0);
        calculator.add_sample_at(start, 0);
        calculator.add_sample_at(start + Duration::from_secs(2), 2048);

        assert_eq!(calculator.speed(), 1024.0);
        assert_eq!(calculator.eta(4096), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_samples_outside_window_are_dropped() {
        let start = Instant::now();
        let mut calculator = SpeedCalculator::new(Duration::from_secs(1));

        calculator.add_sample_at(start, 0);
        calculator.add_sample_at(start + Duration::from_secs(10), 100);

        assert_eq!(calculator.speed(), 0.0);
        assert_eq!(calculator.eta(10), None);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_speed(2.0 * 1024.0 * 1024.0), "2.00 MB/s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(9)), "9s");
    }
}
