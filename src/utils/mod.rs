pub mod progress;
pub mod retry;

pub use progress::{SpeedCalculator, format_bytes, format_speed, format_duration};
pub use retry::{
    backoff_delay,
    jittered_delay,
    retry,
    retry_with_config,
    RetryBuilder,
    RetryExecutor,
    RetryOutcome,
    RetryRecord,
    RetryStatus,
};
