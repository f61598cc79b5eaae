pub mod core;
pub mod uploaders;
pub mod utils;
pub mod config;

// 重新导出核心类型
pub use core::{
    BatchSnapshot,
    BatchStatus,
    EventData,
    EventKind,
    FileId,
    FileInput,
    FileStatus,
    FileStore,
    MemoryStore,
    ProgressReporter,
    RunHandle,
    StateStore,
    Transport,
    TransportError,
    TransportFile,
    UploadError,
    UploadEvent,
    UploadFile,
    UploadManager,
    UploadManagerHandle,
    Result,
    transport_fn,
};

pub use config::{RetryConfig, Settings, UploadConfig};

// 重新导出上传器
pub use uploaders::{HttpUploader, RetryingTransport};

pub use utils::{RetryExecutor, RetryOutcome, RetryRecord, RetryStatus};
