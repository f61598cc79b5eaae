mod errors;
mod manager;
mod queue;
mod scheduler;
mod store;
mod traits;
mod types;
pub mod validation;

pub use errors::{Result, TransportError, UploadError};
pub use manager::{FilteredEventReceiver, UploadManager, UploadManagerHandle};
pub use queue::UploadQueue;
pub use scheduler::{RunHandle, UploadScheduler};
pub use store::{FileStore, MemoryStore, StateStore, STATE_KEY};
pub use traits::{transport_fn, FnTransport, ProgressReporter, Transport};
pub use types::{
    BatchId,
    BatchSnapshot,
    BatchState,
    BatchStatus,
    ChunkInfo,
    EventData,
    EventKind,
    FileId,
    FileInput,
    FileStatus,
    TransportFile,
    UploadEvent,
    UploadFile,
};
pub use validation::ValidationResult;
