pub mod http;
pub mod retrying;

pub use http::{HttpUploader, ProgressStream};
pub use retrying::RetryingTransport;
