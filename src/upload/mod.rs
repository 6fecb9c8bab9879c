//! Concurrent chunked upload engine.

pub mod chunk;
pub mod coordinator;
pub mod pool;
pub mod retry;
pub mod throughput;
pub mod walker;

#[cfg(test)]
mod fake;

pub use coordinator::UploadOptions;
pub use retry::RetryPolicy;
pub use walker::{upload_tree, TreeReport};
