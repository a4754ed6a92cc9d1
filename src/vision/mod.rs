pub mod client;
#[cfg(test)]
pub mod mock;
pub mod retry;

pub use client::{HttpVisionClient, VisionBackend, VisionRequest};
pub use retry::with_backoff;
