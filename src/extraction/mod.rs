pub mod controller;
pub mod merge;
pub mod parser;
pub mod phash;
pub mod proposer;
pub mod worker;

pub use controller::ExtractionController;
pub use worker::{FrameCapture, PipelineContext};
