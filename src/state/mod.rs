//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `ProbeTarget` / `ProbeOutcome`: what a single probe asked for and how it ended
//! - `CrawlCheckpoint` / `CheckpointStore`: durable progress record for resumption
//! - `CancelToken`: cooperative stop signal polled by the crawl loop

mod cancel;
mod checkpoint;
mod probe;

// Re-export main types
pub use cancel::CancelToken;
pub use checkpoint::{
    CheckpointError, CheckpointStore, CrawlCheckpoint, RetryEntry, StrategyState,
    CHECKPOINT_VERSION,
};
pub use probe::{FeedbackKind, ProbeFeedback, ProbeOutcome, ProbeTarget, TransientKind};
