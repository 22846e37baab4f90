//! Output module for status reports and run summaries
//!
//! This module handles:
//! - Summarizing the checkpoint and store without running a crawl
//! - Rendering the result of a crawl or a leaderboard snapshot
//! - Showing a player's identity and alias history

pub mod stats;

pub use stats::{
    format_identity, format_snapshot, format_status, format_summary, load_status, print_status,
    StatusReport,
};
