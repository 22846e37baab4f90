//! Probe targets and outcome classification
//!
//! A probe is one fetch+parse of a single catalog page. Its outcome decides
//! whether the id is counted, retried, or recorded as absent.

use crate::storage::Record;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single page the crawler can ask the site for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeTarget {
    /// A chart detail page (`/chart/{cid}`)
    Chart(i64),

    /// A song page listing its charts (`/song/{sid}`)
    Song(i64),
}

impl ProbeTarget {
    /// Returns the numeric id regardless of the page kind
    pub fn id(&self) -> i64 {
        match self {
            Self::Chart(id) | Self::Song(id) => *id,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chart(id) => write!(f, "chart c{}", id),
            Self::Song(id) => write!(f, "song s{}", id),
        }
    }
}

/// Why a probe failed in a way that is worth retrying
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// The request timed out
    Timeout,

    /// The connection was refused or reset
    Connection,

    /// The server answered with a retryable status (429, 5xx, ...)
    Status(u16),

    /// The response body could not be read
    Body,

    /// The page arrived but could not be parsed
    Parse,

    /// The unit of work could not be committed to the store
    Storage,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connection => write!(f, "connection error"),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::Body => write!(f, "body read error"),
            Self::Parse => write!(f, "malformed page"),
            Self::Storage => write!(f, "storage failure"),
        }
    }
}

/// Result of one fetch+parse
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The page exists and yielded records
    Found(Vec<Record>),

    /// Authoritative not-found (HTTP 404/410); never retried
    NotFound,

    /// Timeout, connection reset, malformed page; retried up to the cap
    TransientError(TransientKind),
}

impl ProbeOutcome {
    /// Short label for logging
    pub fn label(&self) -> &'static str {
        match self {
            Self::Found(_) => "found",
            Self::NotFound => "not_found",
            Self::TransientError(_) => "transient",
        }
    }
}

/// What a strategy learns about a probe once the controller has handled it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackKind {
    /// Persisted successfully; `discovered` holds chart ids listed on a song page
    Found { discovered: Vec<i64> },

    /// Authoritatively absent
    NotFound,

    /// Failed transiently (fetch, parse or storage); owned by the retry queue now
    Transient,
}

/// The controller's report of a handled probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFeedback {
    pub target: ProbeTarget,
    pub kind: FeedbackKind,
}

impl ProbeFeedback {
    pub fn found(target: ProbeTarget, discovered: Vec<i64>) -> Self {
        Self {
            target,
            kind: FeedbackKind::Found { discovered },
        }
    }

    pub fn not_found(target: ProbeTarget) -> Self {
        Self {
            target,
            kind: FeedbackKind::NotFound,
        }
    }

    pub fn transient(target: ProbeTarget) -> Self {
        Self {
            target,
            kind: FeedbackKind::Transient,
        }
    }
}
