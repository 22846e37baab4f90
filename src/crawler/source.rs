//! The fetch/parse boundary the controller probes through

use crate::crawler::parser::ParseError;
use crate::state::{ProbeTarget, TransientKind};
use crate::storage::Record;
use thiserror::Error;

/// Why a page could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The site says the page does not exist (404/410)
    #[error("page does not exist")]
    NotFound,

    /// Anything worth trying again later
    #[error("transient failure: {0}")]
    Transient(TransientKind),
}

/// Something that can fetch catalog pages and turn them into records
///
/// Implemented by the HTTP client in production and by in-process fakes in
/// tests.
#[allow(async_fn_in_trait)]
pub trait ProbeSource {
    /// Fetches the raw page for `target`
    async fn fetch(&self, target: ProbeTarget) -> Result<String, FetchError>;

    /// Extracts records from a fetched page
    fn parse(&self, html: &str, target: ProbeTarget) -> Result<Vec<Record>, ParseError>;
}
