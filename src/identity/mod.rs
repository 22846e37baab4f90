//! Player identity resolution
//!
//! Pages name players by display name, and link to their account (uid) only
//! some of the time. This module collapses those sightings into one
//! persistent identity per player that survives renames.

mod resolver;

pub use resolver::IdentityResolver;

use crate::storage::PlayerRef;
use chrono::{DateTime, Utc};

/// One sighting of a player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub display_name: String,
    pub external_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        display_name: impl Into<String>,
        external_id: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            external_id: external_id.map(str::to_string),
            observed_at,
        }
    }

    /// Builds an observation from a player reference on a page
    pub fn from_player(player: &PlayerRef, observed_at: DateTime<Utc>) -> Self {
        Self {
            display_name: player.name.clone(),
            external_id: player.uid.map(|uid| uid.to_string()),
            observed_at,
        }
    }
}
