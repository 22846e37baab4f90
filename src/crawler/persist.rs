//! One unit of work per successful probe
//!
//! Every player a record mentions is resolved to an identity first, then the
//! records are upserted with those identity links. The whole unit commits or
//! rolls back together, so a failure never leaves half a page in the store.

use crate::identity::{IdentityResolver, Observation};
use crate::storage::{CatalogStore, PlayerRef, Record, RecordLinks, StorageResult};
use chrono::{DateTime, Utc};

/// Resolves and stores `records` inside a single unit of work
///
/// # Arguments
///
/// * `store` - The catalog store
/// * `records` - Records extracted from one page
/// * `observed_at` - When the page was fetched
///
/// # Returns
///
/// * `Ok(usize)` - Number of records written
/// * `Err(StorageError)` - The unit was rolled back
pub fn persist_unit<S: CatalogStore>(
    store: &mut S,
    records: &[Record],
    observed_at: DateTime<Utc>,
) -> StorageResult<usize> {
    store.begin_unit()?;

    match write_records(store, records, observed_at) {
        Ok(written) => match store.commit_unit() {
            Ok(()) => Ok(written),
            Err(e) => {
                // A failed RELEASE leaves the savepoint open
                if let Err(rollback) = store.rollback_unit() {
                    tracing::error!("Rollback after failed commit also failed: {}", rollback);
                }
                Err(e)
            }
        },
        Err(e) => {
            if let Err(rollback) = store.rollback_unit() {
                tracing::error!("Rollback after failed unit also failed: {}", rollback);
            }
            Err(e)
        }
    }
}

fn write_records<S: CatalogStore>(
    store: &mut S,
    records: &[Record],
    observed_at: DateTime<Utc>,
) -> StorageResult<usize> {
    for record in records {
        let links = resolve_links(store, record, observed_at)?;
        store.upsert_record(record, &links, observed_at)?;
        tracing::trace!("Stored {}", record.key());
    }
    Ok(records.len())
}

fn resolve_links<S: CatalogStore>(
    store: &mut S,
    record: &Record,
    observed_at: DateTime<Utc>,
) -> StorageResult<RecordLinks> {
    let mut resolver = IdentityResolver::new(store);
    let mut links = RecordLinks::default();

    match record {
        Record::Chart(chart) => {
            links.creator = resolve_player(&mut resolver, chart.creator.as_ref(), observed_at)?;
            links.stabilizer =
                resolve_player(&mut resolver, chart.stabilizer.as_ref(), observed_at)?;
        }
        Record::Ranking { row, .. } if !row.name.trim().is_empty() => {
            let observation = Observation::new(row.name.as_str(), None, observed_at);
            links.player = Some(resolver.resolve(&observation)?);
        }
        _ => {}
    }

    Ok(links)
}

fn resolve_player<S: CatalogStore>(
    resolver: &mut IdentityResolver<'_, S>,
    player: Option<&PlayerRef>,
    observed_at: DateTime<Utc>,
) -> StorageResult<Option<i64>> {
    match player {
        Some(player) if !player.name.trim().is_empty() => resolver
            .resolve(&Observation::from_player(player, observed_at))
            .map(Some),
        _ => Ok(None),
    }
}
