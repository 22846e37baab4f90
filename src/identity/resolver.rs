use crate::identity::Observation;
use crate::storage::{AliasRecord, CatalogStore, IdentityRecord, StorageError, StorageResult};

const RESOLVE_SAVEPOINT: &str = "harvest_resolve";

/// Maps observations to canonical identity ids
///
/// Borrow one around the store for as long as it is needed; every
/// [`resolve`](Self::resolve) runs in its own savepoint, so it is atomic on
/// its own and also nests inside an open unit of work.
pub struct IdentityResolver<'s, S: CatalogStore> {
    store: &'s mut S,
}

impl<'s, S: CatalogStore> IdentityResolver<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self { store }
    }

    /// Resolves an observation to an identity id, creating or updating rows as needed
    ///
    /// An external id always wins over a display name. A name match is only
    /// followed when it cannot contradict the observation's external id, so
    /// two accounts that once shared a name are never merged.
    ///
    /// # Returns
    ///
    /// * `Ok(i64)` - The identity the observation belongs to
    /// * `Err(StorageError)` - The write failed and was rolled back
    pub fn resolve(&mut self, observation: &Observation) -> StorageResult<i64> {
        let display_name = observation.display_name.trim();
        if display_name.is_empty() {
            return Err(StorageError::Database(
                "observation has an empty display name".to_string(),
            ));
        }

        self.store.savepoint(RESOLVE_SAVEPOINT)?;
        match self.resolve_in_savepoint(display_name, observation) {
            Ok(id) => match self.store.release(RESOLVE_SAVEPOINT) {
                Ok(()) => Ok(id),
                Err(e) => {
                    if let Err(rollback) = self.store.rollback_to(RESOLVE_SAVEPOINT) {
                        tracing::warn!("Rollback after failed release also failed: {}", rollback);
                    }
                    Err(e)
                }
            },
            Err(e) => {
                if let Err(rollback) = self.store.rollback_to(RESOLVE_SAVEPOINT) {
                    tracing::warn!("Rollback after failed resolve also failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    fn resolve_in_savepoint(
        &mut self,
        display_name: &str,
        observation: &Observation,
    ) -> StorageResult<i64> {
        let external_id = observation.external_id.as_deref();
        let seen_at = observation.observed_at;

        if let Some(ext) = external_id {
            if let Some(identity) = self.store.find_identity_by_external_id(ext)? {
                self.store.touch_identity(identity.id, display_name, seen_at)?;
                self.store
                    .upsert_alias(identity.id, display_name, Some(ext), seen_at)?;
                return Ok(identity.id);
            }
        }

        if let Some(alias) = self.store.find_latest_alias(display_name)? {
            let identity = self
                .store
                .find_identity(alias.identity_id)?
                .ok_or(StorageError::IdentityNotFound(alias.identity_id))?;

            match (external_id, identity.external_id.as_deref()) {
                (Some(ext), None) => {
                    tracing::info!(
                        "Linking '{}' (identity {}) to account {}",
                        display_name,
                        identity.id,
                        ext
                    );
                    self.store.backfill_external_id(identity.id, ext)?;
                    return self.attach(identity.id, display_name, Some(ext), observation);
                }
                (Some(ext), Some(owner)) => {
                    tracing::debug!(
                        "Name '{}' belongs to account {}, not {}; keeping them apart",
                        display_name,
                        owner,
                        ext
                    );
                }
                (None, _) => {
                    return self.attach(identity.id, display_name, None, observation);
                }
            }
        }

        let id = self
            .store
            .insert_identity(external_id, display_name, seen_at)?;
        self.store
            .upsert_alias(id, display_name, external_id, seen_at)?;
        tracing::debug!("New identity {} for '{}'", id, display_name);
        Ok(id)
    }

    fn attach(
        &mut self,
        identity_id: i64,
        display_name: &str,
        external_id: Option<&str>,
        observation: &Observation,
    ) -> StorageResult<i64> {
        self.store
            .touch_identity(identity_id, display_name, observation.observed_at)?;
        self.store.upsert_alias(
            identity_id,
            display_name,
            external_id,
            observation.observed_at,
        )?;
        Ok(identity_id)
    }

    /// Finds an identity by account uid (all digits) or by its most recent alias
    pub fn lookup(&self, identifier: &str) -> StorageResult<Option<IdentityRecord>> {
        let identifier = identifier.trim();
        if !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit()) {
            if let Some(identity) = self.store.find_identity_by_external_id(identifier)? {
                return Ok(Some(identity));
            }
        }

        match self.store.find_latest_alias(identifier)? {
            Some(alias) => self.store.find_identity(alias.identity_id),
            None => Ok(None),
        }
    }

    /// Every name an identity has used, most recent first
    pub fn aliases(&self, identity_id: i64) -> StorageResult<Vec<AliasRecord>> {
        self.store.aliases_of(identity_id)
    }
}
