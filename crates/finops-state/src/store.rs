//! StateStore — redb-backed persistence for recommendations and policies.
//!
//! Supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use finops_core::{Policy, Recommendation, RecommendationStatus, TransitionError};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Recommendations ────────────────────────────────────────────

    /// Insert or overwrite a recommendation.
    pub fn put_recommendation(&self, rec: &Recommendation) -> StateResult<()> {
        let value = serde_json::to_vec(rec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
            table
                .insert(rec.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(recommendation = %rec.id, status = %rec.status, "recommendation stored");
        Ok(())
    }

    /// Store `rec` only if no record with its id exists.
    ///
    /// Returns `true` if the record was written. The existence check and
    /// the write share one transaction.
    pub fn insert_recommendation_if_absent(&self, rec: &Recommendation) -> StateResult<bool> {
        let value = serde_json::to_vec(rec).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
            let exists = table
                .get(rec.id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(rec.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(recommendation = %rec.id, inserted, "recommendation insert-if-absent");
        Ok(inserted)
    }

    /// Get a recommendation by id.
    pub fn get_recommendation(&self, id: &str) -> StateResult<Option<Recommendation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rec: Recommendation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    /// List all recommendations.
    pub fn list_recommendations(&self) -> StateResult<Vec<Recommendation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rec: Recommendation =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rec);
        }
        Ok(results)
    }

    /// Recommendations in `namespace` whose status is one of `statuses`.
    pub fn find_by_namespace_and_status(
        &self,
        namespace: &str,
        statuses: &[RecommendationStatus],
    ) -> StateResult<Vec<Recommendation>> {
        Ok(self
            .list_recommendations()?
            .into_iter()
            .filter(|r| r.namespace == namespace && statuses.contains(&r.status))
            .collect())
    }

    /// Apply `change` to the stored record inside one write transaction.
    ///
    /// If `change` fails the transaction is aborted and the stored record
    /// is left exactly as it was.
    pub fn update_recommendation<F>(&self, id: &str, change: F) -> StateResult<Recommendation>
    where
        F: FnOnce(&mut Recommendation) -> Result<(), TransitionError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
            let bytes = table
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match bytes {
                None => Err(StateError::NotFound(format!("recommendation {id}"))),
                Some(bytes) => {
                    let mut rec: Recommendation =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    match change(&mut rec) {
                        Ok(()) => {
                            let value = serde_json::to_vec(&rec).map_err(map_err!(Serialize))?;
                            table
                                .insert(id, value.as_slice())
                                .map_err(map_err!(Write))?;
                            Ok(rec)
                        }
                        Err(e) => Err(StateError::from(e)),
                    }
                }
            }
        };
        match outcome {
            Ok(rec) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(recommendation = %id, status = %rec.status, "recommendation updated");
                Ok(rec)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    /// Move a stored recommendation to `next`, enforcing the lifecycle.
    pub fn transition_recommendation(
        &self,
        id: &str,
        next: RecommendationStatus,
    ) -> StateResult<Recommendation> {
        self.update_recommendation(id, |rec| rec.transition(next))
    }

    /// APPROVED → APPLIED.
    pub fn mark_applied(&self, id: &str) -> StateResult<Recommendation> {
        self.update_recommendation(id, |rec| rec.mark_applied())
    }

    /// APPROVED → FAILED, recording why.
    pub fn mark_failed(&self, id: &str, message: &str) -> StateResult<Recommendation> {
        self.update_recommendation(id, |rec| rec.mark_failed(message))
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Insert or update a policy.
    pub fn put_policy(&self, policy: &Policy) -> StateResult<()> {
        let key = policy.table_key();
        let value = serde_json::to_vec(policy).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "policy stored");
        Ok(())
    }

    /// List all policies, enabled or not.
    pub fn list_policies(&self) -> StateResult<Vec<Policy>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let policy: Policy =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(policy);
        }
        Ok(results)
    }

    /// Policies scoped to `namespace` plus every global policy.
    pub fn applicable_policies(&self, namespace: &str) -> StateResult<Vec<Policy>> {
        Ok(self
            .list_policies()?
            .into_iter()
            .filter(|p| p.applies_to(namespace))
            .collect())
    }

    /// Delete a policy by key. Returns true if it existed.
    pub fn delete_policy(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "policy deleted");
        Ok(existed)
    }

    /// Install [`Policy::defaults`] if the policy table is empty.
    ///
    /// Returns the number of policies written.
    pub fn seed_default_policies(&self) -> StateResult<usize> {
        if !self.list_policies()?.is_empty() {
            return Ok(0);
        }
        let defaults = Policy::defaults();
        for policy in &defaults {
            self.put_policy(policy)?;
        }
        info!(count = defaults.len(), "seeded default policies");
        Ok(defaults.len())
    }
}
