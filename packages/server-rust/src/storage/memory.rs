//! `DashMap`-backed in-memory registry store.

use dashmap::DashMap;

use super::store::{ApplicationRecord, RegistryStore, StatusEventRecord, StoreError};

/// In-memory [`RegistryStore`].
///
/// The default backend for tests and single-process deployments: lock-free
/// per-key access, no durability.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    /// Keyed by (slug, version).
    applications: DashMap<(String, String), ApplicationRecord>,
    /// Keyed by calculation id; events in append order.
    events: DashMap<String, Vec<StatusEventRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered applications.
    #[must_use]
    pub fn application_count(&self) -> usize {
        self.applications.len()
    }
}

impl RegistryStore for InMemoryStore {
    fn put_application(&self, record: ApplicationRecord) -> Result<(), StoreError> {
        let key = (record.spec.slug.clone(), record.spec.version.clone());
        self.applications.insert(key, record);
        Ok(())
    }

    fn get_application(
        &self,
        slug: &str,
        version: &str,
    ) -> Result<Option<ApplicationRecord>, StoreError> {
        Ok(self
            .applications
            .get(&(slug.to_string(), version.to_string()))
            .map(|r| r.clone()))
    }

    fn list_applications(&self) -> Result<Vec<ApplicationRecord>, StoreError> {
        let mut records: Vec<ApplicationRecord> =
            self.applications.iter().map(|r| r.clone()).collect();
        // Deterministic listing order regardless of map iteration order.
        records.sort_by(|a, b| {
            (&a.spec.slug, &a.spec.version).cmp(&(&b.spec.slug, &b.spec.version))
        });
        Ok(records)
    }

    fn append_status_event(&self, event: StatusEventRecord) -> Result<(), StoreError> {
        self.events
            .entry(event.calculation_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    fn status_events(&self, calculation_id: &str) -> Result<Vec<StatusEventRecord>, StoreError> {
        Ok(self
            .events
            .get(calculation_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    fn remove_status_events(&self, calculation_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .events
            .remove(calculation_id)
            .map_or(0, |(_, events)| events.len()))
    }
}
