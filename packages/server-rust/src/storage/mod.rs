//! Registry persistence: application specs and calculation status history.

pub mod memory;
pub mod store;

pub use memory::InMemoryStore;
pub use store::{now_ms, ApplicationRecord, RegistryStore, StatusEventRecord, StoreError};
