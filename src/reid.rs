//! Re-identification: TTL-bounded appearance memory per identity.
//!
//! The coordinator writes embeddings computed by the model workers; the
//! tracker reads them when geometry alone cannot re-associate a person.

mod cache;
mod embedding;
mod scheduler;
mod ttl_store;

pub use cache::{Aggregation, QueryMode, ReidCache, ReidConfig, ReidEntry};
pub use embedding::Embedding;
pub use scheduler::EmbedScheduler;
pub use ttl_store::TtlStore;
