// Adapters layer: concrete implementations of the domain ports.

pub mod http_provider;
pub mod memory_store;

pub use http_provider::HttpTrackingProvider;
pub use memory_store::{InMemoryJobStore, InMemoryRecordSink};
