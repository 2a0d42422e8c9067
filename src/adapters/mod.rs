pub mod discovery_file;
pub mod http_client;
pub mod http_handler;
pub mod memory_store;

/// Re-export commonly used types from adapters
pub use discovery_file::{FileDiscoveryProvider, load_snapshot_file};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use memory_store::InMemoryRateLimitStore;
