pub mod api;
pub mod config;
pub mod detector;
pub mod devices;
pub mod error;
pub mod mailer;
pub mod registry;
pub mod reports;
pub mod storage;

// Re-export main components for easier use
pub use error::Error;
pub use registry::FleetRegistry;
pub use storage::ShardStore;
