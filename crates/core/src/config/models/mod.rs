pub mod app_config;
pub mod dispatcher_worker;
pub mod observability;
pub mod transport;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use dispatcher_worker::{DispatcherConfig, MisfirePolicy, WorkerConfig};
pub use observability::ObservabilityConfig;
pub use transport::TransportConfig;
