pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{AutomationConfig, BatchConfig, ProviderSeed, ServiceConfig, default_providers};
