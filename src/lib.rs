// Core modules
pub mod api;
pub mod config;
pub mod feed;
pub mod journal;
pub mod models;
pub mod store;
pub mod strategy;
pub mod stream;

// Re-export commonly used types
pub use config::BotConfig;
pub use models::*;
pub use store::CandleStore;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
