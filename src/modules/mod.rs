pub mod config;
pub mod logger;
pub mod trial_db;
pub mod trial_rest;

// Re-export commonly used functions
pub use config::*;
