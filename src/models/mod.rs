pub mod config;
pub mod trial;

pub use config::{
    AppConfig, LogConfig, PersistenceMode, ServerConfig, StoreBackend, StoreConfig, TrialConfig,
};
pub use trial::{
    AttemptOutcome, ConditionalGrant, TrialAttempt, TrialDecision, TrialGrant, TrialLookup,
};
