// Handlers module - request-trial endpoint and shared state

pub mod trial;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::TrialError;
use crate::trial::{IdentifierSource, TrialGrantService};

/// Injected clock so handler tests can pin `now`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Either a usable service or the reason startup could not build one.
/// A misconfigured process still serves, answering every trial request with
/// a configuration error instead of touching storage.
#[derive(Clone)]
pub enum ServiceSlot {
    Ready(Arc<TrialGrantService>),
    Misconfigured(Arc<str>),
}

impl ServiceSlot {
    pub fn from_result(result: Result<TrialGrantService, TrialError>) -> Self {
        match result {
            Ok(service) => Self::Ready(Arc::new(service)),
            Err(TrialError::Configuration(reason)) => Self::Misconfigured(Arc::from(reason)),
            Err(e) => Self::Misconfigured(Arc::from(e.to_string())),
        }
    }

    pub fn service(&self) -> Result<&Arc<TrialGrantService>, TrialError> {
        match self {
            Self::Ready(service) => Ok(service),
            Self::Misconfigured(reason) => Err(TrialError::Configuration(reason.to_string())),
        }
    }
}

/// Shared application state for Axum handlers
#[derive(Clone)]
pub struct AppState {
    pub trials: ServiceSlot,
    pub identifier_source: IdentifierSource,
    pub expose_error_details: bool,
    pub clock: Clock,
}

impl AppState {
    pub fn new(trials: ServiceSlot, identifier_source: IdentifierSource) -> Self {
        Self {
            trials,
            identifier_source,
            expose_error_details: false,
            clock: system_clock(),
        }
    }

    pub fn with_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
