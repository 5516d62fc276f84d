// Trial grant service - the check-then-grant sequence
//
// lookup(identifier) → active? → AlreadyActive(existing expiry)
//                    → absent/expired → upsert(now + 24h) → Granted

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, TrialError};
use crate::models::config::PersistenceMode;
use crate::models::trial::{ConditionalGrant, TrialAttempt, TrialDecision, TrialGrant, TrialLookup};
use crate::trial::store::SharedTrialStore;

/// Upper bound on identifier length in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 256;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct TrialServiceOptions {
    pub store_timeout: Duration,
    pub persistence: PersistenceMode,
    pub strict_single_grant: bool,
}

impl Default for TrialServiceOptions {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            persistence: PersistenceMode::Upsert,
            strict_single_grant: false,
        }
    }
}

pub struct TrialGrantService {
    store: SharedTrialStore,
    options: TrialServiceOptions,
}

impl TrialGrantService {
    pub fn new(store: SharedTrialStore, options: TrialServiceOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &SharedTrialStore {
        &self.store
    }

    /// Decide whether `identifier` gets a new trial window at `now` and
    /// persist the decision.
    pub async fn request_trial(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialDecision, TrialError> {
        validate_identifier(identifier)?;

        let result = if self.options.strict_single_grant {
            self.grant_atomically(identifier, now).await
        } else {
            self.check_then_grant(identifier, now).await
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    "[Trial] store={} identifier={} failed: {}",
                    self.store.name(),
                    identifier,
                    e
                );
                return Err(TrialError::Storage(e));
            }
        };

        match decision {
            TrialDecision::Granted { expires_at } => {
                info!("[Trial] Granted identifier={} expires_at={}", identifier, expires_at)
            }
            TrialDecision::AlreadyActive { expires_at } => {
                debug!("[Trial] Already active identifier={} expires_at={}", identifier, expires_at)
            }
        }

        if self.options.persistence == PersistenceMode::AuditLog {
            let attempt = TrialAttempt::record(identifier, now, &decision);
            if let Err(e) = self.bounded(self.store.append_attempt(&attempt)).await {
                warn!("[Trial] Failed to append attempt for {}: {}", identifier, e);
            }
        }

        Ok(decision)
    }

    /// Two store calls: read, decide, write. Concurrent callers for the same
    /// identifier may both write (last write wins).
    async fn check_then_grant(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialDecision, StoreError> {
        if let TrialLookup::Found(existing) = self.bounded(self.store.lookup(identifier)).await? {
            if existing.is_active(now) {
                return Ok(TrialDecision::AlreadyActive {
                    expires_at: existing.expires_at,
                });
            }
        }

        let grant = TrialGrant::open(identifier, now);
        self.bounded(self.store.upsert(&grant)).await?;
        Ok(TrialDecision::Granted {
            expires_at: grant.expires_at,
        })
    }

    async fn grant_atomically(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialDecision, StoreError> {
        let grant = TrialGrant::open(identifier, now);
        match self.bounded(self.store.grant_if_eligible(&grant, now)).await? {
            ConditionalGrant::Inserted(g) => Ok(TrialDecision::Granted {
                expires_at: g.expires_at,
            }),
            ConditionalGrant::Active(existing) => Ok(TrialDecision::AlreadyActive {
                expires_at: existing.expires_at,
            }),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let limit = self.options.store_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }
}

pub fn validate_identifier(identifier: &str) -> Result<(), TrialError> {
    if identifier.trim().is_empty() {
        return Err(TrialError::InvalidInput("identifier must not be empty.".to_string()));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(TrialError::InvalidInput(format!(
            "identifier exceeds {} bytes.",
            MAX_IDENTIFIER_LEN
        )));
    }
    if identifier.chars().any(char::is_control) {
        return Err(TrialError::InvalidInput(
            "identifier contains control characters.".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
