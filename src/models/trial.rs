use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Length of every trial window.
pub const TRIAL_DURATION_HOURS: i64 = 24;

pub fn trial_duration() -> Duration {
    Duration::hours(TRIAL_DURATION_HOURS)
}

/// RFC 3339 with milliseconds and a `Z` suffix, e.g. `2024-01-02T00:00:00.000Z`.
/// Used for response bodies only; sub-millisecond digits are dropped.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fixed-width RFC 3339 with nanoseconds. Lossless, and lexical order matches
/// chronological order, so stored values compare correctly as text.
pub fn format_stored_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

// ============================================================================
// TrialGrant
// ============================================================================

/// 试用授权记录，每个 identifier 最多一条
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrialGrant {
    #[serde(rename = "user_identifier")]
    pub identifier: String,
    #[serde(rename = "trial_granted_at")]
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TrialGrant {
    /// Open a fresh window starting at `now`.
    pub fn open(identifier: &str, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            granted_at: now,
            expires_at: now + trial_duration(),
        }
    }

    /// A grant is active while `now` is strictly before its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

// ============================================================================
// Decisions and lookup results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialDecision {
    /// No active grant existed; a new window was persisted.
    Granted { expires_at: DateTime<Utc> },
    /// An active grant already existed and was left untouched.
    AlreadyActive { expires_at: DateTime<Utc> },
}

impl TrialDecision {
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Self::Granted { expires_at } | Self::AlreadyActive { expires_at } => *expires_at,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Granted { .. } => AttemptOutcome::Granted,
            Self::AlreadyActive { .. } => AttemptOutcome::AlreadyActive,
        }
    }
}

/// Point lookup result. Store faults travel separately as `StoreError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialLookup {
    Found(TrialGrant),
    NotFound,
}

/// Result of the atomic insert-or-replace-if-expired write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalGrant {
    Inserted(TrialGrant),
    Active(TrialGrant),
}

// ============================================================================
// Audit log
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Granted,
    AlreadyActive,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::AlreadyActive => "already_active",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "granted" => Some(Self::Granted),
            "already_active" => Some(Self::AlreadyActive),
            _ => None,
        }
    }
}

/// 试用请求审计记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrialAttempt {
    pub id: String,
    #[serde(rename = "user_identifier")]
    pub identifier: String,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub expires_at: DateTime<Utc>,
}

impl TrialAttempt {
    pub fn record(identifier: &str, now: DateTime<Utc>, decision: &TrialDecision) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            identifier: identifier.to_string(),
            attempted_at: now,
            outcome: decision.outcome(),
            expires_at: decision.expires_at(),
        }
    }
}
