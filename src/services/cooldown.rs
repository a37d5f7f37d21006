//! Claim-at-most-once-per-window gate
//!
//! Two named policies share one primitive:
//!
//! - `Rolling { window_secs }`: allowed once `now - last >= window`
//! - `CalendarDay`: allowed once per UTC calendar date
//!
//! Which policy a reward uses is fixed in configuration (`[rewards.*]`).
//! Last-claim timestamps live on the user record, keyed by
//! `"{scope}:{reward}"` where the scope is a community id for
//! community-scoped rewards and `account` otherwise.

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::db::{EntityStore, UserRecord};
use crate::error::{LedgerError, Result};

/// How a reward's window resets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CooldownPolicy {
    /// Fixed length since the previous claim
    Rolling { window_secs: u64 },
    /// Resets at UTC midnight
    CalendarDay,
}

impl CooldownPolicy {
    /// Nominal window length; a calendar day counts as 24 hours.
    pub fn nominal_secs(&self) -> u64 {
        match self {
            CooldownPolicy::Rolling { window_secs } => *window_secs,
            CooldownPolicy::CalendarDay => 86_400,
        }
    }
}

/// Where a claim is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimScope {
    /// Separately in every community
    Community,
    /// Once for the whole account
    Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewardKind {
    Work,
    Daily,
    Weekly,
    Monthly,
    Business,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::Work => "work",
            RewardKind::Daily => "daily",
            RewardKind::Weekly => "weekly",
            RewardKind::Monthly => "monthly",
            RewardKind::Business => "business",
        }
    }
}

impl fmt::Display for RewardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "work" => Ok(RewardKind::Work),
            "daily" => Ok(RewardKind::Daily),
            "weekly" => Ok(RewardKind::Weekly),
            "monthly" => Ok(RewardKind::Monthly),
            "business" => Ok(RewardKind::Business),
            other => Err(LedgerError::InvalidInput(format!("unknown reward: {}", other))),
        }
    }
}

/// Wait before the next claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Remaining {
    pub secs: u64,
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.secs / 3600;
        let minutes = (self.secs % 3600) / 60;
        let seconds = self.secs % 60;
        if hours > 0 {
            write!(f, "{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            write!(f, "{}m {}s", minutes, seconds)
        } else {
            write!(f, "{}s", seconds)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Allowed,
    Denied(Remaining),
}

impl ClaimOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ClaimOutcome::Allowed)
    }

    /// `Denied` as a `CooldownActive` rejection.
    pub fn into_result(self) -> Result<()> {
        match self {
            ClaimOutcome::Allowed => Ok(()),
            ClaimOutcome::Denied(remaining) => Err(LedgerError::CooldownActive { remaining }),
        }
    }
}

/// Key under which a claim is recorded on the user
pub fn claim_key(scope: ClaimScope, scope_id: &str, reward: RewardKind) -> String {
    match scope {
        ClaimScope::Community => format!("{}:{}", scope_id, reward),
        ClaimScope::Account => format!("account:{}", reward),
    }
}

/// Evaluate and, if allowed, record a claim on an in-memory user.
///
/// Callers run this inside the user's critical section so the recorded
/// timestamp and whatever the claim pays are persisted together.
pub fn evaluate(
    user: &mut UserRecord,
    key: &str,
    policy: &CooldownPolicy,
    now: DateTime<Utc>,
) -> ClaimOutcome {
    if let Some(last) = user.claims.get(key) {
        if let Some(remaining) = remaining_after(*last, policy, now) {
            return ClaimOutcome::Denied(remaining);
        }
    }
    user.claims.insert(key.to_string(), now);
    ClaimOutcome::Allowed
}

/// Wait left after a claim at `last`, or None if the window has passed.
pub fn remaining_after(
    last: DateTime<Utc>,
    policy: &CooldownPolicy,
    now: DateTime<Utc>,
) -> Option<Remaining> {
    match policy {
        CooldownPolicy::Rolling { window_secs } => {
            // A clock that stepped backwards counts as no time elapsed
            let elapsed = (now - last).num_seconds().max(0) as u64;
            if elapsed >= *window_secs {
                None
            } else {
                Some(Remaining {
                    secs: window_secs - elapsed,
                })
            }
        }
        CooldownPolicy::CalendarDay => {
            if now.date_naive() > last.date_naive() {
                return None;
            }
            let next_midnight = now
                .date_naive()
                .checked_add_days(Days::new(1))
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc());
            let secs = next_midnight
                .map(|m| (m - now).num_seconds().max(0) as u64)
                .unwrap_or(0);
            Some(Remaining { secs })
        }
    }
}

/// Store-backed gate for stand-alone claims
pub struct CooldownGate {
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
}

impl CooldownGate {
    pub fn new(store: Arc<EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a claim for `(user, scope, reward)` unless its window is still open.
    pub fn try_claim(
        &self,
        user_id: &str,
        scope: ClaimScope,
        scope_id: &str,
        reward: RewardKind,
        policy: &CooldownPolicy,
    ) -> Result<ClaimOutcome> {
        let key = claim_key(scope, scope_id, reward);
        let now = self.clock.now();
        let outcome = self
            .store
            .update(user_id, |user: &mut UserRecord| Ok(evaluate(user, &key, policy, now)))?;
        if let ClaimOutcome::Denied(remaining) = outcome {
            debug!(user_id = %user_id, key = %key, remaining = %remaining, "Claim denied");
        }
        Ok(outcome)
    }

    /// Wait left for a claim without recording anything.
    pub fn peek(
        &self,
        user_id: &str,
        scope: ClaimScope,
        scope_id: &str,
        reward: RewardKind,
        policy: &CooldownPolicy,
    ) -> Result<Option<Remaining>> {
        let key = claim_key(scope, scope_id, reward);
        let now = self.clock.now();
        Ok(self
            .store
            .get::<UserRecord>(user_id)?
            .and_then(|user| user.claims.get(&key).copied())
            .and_then(|last| remaining_after(last, policy, now)))
    }
}
