//! Premium key issuance and redemption
//!
//! A key is created only by `issue` and moves from unused to used exactly
//! once. Redemption marks the key used and extends the community's premium
//! window in one transaction, so a key is never burned without the
//! extension landing.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::events::{EventBus, LedgerEvent};
use crate::auth::{authorize, PermissionLevel};
use crate::clock::Clock;
use crate::config::PremiumConfig;
use crate::db::{CommunityConfig, EntityStore, PremiumKey};
use crate::error::{LedgerError, Result};

/// Characters used in generated codes (no 0/O or 1/I)
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GROUP_LEN: usize = 4;

/// Current premium state of a community
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub community_id: String,
    pub active: bool,
    pub premium_until: Option<DateTime<Utc>>,
    /// Whole days left, rounded up; 0 when inactive
    pub remaining_days: u64,
}

/// Random code like `ABCD-EFGH-JKLM-NPQR`
pub fn generate_code<R: Rng>(rng: &mut R, groups: usize) -> String {
    (0..groups)
        .map(|_| {
            (0..GROUP_LEN)
                .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical form of a user-typed code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Expiry after adding `months` to a window that currently ends at `current`.
/// An active window stacks; a lapsed or absent one starts from `now`.
pub fn extend_expiry(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    months: u32,
    days_per_month: u32,
) -> Result<DateTime<Utc>> {
    let base = match current {
        Some(until) if until > now => until,
        _ => now,
    };
    let days = i64::from(months) * i64::from(days_per_month);
    TimeDelta::try_days(days)
        .and_then(|grant| base.checked_add_signed(grant))
        .ok_or_else(|| LedgerError::AmountOverflow(format!("premium window of {} days", days)))
}

pub struct PremiumService {
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    config: PremiumConfig,
}

impl PremiumService {
    pub fn new(
        store: Arc<EntityStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: PremiumConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
        }
    }

    // =========================================================================
    // Issuance
    // =========================================================================

    /// Create an unused key for `target` worth `months` of premium.
    pub fn issue(
        &self,
        issuer_id: &str,
        level: PermissionLevel,
        target: &str,
        months: u32,
    ) -> Result<PremiumKey> {
        authorize("issue_premium_key", level)?;
        if months == 0 || months > self.config.max_months {
            return Err(LedgerError::InvalidInput(format!(
                "months must be between 1 and {}",
                self.config.max_months
            )));
        }
        if target.trim().is_empty() {
            return Err(LedgerError::InvalidTarget("empty user id".into()));
        }

        let mut rng = rand::thread_rng();
        for attempt in 1..=self.config.max_generation_attempts {
            let key = PremiumKey {
                code: generate_code(&mut rng, self.config.code_groups),
                issued_to: target.to_string(),
                issued_by: issuer_id.to_string(),
                months,
                issued_at: self.clock.now(),
                used: false,
                redeemed_for: None,
                redeemed_at: None,
            };
            if self.store.insert_new(&key.code, &key)? {
                info!(issuer_id = %issuer_id, issued_to = %target, months, "Premium key issued");
                self.events.emit(LedgerEvent::KeyIssued {
                    code: key.code.clone(),
                    issued_to: key.issued_to.clone(),
                    months,
                });
                return Ok(key);
            }
            warn!(attempt, "Generated premium key collided, retrying");
        }

        Err(LedgerError::Internal(format!(
            "no unique premium key after {} attempts",
            self.config.max_generation_attempts
        )))
    }

    // =========================================================================
    // Redemption
    // =========================================================================

    /// Burn `code` and extend the community's premium window. Returns the new
    /// expiry.
    pub fn redeem(&self, code: &str, community_id: &str) -> Result<DateTime<Utc>> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(LedgerError::KeyNotFound("empty code".into()));
        }
        if community_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("community id required".into()));
        }
        let now = self.clock.now();
        let days_per_month = self.config.days_per_month;

        let until = self.store.update_pair(
            &code,
            community_id,
            |key: &mut PremiumKey, community: &mut CommunityConfig| {
                if key.used {
                    return Err(LedgerError::KeyAlreadyUsed(key.code.clone()));
                }
                let until = extend_expiry(community.premium_until, now, key.months, days_per_month)?;
                key.used = true;
                key.redeemed_for = Some(community.community_id.clone());
                key.redeemed_at = Some(now);
                community.premium_until = Some(until);
                Ok(until)
            },
        )?;

        info!(community_id = %community_id, premium_until = %until, "Premium key redeemed");
        self.events.emit(LedgerEvent::KeyRedeemed {
            code,
            community_id: community_id.to_string(),
            premium_until: until,
        });
        Ok(until)
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn subscription_status(&self, community_id: &str) -> Result<SubscriptionStatus> {
        let now = self.clock.now();
        let premium_until = self
            .store
            .get::<CommunityConfig>(community_id)?
            .and_then(|community| community.premium_until);

        let remaining_days = match premium_until {
            Some(until) if until > now => {
                let secs = (until - now).num_seconds().max(0) as u64;
                secs.div_ceil(86_400)
            }
            _ => 0,
        };

        Ok(SubscriptionStatus {
            community_id: community_id.to_string(),
            active: remaining_days > 0,
            premium_until,
            remaining_days,
        })
    }

    pub fn get_key(&self, code: &str) -> Result<Option<PremiumKey>> {
        self.store.get(&normalize_code(code))
    }

    /// Keys issued to a user, oldest first.
    pub fn list_keys_issued_to(&self, user_id: &str) -> Result<Vec<PremiumKey>> {
        let mut keys: Vec<PremiumKey> = self
            .store
            .scan::<PremiumKey>()?
            .into_iter()
            .filter(|key| key.issued_to == user_id)
            .collect();
        keys.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.code.cmp(&b.code)));
        Ok(keys)
    }
}
