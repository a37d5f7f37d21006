//! Persisted record types
//!
//! - `UserRecord` (users tree): balances, progression, claims, holdings
//! - `CommunityConfig` (communities tree): currency, settings, premium window
//! - `PremiumKey` (premium_keys tree): single-use activation codes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{Collection, Record};
use crate::error::LedgerError;

// ============================================================================
// Users
// ============================================================================

/// A user's ledger entry. Balances are unsigned, so `wallet >= 0 && bank >= 0`
/// holds structurally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    #[serde(default)]
    pub wallet: u64,
    #[serde(default)]
    pub bank: u64,
    /// Individual premium membership
    #[serde(default)]
    pub membership: bool,
    #[serde(default)]
    pub xp: u64,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub job_streak: u32,
    /// Last claim per `"{scope}:{reward}"` key
    #[serde(default)]
    pub claims: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub businesses: BTreeMap<String, OwnedBusiness>,
    #[serde(default)]
    pub inventory: BTreeMap<String, u64>,
}

fn default_level() -> u32 {
    1
}

impl UserRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            wallet: 0,
            bank: 0,
            membership: false,
            xp: 0,
            level: 1,
            job: None,
            job_streak: 0,
            claims: BTreeMap::new(),
            businesses: BTreeMap::new(),
            inventory: BTreeMap::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.wallet.saturating_add(self.bank)
    }

    /// Add to the wallet, refusing to wrap.
    pub fn credit_wallet(&mut self, amount: u64) -> Result<(), LedgerError> {
        self.wallet = self.wallet.checked_add(amount).ok_or_else(|| {
            LedgerError::AmountOverflow(format!("wallet of {} cannot hold more", self.user_id))
        })?;
        Ok(())
    }

    /// Take from the wallet, refusing to go negative.
    pub fn debit_wallet(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount > self.wallet {
            return Err(LedgerError::InsufficientFunds(format!(
                "wallet holds {}, needs {}",
                self.wallet, amount
            )));
        }
        self.wallet -= amount;
        Ok(())
    }
}

impl Record for UserRecord {
    const COLLECTION: Collection = Collection::Users;

    fn fresh(id: &str) -> Option<Self> {
        Some(Self::new(id))
    }
}

/// Snapshot of a catalog business taken at purchase time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedBusiness {
    pub name: String,
    pub profit: u64,
    pub upkeep: u64,
    pub tier: u8,
    /// Price paid
    pub cost: u64,
    pub purchased_at: DateTime<Utc>,
    /// Upkeep has been billed up to this instant
    pub upkeep_paid_through: DateTime<Utc>,
    /// Billed upkeep the owner could not cover yet
    #[serde(default)]
    pub arrears: u64,
}

// ============================================================================
// Communities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityConfig {
    pub community_id: String,
    #[serde(default = "default_currency_name")]
    pub currency_name: String,
    #[serde(default = "default_currency_symbol")]
    pub currency_symbol: String,
    #[serde(default)]
    pub starting_balance: u64,
    /// Percent, 0..=100
    #[serde(default)]
    pub tax_rate: u8,
    #[serde(default)]
    pub custom_prefix: Option<String>,
    #[serde(default)]
    pub disabled_commands: BTreeSet<String>,
    /// Only ever moved forward by key redemption
    #[serde(default)]
    pub premium_until: Option<DateTime<Utc>>,
}

fn default_currency_name() -> String {
    "Coins".to_string()
}

fn default_currency_symbol() -> String {
    "$".to_string()
}

impl CommunityConfig {
    pub fn new(community_id: impl Into<String>) -> Self {
        Self {
            community_id: community_id.into(),
            currency_name: default_currency_name(),
            currency_symbol: default_currency_symbol(),
            starting_balance: 0,
            tax_rate: 0,
            custom_prefix: None,
            disabled_commands: BTreeSet::new(),
            premium_until: None,
        }
    }

    pub fn is_premium_at(&self, now: DateTime<Utc>) -> bool {
        self.premium_until.is_some_and(|until| until > now)
    }
}

impl Record for CommunityConfig {
    const COLLECTION: Collection = Collection::Communities;

    fn fresh(id: &str) -> Option<Self> {
        Some(Self::new(id))
    }
}

// ============================================================================
// Premium keys
// ============================================================================

/// Single-use activation code. `used` goes false -> true exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremiumKey {
    pub code: String,
    pub issued_to: String,
    pub issued_by: String,
    pub months: u32,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub redeemed_for: Option<String>,
    #[serde(default)]
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl Record for PremiumKey {
    const COLLECTION: Collection = Collection::PremiumKeys;

    /// Keys only come into existence through issuance.
    fn fresh(_id: &str) -> Option<Self> {
        None
    }

    fn missing(id: &str) -> LedgerError {
        LedgerError::KeyNotFound(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_user_defaults() {
        let user = UserRecord::fresh("42").unwrap();
        assert_eq!(user.wallet, 0);
        assert_eq!(user.bank, 0);
        assert_eq!(user.level, 1);
        assert!(user.job.is_none());
    }

    #[test]
    fn test_debit_wallet_refuses_overdraw() {
        let mut user = UserRecord::new("1");
        user.wallet = 10;
        assert!(matches!(
            user.debit_wallet(11),
            Err(LedgerError::InsufficientFunds(_))
        ));
        assert_eq!(user.wallet, 10);
        user.debit_wallet(10).unwrap();
        assert_eq!(user.wallet, 0);
    }

    #[test]
    fn test_credit_wallet_refuses_overflow() {
        let mut user = UserRecord::new("1");
        user.wallet = u64::MAX;
        assert!(matches!(
            user.credit_wallet(1),
            Err(LedgerError::AmountOverflow(_))
        ));
    }

    #[test]
    fn test_premium_keys_are_never_created_lazily() {
        assert!(PremiumKey::fresh("ABCD").is_none());
        assert!(matches!(
            PremiumKey::missing("ABCD"),
            LedgerError::KeyNotFound(_)
        ));
    }

    #[test]
    fn test_premium_window() {
        let now = Utc::now();
        let mut community = CommunityConfig::new("g1");
        assert!(!community.is_premium_at(now));
        community.premium_until = Some(now + chrono::TimeDelta::days(1));
        assert!(community.is_premium_at(now));
        assert!(!community.is_premium_at(now + chrono::TimeDelta::days(2)));
    }

    #[test]
    fn test_old_records_decode_with_defaults() {
        #[derive(Serialize)]
        struct Legacy {
            user_id: String,
            wallet: u64,
        }
        let bytes = rmp_serde::to_vec_named(&Legacy { user_id: "7".into(), wallet: 5 }).unwrap();
        let user: UserRecord = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(user.wallet, 5);
        assert_eq!(user.level, 1);
        assert!(user.claims.is_empty());
    }
}
