//! Service layer for vrtex-ledger
//!
//! Services hold the economy rules between the command front-end and the
//! entity store. Each service wraps store operations with:
//! - Input validation and permission checks
//! - Critical sections scoped to the entities touched
//! - Event emission for audit/notifications
//!
//! ## Architecture
//!
//! ```text
//! Command front-end (thin adapter)
//!     ↓
//! PolicyService::ensure_enabled (command gate)
//!     ↓
//! Service Layer (ledger, rewards, business, premium)
//!     ↓
//! EntityStore (db/)
//!     ↓
//! sled
//! ```

pub mod events;
pub mod cooldown;
pub mod ledger_service;
pub mod progression_service;
pub mod reward_service;
pub mod business_service;
pub mod premium_service;
pub mod policy_service;

// Re-exports
pub use events::{EventBus, LedgerEvent};
pub use cooldown::{ClaimOutcome, ClaimScope, CooldownGate, CooldownPolicy, Remaining, RewardKind};
pub use ledger_service::{Balances, LedgerService, Profile, Stake, TransferReceipt, WagerOutcome};
pub use progression_service::{ProgressionService, XpGrant};
pub use reward_service::{ClaimReceipt, RewardService, WorkReceipt};
pub use business_service::{BusinessService, CollectReceipt, UpkeepReceipt, UpkeepSummary};
pub use premium_service::{PremiumService, SubscriptionStatus};
pub use policy_service::PolicyService;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::EntityStore;
use crate::error::{LedgerError, Result};

/// `amount` increased by `pct` percent, rounded down.
pub(crate) fn with_bonus(amount: u64, pct: u64) -> Result<u64> {
    let scaled = u128::from(amount) * (100 + u128::from(pct)) / 100;
    u64::try_from(scaled).map_err(|_| LedgerError::AmountOverflow(format!("{} plus {}%", amount, pct)))
}

/// Service container for dependency injection
///
/// Holds all services over one shared store, clock and event bus.
pub struct Economy {
    pub store: Arc<EntityStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    pub events: Arc<EventBus>,
    pub ledger: Arc<LedgerService>,
    pub cooldowns: Arc<CooldownGate>,
    pub progression: Arc<ProgressionService>,
    pub rewards: Arc<RewardService>,
    pub business: Arc<BusinessService>,
    pub premium: Arc<PremiumService>,
    pub policy: Arc<PolicyService>,
}

impl Economy {
    /// Create all services with a shared store
    pub fn new(store: Arc<EntityStore>, clock: Arc<dyn Clock>, config: Config) -> Self {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let progression = Arc::new(ProgressionService::new(
            store.clone(),
            events.clone(),
            config.progression.xp_per_level,
        ));

        Self {
            ledger: Arc::new(LedgerService::new(store.clone(), events.clone())),
            cooldowns: Arc::new(CooldownGate::new(store.clone(), clock.clone())),
            rewards: Arc::new(RewardService::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                config.clone(),
                progression.clone(),
            )),
            business: Arc::new(BusinessService::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                config.clone(),
            )),
            premium: Arc::new(PremiumService::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                config.premium.clone(),
            )),
            policy: Arc::new(PolicyService::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                config.toggleable_commands.clone(),
            )),
            progression,
            store,
            clock,
            config,
            events,
        }
    }

    /// Open the store named by `config` and wire services to the system clock.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(EntityStore::open(config.db_path(), config.store.clone())?);
        Ok(Self::new(store, Arc::new(SystemClock), config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;
    use tempfile::TempDir;

    #[test]
    fn test_with_bonus() {
        assert_eq!(with_bonus(1000, 25).unwrap(), 1250);
        assert_eq!(with_bonus(999, 0).unwrap(), 999);
        assert_eq!(with_bonus(3, 50).unwrap(), 4);
        assert!(matches!(with_bonus(u64::MAX, 1), Err(LedgerError::AmountOverflow(_))));
    }

    #[test]
    fn test_services_share_one_store() {
        let store = Arc::new(EntityStore::temporary(StoreSettings::default()).unwrap());
        let economy = Economy::new(store, Arc::new(SystemClock), Config::default());
        economy.ledger.credit("u", 50, "test").unwrap();
        assert_eq!(economy.ledger.profile("u").unwrap().wallet, 50);
        assert_eq!(economy.business.owned("u").unwrap().len(), 0);
    }

    #[test]
    fn test_open_uses_configured_directory() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            storage_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        let economy = Economy::open(config).unwrap();
        economy.policy.on_community_join("g1").unwrap();
        assert!(temp_dir.path().join("ledger.sled").exists());
    }
}
