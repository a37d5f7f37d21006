//! Experience and levels
//!
//! Leaving level `L` costs `L * xp_per_level` XP. A grant is applied in a
//! loop so one large grant can cross several thresholds.

use std::sync::Arc;
use tracing::info;

use super::events::{EventBus, LedgerEvent};
use crate::db::{EntityStore, UserRecord};
use crate::error::{LedgerError, Result};

/// Result of an XP grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpGrant {
    pub levels_gained: u32,
    pub level: u32,
    pub xp: u64,
}

impl XpGrant {
    pub fn leveled_up(&self) -> bool {
        self.levels_gained > 0
    }
}

/// Add XP to an in-memory user and resolve every threshold it crosses.
pub fn apply_xp(user: &mut UserRecord, amount: u64, xp_per_level: u64) -> Result<XpGrant> {
    if xp_per_level == 0 {
        return Err(LedgerError::Config("xp_per_level must be positive".into()));
    }
    user.xp = user
        .xp
        .checked_add(amount)
        .ok_or_else(|| LedgerError::AmountOverflow(format!("xp of {}", user.user_id)))?;

    let mut levels_gained = 0;
    loop {
        let threshold = u64::from(user.level).saturating_mul(xp_per_level);
        if user.xp < threshold {
            break;
        }
        user.xp -= threshold;
        user.level = user.level.saturating_add(1);
        levels_gained += 1;
    }

    Ok(XpGrant {
        levels_gained,
        level: user.level,
        xp: user.xp,
    })
}

pub struct ProgressionService {
    store: Arc<EntityStore>,
    events: Arc<EventBus>,
    xp_per_level: u64,
}

impl ProgressionService {
    pub fn new(store: Arc<EntityStore>, events: Arc<EventBus>, xp_per_level: u64) -> Self {
        Self {
            store,
            events,
            xp_per_level,
        }
    }

    pub fn xp_per_level(&self) -> u64 {
        self.xp_per_level
    }

    /// Grant XP to a user. `leveled_up()` on the result reports whether at
    /// least one level was gained.
    pub fn add_xp(&self, user_id: &str, amount: u64) -> Result<XpGrant> {
        let grant = self.store.update(user_id, |user: &mut UserRecord| {
            apply_xp(user, amount, self.xp_per_level)
        })?;
        self.announce(user_id, &grant);
        Ok(grant)
    }

    pub(crate) fn announce(&self, user_id: &str, grant: &XpGrant) {
        if grant.leveled_up() {
            info!(user_id = %user_id, level = grant.level, "Level up");
            self.events.emit(LedgerEvent::LeveledUp {
                user_id: user_id.to_string(),
                level: grant.level,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;

    fn service() -> ProgressionService {
        let store = Arc::new(EntityStore::temporary(StoreSettings::default()).unwrap());
        ProgressionService::new(store, Arc::new(EventBus::new()), 100)
    }

    #[test]
    fn test_small_grant_no_level() {
        let service = service();
        let grant = service.add_xp("u", 99).unwrap();
        assert!(!grant.leveled_up());
        assert_eq!(grant.level, 1);
        assert_eq!(grant.xp, 99);
    }

    #[test]
    fn test_exact_threshold_levels_up() {
        let service = service();
        let grant = service.add_xp("u", 100).unwrap();
        assert_eq!(grant.level, 2);
        assert_eq!(grant.xp, 0);
    }

    #[test]
    fn test_large_grant_crosses_two_thresholds() {
        let service = service();
        // 100 to leave level 1, 200 to leave level 2, 50 left over
        let grant = service.add_xp("u", 350).unwrap();
        assert_eq!(grant.levels_gained, 2);
        assert_eq!(grant.level, 3);
        assert_eq!(grant.xp, 50);
        assert!(grant.xp < u64::from(grant.level) * 100);
    }

    #[test]
    fn test_grants_accumulate() {
        let service = service();
        service.add_xp("u", 60).unwrap();
        let grant = service.add_xp("u", 60).unwrap();
        assert_eq!(grant.level, 2);
        assert_eq!(grant.xp, 20);
    }

    #[test]
    fn test_level_up_event() {
        let service = service();
        let mut rx = service.events.subscribe();
        service.add_xp("u", 100).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            LedgerEvent::LeveledUp { user_id: "u".into(), level: 2 }
        );
    }
}
