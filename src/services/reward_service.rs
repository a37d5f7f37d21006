//! Timed rewards and jobs
//!
//! `work` is the per-community hourly claim; `claim` covers the daily,
//! weekly and monthly account payouts. The cooldown check, the payout and
//! the XP grant for one claim are a single user update.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::cooldown::{claim_key, evaluate, ClaimOutcome, ClaimScope, RewardKind};
use super::events::{EventBus, LedgerEvent};
use super::progression_service::{apply_xp, ProgressionService, XpGrant};
use super::with_bonus;
use crate::clock::Clock;
use crate::config::{Config, JobSpec, RewardRule};
use crate::db::{EntityStore, UserRecord};
use crate::error::{LedgerError, Result};

/// What a work claim paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkReceipt {
    /// Salary or base pay before bonuses
    pub base: u64,
    pub amount: u64,
    pub streak: u32,
    pub streak_bonus_pct: u64,
    pub level: u32,
    pub leveled_up: bool,
}

/// What a daily/weekly/monthly claim paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClaimReceipt {
    pub amount: u64,
    pub level: u32,
    pub leveled_up: bool,
}

pub struct RewardService {
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    config: Arc<Config>,
    progression: Arc<ProgressionService>,
}

impl RewardService {
    pub fn new(
        store: Arc<EntityStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: Arc<Config>,
        progression: Arc<ProgressionService>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
            progression,
        }
    }

    fn scope_key(rule: &RewardRule, community_id: &str, kind: RewardKind) -> Result<String> {
        if rule.scope == ClaimScope::Community && community_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput(format!(
                "{} is tracked per community; a community id is required",
                kind
            )));
        }
        Ok(claim_key(rule.scope, community_id, kind))
    }

    /// Streak after a claim at `now` following one at `previous`. A gap of more
    /// than two windows starts over.
    fn next_streak(
        streak: u32,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        window_secs: u64,
    ) -> u32 {
        match previous {
            Some(last) => {
                let gap = (now - last).num_seconds().max(0) as u64;
                if gap <= window_secs.saturating_mul(2) {
                    streak.saturating_add(1)
                } else {
                    1
                }
            }
            None => 1,
        }
    }

    fn streak_bonus_pct(&self, streak: u32) -> u64 {
        (u64::from(streak) * self.config.streak.bonus_pct_per_step).min(self.config.streak.max_bonus_pct)
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Hourly work claim in a community.
    ///
    /// Pays the job salary (or the base amount without a job), plus the
    /// membership bonus and the streak bonus.
    pub fn work(&self, user_id: &str, community_id: &str) -> Result<WorkReceipt> {
        let rule = &self.config.rewards.work;
        let key = Self::scope_key(rule, community_id, RewardKind::Work)?;
        let now = self.clock.now();

        let (receipt, grant) = self.store.update(user_id, |user: &mut UserRecord| {
            let previous = user.claims.get(&key).copied();
            evaluate(user, &key, &rule.policy, now).into_result()?;

            let base = user
                .job
                .as_ref()
                .and_then(|job| self.config.jobs.get(job))
                .map(|entry| entry.salary)
                .unwrap_or(rule.amount);

            user.job_streak =
                Self::next_streak(user.job_streak, previous, now, rule.policy.nominal_secs());
            let streak_bonus_pct = self.streak_bonus_pct(user.job_streak);

            let mut amount = base;
            if user.membership {
                amount = with_bonus(amount, self.config.membership.work_bonus_pct)?;
            }
            amount = with_bonus(amount, streak_bonus_pct)?;
            user.credit_wallet(amount)?;

            let grant = apply_xp(user, rule.xp, self.progression.xp_per_level())?;
            Ok((
                WorkReceipt {
                    base,
                    amount,
                    streak: user.job_streak,
                    streak_bonus_pct,
                    level: grant.level,
                    leveled_up: grant.leveled_up(),
                },
                grant,
            ))
        })?;

        info!(
            user_id = %user_id,
            community_id = %community_id,
            amount = receipt.amount,
            streak = receipt.streak,
            "Work claimed"
        );
        self.finish(user_id, RewardKind::Work, receipt.amount, &grant);
        Ok(receipt)
    }

    /// Daily, weekly or monthly account payout.
    pub fn claim(&self, user_id: &str, kind: RewardKind) -> Result<ClaimReceipt> {
        if matches!(kind, RewardKind::Work | RewardKind::Business) {
            return Err(LedgerError::InvalidInput(format!(
                "{} is not a periodic payout",
                kind
            )));
        }
        let rule = self.config.rewards.rule(kind);
        let key = Self::scope_key(rule, "", kind)?;
        let now = self.clock.now();

        let (receipt, grant) = self.store.update(user_id, |user: &mut UserRecord| {
            if let ClaimOutcome::Denied(remaining) = evaluate(user, &key, &rule.policy, now) {
                return Err(LedgerError::CooldownActive { remaining });
            }
            user.credit_wallet(rule.amount)?;
            let grant = apply_xp(user, rule.xp, self.progression.xp_per_level())?;
            Ok((
                ClaimReceipt {
                    amount: rule.amount,
                    level: grant.level,
                    leveled_up: grant.leveled_up(),
                },
                grant,
            ))
        })?;

        info!(user_id = %user_id, reward = %kind, amount = receipt.amount, "Reward claimed");
        self.finish(user_id, kind, receipt.amount, &grant);
        Ok(receipt)
    }

    fn finish(&self, user_id: &str, kind: RewardKind, amount: u64, grant: &XpGrant) {
        self.events.emit(LedgerEvent::RewardClaimed {
            user_id: user_id.to_string(),
            reward: kind.to_string(),
            amount,
        });
        self.progression.announce(user_id, grant);
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Static job catalog
    pub fn jobs(&self) -> impl Iterator<Item = (&String, &JobSpec)> {
        self.config.jobs.iter()
    }

    /// Start a job. Changing jobs restarts the streak.
    pub fn take_job(&self, user_id: &str, job: &str) -> Result<JobSpec> {
        let entry = self
            .config
            .jobs
            .get(job)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("job {}", job)))?;

        self.store.update(user_id, |user: &mut UserRecord| {
            if user.job.as_deref() == Some(job) {
                return Err(LedgerError::AlreadyOwned(format!("already working as {}", job)));
            }
            if user.level < entry.required_level {
                return Err(LedgerError::RequirementNotMet(format!(
                    "{} requires level {}, you are level {}",
                    job, entry.required_level, user.level
                )));
            }
            user.job = Some(job.to_string());
            user.job_streak = 0;
            Ok(())
        })?;

        info!(user_id = %user_id, job, "Job taken");
        self.events.emit(LedgerEvent::JobChanged {
            user_id: user_id.to_string(),
            job: Some(job.to_string()),
        });
        Ok(entry)
    }

    /// Leave the current job, returning its name.
    pub fn quit_job(&self, user_id: &str) -> Result<String> {
        let job = self.store.update(user_id, |user: &mut UserRecord| {
            let job = user
                .job
                .take()
                .ok_or_else(|| LedgerError::NotFound("no current job".into()))?;
            user.job_streak = 0;
            Ok(job)
        })?;

        info!(user_id = %user_id, job = %job, "Job quit");
        self.events.emit(LedgerEvent::JobChanged {
            user_id: user_id.to_string(),
            job: None,
        });
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreSettings;

    struct Fixture {
        rewards: RewardService,
        store: Arc<EntityStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(EntityStore::temporary(StoreSettings::default()).unwrap());
        let clock = Arc::new(ManualClock::at_epoch());
        let events = Arc::new(EventBus::new());
        let config = Arc::new(Config::default());
        let progression = Arc::new(ProgressionService::new(
            store.clone(),
            events.clone(),
            config.progression.xp_per_level,
        ));
        let rewards = RewardService::new(store.clone(), clock.clone(), events, config, progression);
        Fixture { rewards, store, clock }
    }

    fn wallet(store: &EntityStore, user: &str) -> u64 {
        store.get::<UserRecord>(user).unwrap().map(|u| u.wallet).unwrap_or(0)
    }

    #[test]
    fn test_first_work_pays_base_with_first_streak_step() {
        let f = fixture();
        let receipt = f.rewards.work("u", "g1").unwrap();
        assert_eq!(receipt.base, 1000);
        assert_eq!(receipt.streak, 1);
        assert_eq!(receipt.streak_bonus_pct, 2);
        assert_eq!(receipt.amount, 1020);
        assert_eq!(wallet(&f.store, "u"), 1020);
    }

    #[test]
    fn test_work_inside_window_is_denied_and_pays_nothing() {
        let f = fixture();
        f.rewards.work("u", "g1").unwrap();
        f.clock.advance_secs(1800);
        let err = f.rewards.work("u", "g1").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::CooldownActive { remaining } if remaining.secs == 1800
        ));
        assert_eq!(wallet(&f.store, "u"), 1020);
    }

    #[test]
    fn test_work_is_tracked_per_community() {
        let f = fixture();
        f.rewards.work("u", "g1").unwrap();
        assert!(f.rewards.work("u", "g2").is_ok());
        assert!(matches!(f.rewards.work("u", ""), Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn test_streak_grows_then_resets_after_long_gap() {
        let f = fixture();
        f.rewards.work("u", "g1").unwrap();
        f.clock.advance_secs(3600);
        assert_eq!(f.rewards.work("u", "g1").unwrap().streak, 2);
        f.clock.advance_secs(3 * 3600);
        assert_eq!(f.rewards.work("u", "g1").unwrap().streak, 1);
    }

    #[test]
    fn test_job_salary_and_membership_bonus() {
        let f = fixture();
        f.rewards.take_job("u", "Cashier").unwrap();
        f.store
            .update("u", |user: &mut UserRecord| {
                user.membership = true;
                Ok(())
            })
            .unwrap();
        let receipt = f.rewards.work("u", "g1").unwrap();
        // 1000 salary, +25% membership = 1250, +2% streak = 1275
        assert_eq!(receipt.base, 1000);
        assert_eq!(receipt.amount, 1275);
    }

    #[test]
    fn test_job_level_requirement() {
        let f = fixture();
        assert!(matches!(
            f.rewards.take_job("u", "Engineer"),
            Err(LedgerError::RequirementNotMet(_))
        ));
        assert!(matches!(f.rewards.take_job("u", "Astronaut"), Err(LedgerError::NotFound(_))));
        f.rewards.take_job("u", "Cashier").unwrap();
        assert!(matches!(f.rewards.take_job("u", "Cashier"), Err(LedgerError::AlreadyOwned(_))));
        assert_eq!(f.rewards.quit_job("u").unwrap(), "Cashier");
        assert!(matches!(f.rewards.quit_job("u"), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_daily_then_next_day() {
        let f = fixture();
        assert_eq!(f.rewards.claim("u", RewardKind::Daily).unwrap().amount, 500);
        assert!(matches!(
            f.rewards.claim("u", RewardKind::Daily),
            Err(LedgerError::CooldownActive { .. })
        ));
        f.clock.advance_secs(86_400);
        assert!(f.rewards.claim("u", RewardKind::Daily).is_ok());
        assert_eq!(wallet(&f.store, "u"), 1000);
    }

    #[test]
    fn test_monthly_grants_xp_and_levels() {
        let f = fixture();
        // 150 XP from level 1: one threshold at 100
        let receipt = f.rewards.claim("u", RewardKind::Monthly).unwrap();
        assert!(receipt.leveled_up);
        assert_eq!(receipt.level, 2);
    }

    #[test]
    fn test_claim_rejects_non_periodic_kinds() {
        let f = fixture();
        assert!(matches!(
            f.rewards.claim("u", RewardKind::Work),
            Err(LedgerError::InvalidInput(_))
        ));
    }
}
