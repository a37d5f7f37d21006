//! Businesses: purchase, profit collection and upkeep
//!
//! A purchase stores a snapshot of the catalog entry, so later catalog
//! edits never reach businesses already owned.
//!
//! Upkeep is billed per elapsed period (`[upkeep] interval_secs`) by
//! `charge_upkeep`, independently of collection. The bill is paid from the
//! wallet, then the bank; whatever cannot be paid accrues as arrears on the
//! business and is settled out of the next collection's gross profit.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cooldown::{claim_key, evaluate, RewardKind};
use super::events::{EventBus, LedgerEvent};
use super::with_bonus;
use crate::clock::Clock;
use crate::config::{BusinessSpec, Config};
use crate::db::{EntityStore, OwnedBusiness, UserRecord};
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct CollectReceipt {
    /// Profit before arrears, membership bonus included
    pub gross: u64,
    pub bonus: u64,
    pub arrears_settled: u64,
    /// Amount credited to the wallet
    pub net: u64,
    pub wallet: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct UpkeepReceipt {
    /// Upkeep billed this run
    pub billed: u64,
    pub paid: u64,
    /// Part of this run's bill that became arrears
    pub arrears_added: u64,
    /// Outstanding arrears across all businesses afterwards
    pub arrears_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct UpkeepSummary {
    pub owners_visited: usize,
    pub billed: u64,
    pub paid: u64,
    pub arrears_added: u64,
}

/// Bill every full upkeep period elapsed since each business was last billed.
pub fn bill_upkeep(user: &mut UserRecord, now: DateTime<Utc>, interval_secs: u64) -> Result<UpkeepReceipt> {
    let interval = i64::try_from(interval_secs)
        .ok()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| LedgerError::Config("upkeep interval out of range".into()))?;

    let mut receipt = UpkeepReceipt::default();
    for business in user.businesses.values_mut() {
        let elapsed = (now - business.upkeep_paid_through).num_seconds();
        let periods = elapsed.max(0) / interval;
        if periods == 0 {
            continue;
        }

        let advance = periods
            .checked_mul(interval)
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| LedgerError::Internal("upkeep period out of range".into()))?;
        business.upkeep_paid_through = business
            .upkeep_paid_through
            .checked_add_signed(advance)
            .ok_or_else(|| LedgerError::Internal("upkeep period out of range".into()))?;

        let due = business
            .upkeep
            .checked_mul(periods as u64)
            .ok_or_else(|| LedgerError::AmountOverflow(format!("upkeep of {}", business.name)))?;

        let from_wallet = due.min(user.wallet);
        user.wallet -= from_wallet;
        let from_bank = (due - from_wallet).min(user.bank);
        user.bank -= from_bank;
        let unpaid = due - from_wallet - from_bank;
        business.arrears = business.arrears.saturating_add(unpaid);

        receipt.billed = receipt.billed.saturating_add(due);
        receipt.paid = receipt.paid.saturating_add(from_wallet + from_bank);
        receipt.arrears_added = receipt.arrears_added.saturating_add(unpaid);
    }
    receipt.arrears_total = user
        .businesses
        .values()
        .fold(0u64, |sum, b| sum.saturating_add(b.arrears));
    Ok(receipt)
}

pub struct BusinessService {
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    config: Arc<Config>,
}

impl BusinessService {
    pub fn new(
        store: Arc<EntityStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
        }
    }

    /// Static business catalog
    pub fn catalog(&self) -> &BTreeMap<String, BusinessSpec> {
        &self.config.businesses
    }

    pub fn owned(&self, user_id: &str) -> Result<Vec<OwnedBusiness>> {
        Ok(self
            .store
            .get::<UserRecord>(user_id)?
            .map(|user| user.businesses.into_values().collect())
            .unwrap_or_default())
    }

    /// Buy a catalog business for its current price.
    pub fn purchase(&self, user_id: &str, business: &str) -> Result<OwnedBusiness> {
        let entry = self
            .config
            .businesses
            .get(business)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("business {}", business)))?;
        let now = self.clock.now();

        let owned = self.store.update(user_id, |user: &mut UserRecord| {
            if user.businesses.contains_key(business) {
                return Err(LedgerError::AlreadyOwned(business.to_string()));
            }
            user.debit_wallet(entry.cost)?;
            let owned = OwnedBusiness {
                name: business.to_string(),
                profit: entry.profit,
                upkeep: entry.upkeep,
                tier: entry.tier,
                cost: entry.cost,
                purchased_at: now,
                upkeep_paid_through: now,
                arrears: 0,
            };
            user.businesses.insert(business.to_string(), owned.clone());
            Ok(owned)
        })?;

        info!(user_id = %user_id, business, cost = entry.cost, "Business purchased");
        self.events.emit(LedgerEvent::BusinessPurchased {
            user_id: user_id.to_string(),
            business: business.to_string(),
            cost: entry.cost,
        });
        Ok(owned)
    }

    /// Collect profit from every owned business.
    ///
    /// Gated by the `business` reward rule. Members get a bonus on businesses
    /// at or above the configured tier. Outstanding arrears come out of the
    /// gross before the rest is credited. Owning nothing collects zero.
    pub fn collect(&self, user_id: &str) -> Result<CollectReceipt> {
        let rule = &self.config.rewards.business;
        let key = claim_key(rule.scope, "", RewardKind::Business);
        let perks = &self.config.membership;
        let now = self.clock.now();

        let receipt = self.store.update(user_id, |user: &mut UserRecord| {
            if user.businesses.is_empty() {
                // Nothing to collect; the cooldown is left unspent
                return Ok(CollectReceipt {
                    wallet: user.wallet,
                    ..CollectReceipt::default()
                });
            }
            evaluate(user, &key, &rule.policy, now).into_result()?;

            let mut receipt = CollectReceipt::default();
            for business in user.businesses.values() {
                let mut profit = business.profit;
                if user.membership && business.tier >= perks.business_bonus_min_tier {
                    profit = with_bonus(profit, perks.business_bonus_pct)?;
                    receipt.bonus = receipt.bonus.saturating_add(profit - business.profit);
                }
                receipt.gross = receipt
                    .gross
                    .checked_add(profit)
                    .ok_or_else(|| LedgerError::AmountOverflow("business profit".into()))?;
            }

            let mut available = receipt.gross;
            for business in user.businesses.values_mut() {
                let settled = business.arrears.min(available);
                business.arrears -= settled;
                available -= settled;
                receipt.arrears_settled += settled;
            }

            receipt.net = available;
            user.credit_wallet(receipt.net)?;
            receipt.wallet = user.wallet;
            Ok(receipt)
        })?;
        if receipt.gross == 0 {
            return Ok(receipt);
        }

        info!(
            user_id = %user_id,
            gross = receipt.gross,
            net = receipt.net,
            arrears_settled = receipt.arrears_settled,
            "Profit collected"
        );
        self.events.emit(LedgerEvent::ProfitCollected {
            user_id: user_id.to_string(),
            amount: receipt.net,
        });
        Ok(receipt)
    }

    // =========================================================================
    // Upkeep
    // =========================================================================

    /// Bill one user's elapsed upkeep. Users without businesses are untouched.
    pub fn charge_upkeep(&self, user_id: &str) -> Result<UpkeepReceipt> {
        let has_businesses = self
            .store
            .get::<UserRecord>(user_id)?
            .is_some_and(|user| !user.businesses.is_empty());
        if !has_businesses {
            return Ok(UpkeepReceipt::default());
        }

        let now = self.clock.now();
        let interval_secs = self.config.upkeep.interval_secs;
        let receipt = self.store.update(user_id, |user: &mut UserRecord| {
            bill_upkeep(user, now, interval_secs)
        })?;

        if receipt.billed > 0 {
            info!(
                user_id = %user_id,
                billed = receipt.billed,
                paid = receipt.paid,
                arrears_added = receipt.arrears_added,
                "Upkeep charged"
            );
            self.events.emit(LedgerEvent::UpkeepCharged {
                user_id: user_id.to_string(),
                paid: receipt.paid,
                arrears: receipt.arrears_added,
            });
        } else {
            debug!(user_id = %user_id, "No upkeep due");
        }
        Ok(receipt)
    }

    /// Bill every business owner. Each owner is its own critical section; a
    /// failure for one owner is logged and the cycle moves on.
    pub fn run_upkeep_cycle(&self) -> Result<UpkeepSummary> {
        let owners: Vec<String> = self
            .store
            .scan::<UserRecord>()?
            .into_iter()
            .filter(|user| !user.businesses.is_empty())
            .map(|user| user.user_id)
            .collect();

        let mut summary = UpkeepSummary::default();
        for user_id in owners {
            match self.charge_upkeep(&user_id) {
                Ok(receipt) => {
                    summary.owners_visited += 1;
                    summary.billed = summary.billed.saturating_add(receipt.billed);
                    summary.paid = summary.paid.saturating_add(receipt.paid);
                    summary.arrears_added = summary.arrears_added.saturating_add(receipt.arrears_added);
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Upkeep charge failed");
                }
            }
        }

        info!(
            owners = summary.owners_visited,
            billed = summary.billed,
            paid = summary.paid,
            "Upkeep cycle complete"
        );
        Ok(summary)
    }
}
