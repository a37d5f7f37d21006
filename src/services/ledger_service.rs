//! Balance mutations
//!
//! Value moves in three ways:
//! - between a user's own wallet and bank (`deposit`, `withdraw`), net zero
//! - between two users' wallets (`transfer`), conserved across the pair
//! - in or out of the economy (`credit`, `debit`, `wager`), always explicit
//!
//! Every operation is one critical section on the entities it touches, and
//! a rejected operation writes nothing.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::events::{EventBus, LedgerEvent};
use crate::db::{EntityStore, OwnedBusiness, UserRecord};
use crate::error::{LedgerError, Result};

/// Wallet and bank after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balances {
    pub wallet: u64,
    pub bank: u64,
}

impl From<&UserRecord> for Balances {
    fn from(user: &UserRecord) -> Self {
        Self {
            wallet: user.wallet,
            bank: user.bank,
        }
    }
}

/// Both sides of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub amount: u64,
    pub sender: Balances,
    pub receiver: Balances,
}

/// How much of the wallet a wager puts at risk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stake {
    Amount(u64),
    /// The whole wallet
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WagerOutcome {
    pub stake: u64,
    pub payout: u64,
    pub wallet: u64,
}

/// Read-only view of a user for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub user_id: String,
    pub wallet: u64,
    pub bank: u64,
    pub total: u64,
    pub membership: bool,
    pub level: u32,
    pub xp: u64,
    pub job: Option<String>,
    pub streak: u32,
    pub businesses: Vec<OwnedBusiness>,
    pub inventory: BTreeMap<String, u64>,
}

impl From<UserRecord> for Profile {
    fn from(user: UserRecord) -> Self {
        Self {
            total: user.total(),
            wallet: user.wallet,
            bank: user.bank,
            membership: user.membership,
            level: user.level,
            xp: user.xp,
            job: user.job,
            streak: user.job_streak,
            businesses: user.businesses.into_values().collect(),
            inventory: user.inventory,
            user_id: user.user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub total: u64,
}

fn require_positive(amount: u64, what: &str) -> Result<()> {
    if amount == 0 {
        return Err(LedgerError::InsufficientFunds(format!(
            "{} amount must be positive",
            what
        )));
    }
    Ok(())
}

fn require_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(LedgerError::InvalidTarget("empty user id".into()));
    }
    Ok(())
}

pub struct LedgerService {
    store: Arc<EntityStore>,
    events: Arc<EventBus>,
}

impl LedgerService {
    pub fn new(store: Arc<EntityStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Current balances and holdings. Never creates the record.
    pub fn profile(&self, user_id: &str) -> Result<Profile> {
        let user = self
            .store
            .get::<UserRecord>(user_id)?
            .unwrap_or_else(|| UserRecord::new(user_id));
        Ok(user.into())
    }

    /// Users ranked by wallet + bank, richest first, ties by id.
    pub fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let mut users = self.store.scan::<UserRecord>()?;
        users.sort_by(|a, b| {
            b.total()
                .cmp(&a.total())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(users
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, user)| LeaderboardEntry {
                rank: i + 1,
                total: user.total(),
                user_id: user.user_id,
            })
            .collect())
    }

    // =========================================================================
    // Own-account Operations
    // =========================================================================

    /// Move value from wallet to bank.
    pub fn deposit(&self, user_id: &str, amount: u64) -> Result<Balances> {
        require_positive(amount, "deposit")?;
        let balances = self.store.update(user_id, |user: &mut UserRecord| {
            user.debit_wallet(amount)?;
            user.bank = user
                .bank
                .checked_add(amount)
                .ok_or_else(|| LedgerError::AmountOverflow(format!("bank of {}", user_id)))?;
            Ok(Balances::from(&*user))
        })?;

        info!(user_id = %user_id, amount, "Deposited");
        self.events.emit(LedgerEvent::Deposited {
            user_id: user_id.to_string(),
            amount,
        });
        Ok(balances)
    }

    /// Move value from bank to wallet.
    pub fn withdraw(&self, user_id: &str, amount: u64) -> Result<Balances> {
        require_positive(amount, "withdraw")?;
        let balances = self.store.update(user_id, |user: &mut UserRecord| {
            if amount > user.bank {
                return Err(LedgerError::InsufficientFunds(format!(
                    "bank holds {}, needs {}",
                    user.bank, amount
                )));
            }
            user.bank -= amount;
            user.credit_wallet(amount)?;
            Ok(Balances::from(&*user))
        })?;

        info!(user_id = %user_id, amount, "Withdrawn");
        self.events.emit(LedgerEvent::Withdrawn {
            user_id: user_id.to_string(),
            amount,
        });
        Ok(balances)
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Move `amount` from one wallet to another as a single atomic commit.
    pub fn transfer(&self, from: &str, to: &str, amount: u64) -> Result<TransferReceipt> {
        require_id(from)?;
        require_id(to)?;
        if from == to {
            return Err(LedgerError::InvalidTarget("cannot transfer to yourself".into()));
        }
        require_positive(amount, "transfer")?;

        let receipt = self.store.update_pair(
            from,
            to,
            |sender: &mut UserRecord, receiver: &mut UserRecord| {
                sender.debit_wallet(amount)?;
                receiver.credit_wallet(amount)?;
                Ok(TransferReceipt {
                    amount,
                    sender: Balances::from(&*sender),
                    receiver: Balances::from(&*receiver),
                })
            },
        )?;

        info!(from = %from, to = %to, amount, "Transferred");
        self.events.emit(LedgerEvent::Transferred {
            from: from.to_string(),
            to: to.to_string(),
            amount,
        });
        Ok(receipt)
    }

    // =========================================================================
    // Value Entry and Exit
    // =========================================================================

    /// Add new value to a wallet.
    pub fn credit(&self, user_id: &str, amount: u64, reason: &str) -> Result<Balances> {
        require_positive(amount, "credit")?;
        let balances = self.store.update(user_id, |user: &mut UserRecord| {
            user.credit_wallet(amount)?;
            Ok(Balances::from(&*user))
        })?;

        info!(user_id = %user_id, amount, reason, "Credited");
        self.events.emit(LedgerEvent::Credited {
            user_id: user_id.to_string(),
            amount,
            reason: reason.to_string(),
        });
        Ok(balances)
    }

    /// Remove value from a wallet.
    pub fn debit(&self, user_id: &str, amount: u64, reason: &str) -> Result<Balances> {
        require_positive(amount, "debit")?;
        let balances = self.store.update(user_id, |user: &mut UserRecord| {
            user.debit_wallet(amount)?;
            Ok(Balances::from(&*user))
        })?;

        info!(user_id = %user_id, amount, reason, "Debited");
        self.events.emit(LedgerEvent::Debited {
            user_id: user_id.to_string(),
            amount,
            reason: reason.to_string(),
        });
        Ok(balances)
    }

    /// Stake part of the wallet on an externally decided outcome.
    ///
    /// `resolve` receives the stake and returns the payout (0 for a loss,
    /// the stake for a push). Stake and payout settle in one update. `resolve`
    /// can run more than once if the store retries, so it should not have
    /// side effects of its own.
    pub fn wager<F>(&self, user_id: &str, stake: Stake, mut resolve: F) -> Result<WagerOutcome>
    where
        F: FnMut(u64) -> u64,
    {
        let outcome = self.store.update(user_id, |user: &mut UserRecord| {
            let stake = match stake {
                Stake::Amount(amount) => amount,
                Stake::All => user.wallet,
            };
            require_positive(stake, "wager")?;
            user.debit_wallet(stake)?;
            let payout = resolve(stake);
            user.credit_wallet(payout)?;
            Ok(WagerOutcome {
                stake,
                payout,
                wallet: user.wallet,
            })
        })?;

        info!(user_id = %user_id, stake = outcome.stake, payout = outcome.payout, "Wager settled");
        self.events.emit(LedgerEvent::WagerSettled {
            user_id: user_id.to_string(),
            stake: outcome.stake,
            payout: outcome.payout,
        });
        Ok(outcome)
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Add items, returning the new held quantity.
    pub fn add_item(&self, user_id: &str, item: &str, quantity: u64) -> Result<u64> {
        if quantity == 0 || item.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "item name and positive quantity required".into(),
            ));
        }
        self.store.update(user_id, |user: &mut UserRecord| {
            let held = user.inventory.entry(item.to_string()).or_insert(0);
            *held = held
                .checked_add(quantity)
                .ok_or_else(|| LedgerError::AmountOverflow(format!("quantity of {}", item)))?;
            Ok(*held)
        })
    }

    /// Remove items, returning what is left. An emptied entry is dropped.
    pub fn remove_item(&self, user_id: &str, item: &str, quantity: u64) -> Result<u64> {
        if quantity == 0 {
            return Err(LedgerError::InvalidInput("quantity must be positive".into()));
        }
        self.store.update(user_id, |user: &mut UserRecord| {
            let held = *user
                .inventory
                .get(item)
                .ok_or_else(|| LedgerError::NotFound(format!("item {}", item)))?;
            if held < quantity {
                return Err(LedgerError::InsufficientQuantity {
                    item: item.to_string(),
                    held,
                    wanted: quantity,
                });
            }
            let left = held - quantity;
            if left == 0 {
                user.inventory.remove(item);
            } else {
                user.inventory.insert(item.to_string(), left);
            }
            Ok(left)
        })
    }
}
