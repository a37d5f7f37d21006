//! Per-community settings and the command gate
//!
//! `ensure_enabled` is consulted before any command executes. Every setter
//! checks the caller's permission level before touching the store.

use std::sync::Arc;
use tracing::info;

use super::events::{EventBus, LedgerEvent};
use crate::auth::{authorize, PermissionLevel};
use crate::clock::Clock;
use crate::db::{CommunityConfig, EntityStore, UserRecord};
use crate::error::{LedgerError, Result};

const MAX_CURRENCY_NAME: usize = 40;
const MAX_CURRENCY_SYMBOL: usize = 6;
const MAX_PREFIX: usize = 10;

pub struct PolicyService {
    store: Arc<EntityStore>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    toggleable: Vec<String>,
}

impl PolicyService {
    pub fn new(
        store: Arc<EntityStore>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        toggleable: Vec<String>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            toggleable,
        }
    }

    /// Commands a manager may switch off
    pub fn toggleable_commands(&self) -> &[String] {
        &self.toggleable
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Current settings, defaults if the community was never seen.
    pub fn community(&self, community_id: &str) -> Result<CommunityConfig> {
        Ok(self
            .store
            .get::<CommunityConfig>(community_id)?
            .unwrap_or_else(|| CommunityConfig::new(community_id)))
    }

    /// Reject with `CommandDisabled` if `command` is switched off here.
    pub fn ensure_enabled(&self, community_id: &str, command: &str) -> Result<()> {
        let disabled = self
            .store
            .get::<CommunityConfig>(community_id)?
            .is_some_and(|community| community.disabled_commands.contains(command));
        if disabled {
            return Err(LedgerError::CommandDisabled(command.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Create the community's settings record if it does not exist yet.
    pub fn on_community_join(&self, community_id: &str) -> Result<CommunityConfig> {
        if community_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("community id required".into()));
        }
        let community = self.store.get_or_create::<CommunityConfig>(community_id)?;
        info!(community_id = %community_id, "Community registered");
        Ok(community)
    }

    pub fn set_currency(
        &self,
        community_id: &str,
        level: PermissionLevel,
        name: &str,
        symbol: &str,
    ) -> Result<()> {
        authorize("set_currency", level)?;
        let name = name.trim();
        let symbol = symbol.trim();
        if name.is_empty() || name.chars().count() > MAX_CURRENCY_NAME {
            return Err(LedgerError::InvalidInput(format!(
                "currency name must be 1 to {} characters",
                MAX_CURRENCY_NAME
            )));
        }
        if symbol.chars().count() > MAX_CURRENCY_SYMBOL {
            return Err(LedgerError::InvalidInput(format!(
                "currency symbol must be at most {} characters",
                MAX_CURRENCY_SYMBOL
            )));
        }

        self.store.update(community_id, |community: &mut CommunityConfig| {
            community.currency_name = name.to_string();
            community.currency_symbol = symbol.to_string();
            Ok(())
        })?;
        self.changed(community_id, "currency");
        Ok(())
    }

    pub fn set_starting_balance(
        &self,
        community_id: &str,
        level: PermissionLevel,
        amount: u64,
    ) -> Result<()> {
        authorize("set_starting_balance", level)?;
        self.store.update(community_id, |community: &mut CommunityConfig| {
            community.starting_balance = amount;
            Ok(())
        })?;
        self.changed(community_id, "starting_balance");
        Ok(())
    }

    /// Percent, 0 to 100
    pub fn set_tax_rate(&self, community_id: &str, level: PermissionLevel, rate: u8) -> Result<()> {
        authorize("set_tax_rate", level)?;
        if rate > 100 {
            return Err(LedgerError::InvalidInput("tax rate must be 0 to 100".into()));
        }
        self.store.update(community_id, |community: &mut CommunityConfig| {
            community.tax_rate = rate;
            Ok(())
        })?;
        self.changed(community_id, "tax_rate");
        Ok(())
    }

    /// Set or clear the custom prefix. Setting one needs active community premium.
    pub fn set_prefix(
        &self,
        community_id: &str,
        level: PermissionLevel,
        prefix: Option<&str>,
    ) -> Result<()> {
        authorize("set_prefix", level)?;
        let prefix = prefix.map(str::trim);
        if let Some(p) = prefix {
            if p.is_empty() || p.chars().count() > MAX_PREFIX || p.contains(char::is_whitespace) {
                return Err(LedgerError::InvalidInput(format!(
                    "prefix must be 1 to {} characters without spaces",
                    MAX_PREFIX
                )));
            }
        }
        let now = self.clock.now();

        self.store.update(community_id, |community: &mut CommunityConfig| {
            if prefix.is_some() && !community.is_premium_at(now) {
                return Err(LedgerError::PremiumRequired("custom prefix".into()));
            }
            community.custom_prefix = prefix.map(str::to_string);
            Ok(())
        })?;
        self.changed(community_id, "prefix");
        Ok(())
    }

    /// Flip a command between enabled and disabled. Returns true if it is
    /// now enabled.
    pub fn toggle_command(
        &self,
        community_id: &str,
        level: PermissionLevel,
        command: &str,
    ) -> Result<bool> {
        authorize("toggle_command", level)?;
        let command = command.trim().to_ascii_lowercase();
        if !self.toggleable.iter().any(|c| *c == command) {
            return Err(LedgerError::InvalidInput(format!(
                "{} cannot be toggled",
                command
            )));
        }

        let enabled = self.store.update(community_id, |community: &mut CommunityConfig| {
            if community.disabled_commands.remove(&command) {
                Ok(true)
            } else {
                community.disabled_commands.insert(command.clone());
                Ok(false)
            }
        })?;

        info!(community_id = %community_id, command = %command, enabled, "Command toggled");
        self.changed(community_id, "disabled_commands");
        Ok(enabled)
    }

    /// Grant or revoke an individual premium membership.
    pub fn set_membership(&self, user_id: &str, level: PermissionLevel, membership: bool) -> Result<()> {
        authorize("set_membership", level)?;
        self.store.update(user_id, |user: &mut UserRecord| {
            user.membership = membership;
            Ok(())
        })?;

        info!(user_id = %user_id, membership, "Membership changed");
        self.events.emit(LedgerEvent::MembershipChanged {
            user_id: user_id.to_string(),
            membership,
        });
        Ok(())
    }

    fn changed(&self, community_id: &str, setting: &str) {
        info!(community_id = %community_id, setting, "Community setting changed");
        self.events.emit(LedgerEvent::SettingsChanged {
            community_id: community_id.to_string(),
            setting: setting.to_string(),
        });
    }
}
