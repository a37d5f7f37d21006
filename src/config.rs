//! Configuration for vrtex-ledger
//!
//! Every economy constant lives here: reward amounts and cooldown policies,
//! the business and job catalogs, premium key parameters. The catalogs are
//! static data and are never written back to the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{LedgerError, Result};
use crate::services::cooldown::{ClaimScope, CooldownPolicy, RewardKind};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vrtex-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the sled database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Commands a community manager may switch off
    #[serde(default = "default_toggleable_commands")]
    pub toggleable_commands: Vec<String>,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub rewards: RewardsConfig,

    #[serde(default)]
    pub progression: ProgressionConfig,

    #[serde(default)]
    pub streak: StreakConfig,

    #[serde(default)]
    pub membership: MembershipConfig,

    /// Business catalog, keyed by display name
    #[serde(default = "default_businesses")]
    pub businesses: BTreeMap<String, BusinessSpec>,

    /// Job catalog, keyed by display name
    #[serde(default = "default_jobs")]
    pub jobs: BTreeMap<String, JobSpec>,

    #[serde(default)]
    pub upkeep: UpkeepConfig,

    #[serde(default)]
    pub premium: PremiumConfig,
}

/// EntityStore tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Attempts before a faulting operation surfaces `StoreUnavailable`
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// sled page cache size in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,

    /// Flush to disk before every mutating call returns
    #[serde(default = "default_true")]
    pub flush_on_write: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            cache_capacity_bytes: default_cache_capacity(),
            flush_on_write: true,
        }
    }
}

/// One timed reward: where its cooldown is tracked, how it resets, what it pays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRule {
    pub scope: ClaimScope,
    pub policy: CooldownPolicy,
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub xp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    #[serde(default = "default_work_rule")]
    pub work: RewardRule,
    #[serde(default = "default_daily_rule")]
    pub daily: RewardRule,
    #[serde(default = "default_weekly_rule")]
    pub weekly: RewardRule,
    #[serde(default = "default_monthly_rule")]
    pub monthly: RewardRule,
    /// Gate for business profit collection (amount and xp unused)
    #[serde(default = "default_business_rule")]
    pub business: RewardRule,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            work: default_work_rule(),
            daily: default_daily_rule(),
            weekly: default_weekly_rule(),
            monthly: default_monthly_rule(),
            business: default_business_rule(),
        }
    }
}

impl RewardsConfig {
    pub fn rule(&self, kind: RewardKind) -> &RewardRule {
        match kind {
            RewardKind::Work => &self.work,
            RewardKind::Daily => &self.daily,
            RewardKind::Weekly => &self.weekly,
            RewardKind::Monthly => &self.monthly,
            RewardKind::Business => &self.business,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionConfig {
    /// XP needed to leave level L is `L * xp_per_level`
    #[serde(default = "default_xp_per_level")]
    pub xp_per_level: u64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            xp_per_level: default_xp_per_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakConfig {
    #[serde(default = "default_streak_step")]
    pub bonus_pct_per_step: u64,
    #[serde(default = "default_streak_cap")]
    pub max_bonus_pct: u64,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            bonus_pct_per_step: default_streak_step(),
            max_bonus_pct: default_streak_cap(),
        }
    }
}

/// Perks of an individual premium membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_work_bonus")]
    pub work_bonus_pct: u64,
    #[serde(default = "default_work_bonus")]
    pub business_bonus_pct: u64,
    /// Businesses below this tier get no membership bonus
    #[serde(default = "default_bonus_tier")]
    pub business_bonus_min_tier: u8,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            work_bonus_pct: default_work_bonus(),
            business_bonus_pct: default_work_bonus(),
            business_bonus_min_tier: default_bonus_tier(),
        }
    }
}

/// Catalog entry for an income-generating business
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessSpec {
    pub cost: u64,
    pub profit: u64,
    pub upkeep: u64,
    pub tier: u8,
}

/// Catalog entry for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub salary: u64,
    #[serde(default = "default_min_level")]
    pub required_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpkeepConfig {
    /// Length of one upkeep billing period
    #[serde(default = "default_upkeep_interval")]
    pub interval_secs: u64,
}

impl Default for UpkeepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_upkeep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumConfig {
    /// A "month" of premium is this many days
    #[serde(default = "default_days_per_month")]
    pub days_per_month: u32,
    #[serde(default = "default_max_months")]
    pub max_months: u32,
    /// Code shape: groups of four characters joined by '-'
    #[serde(default = "default_code_groups")]
    pub code_groups: usize,
    #[serde(default = "default_generation_attempts")]
    pub max_generation_attempts: u32,
}

impl Default for PremiumConfig {
    fn default() -> Self {
        Self {
            days_per_month: default_days_per_month(),
            max_months: default_max_months(),
            code_groups: default_code_groups(),
            max_generation_attempts: default_generation_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}

fn default_work_rule() -> RewardRule {
    RewardRule {
        scope: ClaimScope::Community,
        policy: CooldownPolicy::Rolling { window_secs: 3600 },
        amount: 1000,
        xp: 20,
    }
}

fn default_daily_rule() -> RewardRule {
    RewardRule {
        scope: ClaimScope::Account,
        policy: CooldownPolicy::CalendarDay,
        amount: 500,
        xp: 10,
    }
}

fn default_weekly_rule() -> RewardRule {
    RewardRule {
        scope: ClaimScope::Account,
        policy: CooldownPolicy::Rolling { window_secs: 7 * 86_400 },
        amount: 5000,
        xp: 50,
    }
}

fn default_monthly_rule() -> RewardRule {
    RewardRule {
        scope: ClaimScope::Account,
        policy: CooldownPolicy::Rolling { window_secs: 30 * 86_400 },
        amount: 20_000,
        xp: 150,
    }
}

fn default_business_rule() -> RewardRule {
    RewardRule {
        scope: ClaimScope::Account,
        policy: CooldownPolicy::Rolling { window_secs: 3600 },
        amount: 0,
        xp: 0,
    }
}

fn default_xp_per_level() -> u64 {
    100
}

fn default_streak_step() -> u64 {
    2
}

fn default_streak_cap() -> u64 {
    20
}

fn default_work_bonus() -> u64 {
    25
}

fn default_bonus_tier() -> u8 {
    2
}

fn default_min_level() -> u32 {
    1
}

fn default_upkeep_interval() -> u64 {
    86_400
}

fn default_days_per_month() -> u32 {
    30
}

fn default_max_months() -> u32 {
    120
}

fn default_code_groups() -> usize {
    4
}

fn default_generation_attempts() -> u32 {
    8
}

fn default_businesses() -> BTreeMap<String, BusinessSpec> {
    BTreeMap::from([
        (
            "Bakery".to_string(),
            BusinessSpec { cost: 5000, profit: 500, upkeep: 50, tier: 1 },
        ),
        (
            "Mine".to_string(),
            BusinessSpec { cost: 10_000, profit: 1200, upkeep: 150, tier: 2 },
        ),
        (
            "Shop".to_string(),
            BusinessSpec { cost: 20_000, profit: 2500, upkeep: 300, tier: 3 },
        ),
    ])
}

fn default_jobs() -> BTreeMap<String, JobSpec> {
    BTreeMap::from([
        ("Cashier".to_string(), JobSpec { salary: 1000, required_level: 1 }),
        ("Miner".to_string(), JobSpec { salary: 1400, required_level: 3 }),
        ("Engineer".to_string(), JobSpec { salary: 2200, required_level: 8 }),
    ])
}

fn default_toggleable_commands() -> Vec<String> {
    ["vework", "vecf", "veslots", "vebusiness", "vehelp", "vebalance"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            toggleable_commands: default_toggleable_commands(),
            store: StoreSettings::default(),
            rewards: RewardsConfig::default(),
            progression: ProgressionConfig::default(),
            streak: StreakConfig::default(),
            membership: MembershipConfig::default(),
            businesses: default_businesses(),
            jobs: default_jobs(),
            upkeep: UpkeepConfig::default(),
            premium: PremiumConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LedgerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get sled database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("ledger.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.progression.xp_per_level == 0 {
            return Err(LedgerError::Config("xp_per_level must be positive".into()));
        }
        if self.premium.days_per_month == 0 || self.premium.max_months == 0 {
            return Err(LedgerError::Config(
                "premium days_per_month and max_months must be positive".into(),
            ));
        }
        if self.premium.code_groups == 0 {
            return Err(LedgerError::Config("premium code_groups must be positive".into()));
        }
        if self.upkeep.interval_secs == 0 {
            return Err(LedgerError::Config("upkeep interval_secs must be positive".into()));
        }
        let rules = [
            ("work", &self.rewards.work),
            ("daily", &self.rewards.daily),
            ("weekly", &self.rewards.weekly),
            ("monthly", &self.rewards.monthly),
            ("business", &self.rewards.business),
        ];
        for (name, rule) in rules {
            if let CooldownPolicy::Rolling { window_secs: 0 } = rule.policy {
                return Err(LedgerError::Config(format!(
                    "rewards.{} rolling window must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}
