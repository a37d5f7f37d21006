//! VRTEX Ledger - persistent economy core for chat communities
//!
//! Users hold a spendable wallet and a protected bank, claim time-gated
//! rewards, level up, run businesses, and communities unlock premium
//! features with single-use keys. The chat front-end is a thin adapter over
//! the services exposed here.
//!
//! ## Invariants
//!
//! | Property | Where it is enforced |
//! |----------|----------------------|
//! | `wallet >= 0 && bank >= 0` | unsigned balances, checked debits |
//! | transfers conserve value | one transaction over both users |
//! | at most one claim per window | cooldown evaluated inside the user's update |
//! | a key is redeemed at most once | key and community committed together |
//! | premium only extends forward | stacking expiry on redemption |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/vrtex-ledger/
//! ├── ledger.sled/           # users, communities, premium_keys trees
//! └── config.toml            # Economy configuration
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod services;

// Re-exports
pub use auth::PermissionLevel;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{Collection, CommunityConfig, EntityStore, OwnedBusiness, PremiumKey, UserRecord};
pub use error::{LedgerError, Result};
pub use services::Economy;
