//! Error types for vrtex-ledger

use thiserror::Error;

use crate::db::Collection;
use crate::services::cooldown::Remaining;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Cooldown active: try again in {remaining}")]
    CooldownActive { remaining: Remaining },

    #[error("Already owned: {0}")]
    AlreadyOwned(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Premium key already used: {0}")]
    KeyAlreadyUsed(String),

    #[error("Premium key not found: {0}")]
    KeyNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Command disabled in this community: {0}")]
    CommandDisabled(String),

    #[error("Community premium required: {0}")]
    PremiumRequired(String),

    #[error("Requirement not met: {0}")]
    RequirementNotMet(String),

    #[error("Insufficient quantity of {item}: have {held}, need {wanted}")]
    InsufficientQuantity { item: String, held: u64, wanted: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupted record in {collection}: {detail}")]
    Corrupted { collection: Collection, detail: String },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// True for ordinary rejections: the operation was refused and no state changed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds(_)
                | LedgerError::InvalidTarget(_)
                | LedgerError::CooldownActive { .. }
                | LedgerError::AlreadyOwned(_)
                | LedgerError::NotFound(_)
                | LedgerError::KeyAlreadyUsed(_)
                | LedgerError::KeyNotFound(_)
                | LedgerError::Unauthorized(_)
                | LedgerError::CommandDisabled(_)
                | LedgerError::PremiumRequired(_)
                | LedgerError::RequirementNotMet(_)
                | LedgerError::InsufficientQuantity { .. }
                | LedgerError::InvalidInput(_)
                | LedgerError::AmountOverflow(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
