//! Event system for ledger operations
//!
//! Every successful mutation is announced on the bus after it has been
//! persisted. Useful for:
//! - Audit trails
//! - Front-end notifications (level-ups, premium activation)

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Ledger events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    // Balance events
    Deposited {
        user_id: String,
        amount: u64,
    },
    Withdrawn {
        user_id: String,
        amount: u64,
    },
    Transferred {
        from: String,
        to: String,
        amount: u64,
    },
    Credited {
        user_id: String,
        amount: u64,
        reason: String,
    },
    Debited {
        user_id: String,
        amount: u64,
        reason: String,
    },
    WagerSettled {
        user_id: String,
        stake: u64,
        payout: u64,
    },

    // Reward events
    RewardClaimed {
        user_id: String,
        reward: String,
        amount: u64,
    },
    LeveledUp {
        user_id: String,
        level: u32,
    },
    JobChanged {
        user_id: String,
        job: Option<String>,
    },

    // Business events
    BusinessPurchased {
        user_id: String,
        business: String,
        cost: u64,
    },
    ProfitCollected {
        user_id: String,
        amount: u64,
    },
    UpkeepCharged {
        user_id: String,
        paid: u64,
        arrears: u64,
    },

    // Premium events
    KeyIssued {
        code: String,
        issued_to: String,
        months: u32,
    },
    KeyRedeemed {
        code: String,
        community_id: String,
        premium_until: DateTime<Utc>,
    },

    // Settings events
    SettingsChanged {
        community_id: String,
        setting: String,
    },
    MembershipChanged {
        user_id: String,
        membership: bool,
    },
}

/// Event bus for broadcasting ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Write one audit line per event
pub fn log_event(event: &LedgerEvent) {
    match event {
        LedgerEvent::Transferred { from, to, amount } => {
            info!(from = %from, to = %to, amount, "audit: transfer");
        }
        LedgerEvent::KeyIssued { code, issued_to, months } => {
            info!(code = %code, issued_to = %issued_to, months, "audit: premium key issued");
        }
        LedgerEvent::KeyRedeemed { code, community_id, premium_until } => {
            info!(
                code = %code,
                community_id = %community_id,
                premium_until = %premium_until,
                "audit: premium key redeemed"
            );
        }
        other => {
            debug!(event = ?other, "audit");
        }
    }
}
