//! # state_machine
//!
//! why: the seam between committed log entries and business effects
//! relations: called only by apply.rs; ledger.rs is the bundled implementation
//! what: StateMachine trait, ApplyError

use raft_core::Command;
use thiserror::Error;

/// Domain rejection of a committed command. The entry is still applied, with status Failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("wallet {wallet_id} holds {balance}, cannot debit {requested}")]
    InsufficientFunds { wallet_id: u64, balance: i64, requested: i64 },

    #[error("unknown wallet {0}")]
    UnknownWallet(u64),

    #[error("unknown user {0}")]
    UnknownUser(u64),

    #[error("unknown admin {0}")]
    UnknownAdmin(u64),

    #[error("user {0} already exists")]
    DuplicateUser(u64),

    #[error("admin {0} already exists")]
    DuplicateAdmin(u64),

    #[error("wallet {0} already exists")]
    DuplicateWallet(u64),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("balance of wallet {0} would overflow")]
    Overflow(u64),

    #[error("previous password does not match for user {0}")]
    PasswordMismatch(u64),

    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Receives committed commands in index order.
///
/// A volatile machine starts empty on every process start and is handed the
/// whole committed log again, applied statuses included. A durable machine
/// keeps its effects across restarts and only sees entries not yet marked
/// applied.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &Command) -> Result<(), ApplyError>;

    /// Drop all applied state so the log can be replayed from index 1
    fn reset(&mut self);

    /// Effects survive a process restart
    fn is_durable(&self) -> bool {
        false
    }
}
