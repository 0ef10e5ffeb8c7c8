//! # command
//!
//! why: give each replicated command exactly one typed payload instead of a bag of optional fields
//! relations: carried by log.rs entries, dispatched by the apply pipeline in raft-node
//! what: Command sum type, per-domain command enums, CommandKind tag

use serde::{Deserialize, Serialize};
use std::fmt;

/// A command replicated through the log and applied to the domain state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Command {
    User(UserCommand),
    Admin(AdminCommand),
    Wallet(WalletCommand),
    /// Opaque application command, passed through untouched
    App(Vec<u8>),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::User(_) => CommandKind::User,
            Command::Admin(_) => CommandKind::Admin,
            Command::Wallet(_) => CommandKind::Wallet,
            Command::App(_) => CommandKind::App,
        }
    }
}

/// The tag persisted next to each entry (`commandKind` column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    User,
    Admin,
    Wallet,
    App,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::User => "user",
            CommandKind::Admin => "admin",
            CommandKind::Wallet => "wallet",
            CommandKind::App => "app",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account lifecycle commands issued on behalf of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserCommand {
    CreateAccount {
        user_id: u64,
        first_name: String,
        last_name: String,
        email: String,
        hashed_password: String,
        date_of_birth: String,
        identification_number: String,
    },
    UpdatePassword {
        user_id: u64,
        previous_hash: String,
        new_hash: String,
    },
    CreateWallet {
        user_id: u64,
        wallet_id: u64,
    },
    DeleteAccount {
        user_id: u64,
    },
}

/// Back-office commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminCommand {
    CreateAccount {
        admin_id: u64,
        first_name: String,
        last_name: String,
        email: String,
        hashed_password: String,
    },
    ValidateUser {
        admin_id: u64,
        user_id: u64,
    },
}

/// Balance mutations. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WalletCommand {
    Deposit { wallet_id: u64, amount: i64 },
    Withdraw { wallet_id: u64, amount: i64 },
    Transfer { from: u64, to: u64, amount: i64 },
}
