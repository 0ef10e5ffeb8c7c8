//! # ledger
//!
//! why: reference state machine for the replicated user/admin/wallet commands
//! relations: implements state_machine::StateMachine, fed by apply.rs
//! what: Ledger handle over shared account and balance state, read-only queries

use parking_lot::Mutex;
use raft_core::{AdminCommand, Command, UserCommand, WalletCommand};
use std::collections::HashMap;
use std::sync::Arc;

use crate::state_machine::{ApplyError, StateMachine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub hashed_password: String,
    pub date_of_birth: String,
    pub identification_number: String,
    /// Admin that validated the account
    pub validated_by: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRecord {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub hashed_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletRecord {
    pub owner: u64,
    pub balance: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    users: HashMap<u64, UserRecord>,
    admins: HashMap<u64, AdminRecord>,
    wallets: HashMap<u64, WalletRecord>,
    app_commands: u64,
}

/// Cloneable handle; every clone sees the same applied state.
/// Hand one clone to the node and keep another for queries.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    state: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, wallet_id: u64) -> Option<i64> {
        self.state.lock().wallets.get(&wallet_id).map(|w| w.balance)
    }

    pub fn wallet(&self, wallet_id: u64) -> Option<WalletRecord> {
        self.state.lock().wallets.get(&wallet_id).copied()
    }

    pub fn user(&self, user_id: u64) -> Option<UserRecord> {
        self.state.lock().users.get(&user_id).cloned()
    }

    pub fn admin(&self, admin_id: u64) -> Option<AdminRecord> {
        self.state.lock().admins.get(&admin_id).cloned()
    }

    /// Number of opaque application commands seen
    pub fn app_commands(&self) -> u64 {
        self.state.lock().app_commands
    }
}

impl StateMachine for Ledger {
    fn apply(&mut self, command: &Command) -> Result<(), ApplyError> {
        let mut state = self.state.lock();
        match command {
            Command::User(cmd) => state.apply_user(cmd),
            Command::Admin(cmd) => state.apply_admin(cmd),
            Command::Wallet(cmd) => state.apply_wallet(cmd),
            Command::App(_) => {
                state.app_commands += 1;
                Ok(())
            }
        }
    }

    fn reset(&mut self) {
        *self.state.lock() = LedgerState::default();
    }
}

impl LedgerState {
    fn apply_user(&mut self, cmd: &UserCommand) -> Result<(), ApplyError> {
        match cmd {
            UserCommand::CreateAccount {
                user_id,
                first_name,
                last_name,
                email,
                hashed_password,
                date_of_birth,
                identification_number,
            } => {
                if self.users.contains_key(user_id) {
                    return Err(ApplyError::DuplicateUser(*user_id));
                }
                self.users.insert(
                    *user_id,
                    UserRecord {
                        first_name: first_name.clone(),
                        last_name: last_name.clone(),
                        email: email.clone(),
                        hashed_password: hashed_password.clone(),
                        date_of_birth: date_of_birth.clone(),
                        identification_number: identification_number.clone(),
                        validated_by: None,
                    },
                );
            }
            UserCommand::UpdatePassword { user_id, previous_hash, new_hash } => {
                let user = self.users.get_mut(user_id).ok_or(ApplyError::UnknownUser(*user_id))?;
                if user.hashed_password != *previous_hash {
                    return Err(ApplyError::PasswordMismatch(*user_id));
                }
                user.hashed_password = new_hash.clone();
            }
            UserCommand::CreateWallet { user_id, wallet_id } => {
                if !self.users.contains_key(user_id) {
                    return Err(ApplyError::UnknownUser(*user_id));
                }
                if self.wallets.contains_key(wallet_id) {
                    return Err(ApplyError::DuplicateWallet(*wallet_id));
                }
                self.wallets.insert(*wallet_id, WalletRecord { owner: *user_id, balance: 0 });
            }
            UserCommand::DeleteAccount { user_id } => {
                self.users.remove(user_id).ok_or(ApplyError::UnknownUser(*user_id))?;
            }
        }
        Ok(())
    }

    fn apply_admin(&mut self, cmd: &AdminCommand) -> Result<(), ApplyError> {
        match cmd {
            AdminCommand::CreateAccount {
                admin_id,
                first_name,
                last_name,
                email,
                hashed_password,
            } => {
                if self.admins.contains_key(admin_id) {
                    return Err(ApplyError::DuplicateAdmin(*admin_id));
                }
                self.admins.insert(
                    *admin_id,
                    AdminRecord {
                        first_name: first_name.clone(),
                        last_name: last_name.clone(),
                        email: email.clone(),
                        hashed_password: hashed_password.clone(),
                    },
                );
            }
            AdminCommand::ValidateUser { admin_id, user_id } => {
                if !self.admins.contains_key(admin_id) {
                    return Err(ApplyError::UnknownAdmin(*admin_id));
                }
                let user = self.users.get_mut(user_id).ok_or(ApplyError::UnknownUser(*user_id))?;
                user.validated_by = Some(*admin_id);
            }
        }
        Ok(())
    }

    fn apply_wallet(&mut self, cmd: &WalletCommand) -> Result<(), ApplyError> {
        match *cmd {
            WalletCommand::Deposit { wallet_id, amount } => {
                positive(amount)?;
                let wallet = self.wallet_mut(wallet_id)?;
                wallet.balance = wallet
                    .balance
                    .checked_add(amount)
                    .ok_or(ApplyError::Overflow(wallet_id))?;
            }
            WalletCommand::Withdraw { wallet_id, amount } => {
                positive(amount)?;
                let wallet = self.wallet_mut(wallet_id)?;
                debit(wallet_id, wallet, amount)?;
            }
            WalletCommand::Transfer { from, to, amount } => {
                positive(amount)?;
                if from == to {
                    return Err(ApplyError::Rejected(format!("transfer from wallet {from} to itself")));
                }
                // check both sides before touching either balance
                let target = self.wallet_mut(to)?.balance;
                let credited = target.checked_add(amount).ok_or(ApplyError::Overflow(to))?;
                debit(from, self.wallet_mut(from)?, amount)?;
                self.wallet_mut(to)?.balance = credited;
            }
        }
        Ok(())
    }

    fn wallet_mut(&mut self, wallet_id: u64) -> Result<&mut WalletRecord, ApplyError> {
        self.wallets.get_mut(&wallet_id).ok_or(ApplyError::UnknownWallet(wallet_id))
    }
}

fn positive(amount: i64) -> Result<(), ApplyError> {
    if amount <= 0 {
        Err(ApplyError::InvalidAmount(amount))
    } else {
        Ok(())
    }
}

fn debit(wallet_id: u64, wallet: &mut WalletRecord, amount: i64) -> Result<(), ApplyError> {
    if wallet.balance < amount {
        return Err(ApplyError::InsufficientFunds {
            wallet_id,
            balance: wallet.balance,
            requested: amount,
        });
    }
    wallet.balance -= amount;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_wallets() -> Ledger {
        let mut ledger = Ledger::new();
        ledger
            .apply(&Command::User(UserCommand::CreateAccount {
                user_id: 1,
                first_name: "Ada".into(),
                last_name: "Okafor".into(),
                email: "ada@example.com".into(),
                hashed_password: "h1".into(),
                date_of_birth: "1990-01-01".into(),
                identification_number: "ID-1".into(),
            }))
            .unwrap();
        for wallet_id in [10, 11] {
            ledger
                .apply(&Command::User(UserCommand::CreateWallet { user_id: 1, wallet_id }))
                .unwrap();
        }
        ledger
    }

    fn wallet(cmd: WalletCommand) -> Command {
        Command::Wallet(cmd)
    }

    #[test]
    fn withdraw_beyond_balance_is_rejected_without_effect() {
        let mut ledger = ledger_with_wallets();
        ledger.apply(&wallet(WalletCommand::Deposit { wallet_id: 10, amount: 100 })).unwrap();

        let err = ledger
            .apply(&wallet(WalletCommand::Withdraw { wallet_id: 10, amount: 150 }))
            .unwrap_err();

        assert_eq!(err, ApplyError::InsufficientFunds { wallet_id: 10, balance: 100, requested: 150 });
        assert_eq!(ledger.balance(10), Some(100));
    }

    #[test]
    fn transfer_moves_funds_between_wallets() {
        let mut ledger = ledger_with_wallets();
        ledger.apply(&wallet(WalletCommand::Deposit { wallet_id: 10, amount: 80 })).unwrap();

        ledger.apply(&wallet(WalletCommand::Transfer { from: 10, to: 11, amount: 30 })).unwrap();

        assert_eq!(ledger.balance(10), Some(50));
        assert_eq!(ledger.balance(11), Some(30));
    }

    #[test]
    fn transfer_to_unknown_wallet_leaves_source_untouched() {
        let mut ledger = ledger_with_wallets();
        ledger.apply(&wallet(WalletCommand::Deposit { wallet_id: 10, amount: 80 })).unwrap();

        let err = ledger
            .apply(&wallet(WalletCommand::Transfer { from: 10, to: 99, amount: 30 }))
            .unwrap_err();

        assert_eq!(err, ApplyError::UnknownWallet(99));
        assert_eq!(ledger.balance(10), Some(80));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let mut ledger = ledger_with_wallets();
        assert_eq!(
            ledger.apply(&wallet(WalletCommand::Deposit { wallet_id: 10, amount: 0 })),
            Err(ApplyError::InvalidAmount(0))
        );
    }

    #[test]
    fn password_update_requires_previous_hash() {
        let mut ledger = ledger_with_wallets();
        let wrong = Command::User(UserCommand::UpdatePassword {
            user_id: 1,
            previous_hash: "nope".into(),
            new_hash: "h2".into(),
        });
        let right = Command::User(UserCommand::UpdatePassword {
            user_id: 1,
            previous_hash: "h1".into(),
            new_hash: "h2".into(),
        });

        assert_eq!(ledger.apply(&wrong), Err(ApplyError::PasswordMismatch(1)));
        ledger.apply(&right).unwrap();
        assert_eq!(ledger.user(1).map(|u| u.hashed_password), Some("h2".to_string()));
    }

    #[test]
    fn admin_validates_existing_user() {
        let mut ledger = ledger_with_wallets();
        let validate = Command::Admin(AdminCommand::ValidateUser { admin_id: 7, user_id: 1 });
        assert_eq!(ledger.apply(&validate), Err(ApplyError::UnknownAdmin(7)));

        ledger
            .apply(&Command::Admin(AdminCommand::CreateAccount {
                admin_id: 7,
                first_name: "Grace".into(),
                last_name: "Mensah".into(),
                email: "grace@example.com".into(),
                hashed_password: "a1".into(),
            }))
            .unwrap();
        ledger.apply(&validate).unwrap();

        assert_eq!(ledger.user(1).and_then(|u| u.validated_by), Some(7));
    }

    #[test]
    fn clones_share_state() {
        let ledger = ledger_with_wallets();
        let mut writer = ledger.clone();
        writer.apply(&Command::App(b"noop".to_vec())).unwrap();

        assert_eq!(ledger.app_commands(), 1);
        assert_eq!(ledger.wallet(11).map(|w| w.owner), Some(1));
    }

    #[test]
    fn reset_empties_every_clone() {
        let ledger = ledger_with_wallets();
        let mut writer = ledger.clone();

        writer.reset();

        assert_eq!(ledger.wallet(11), None);
        assert_eq!(ledger.user(1), None);
        assert!(!writer.is_durable());
    }
}
