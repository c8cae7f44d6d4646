// Blockchain module
//
// This module contains the consensus core:
// - Cryptography utilities and wallets
// - Transactions and their validity rules
// - The ledger derived by replaying transactions
// - Blocks, replay and proof-of-work checks
// - Network-wide constants and genesis

pub mod block;
pub mod chain;
pub mod crypto;
pub mod ledger;
pub mod transaction;

// Re-export main components for easier access
pub use chain::{make_genesis, ChainConfig};
pub use crypto::{Address, Wallet};
pub use ledger::LedgerView;
