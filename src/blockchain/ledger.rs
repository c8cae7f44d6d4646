use std::collections::BTreeMap;

use super::crypto::Address;
use super::transaction::Transaction;

/// Read access to balances and replay-protection state
pub trait LedgerView {
    /// Gold held by `address`; unknown addresses hold nothing
    fn balance_of(&self, address: &Address) -> u64;

    /// The nonce the next transaction from `address` must carry
    fn next_nonce_of(&self, address: &Address) -> u64;
}

/// Balances and nonces derived by replaying a chain of blocks
///
/// This is never sent over the wire. A receiving node always rebuilds it from
/// the predecessor's ledger plus the block's transactions, so cloning it is
/// the only way to start a child ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedLedger {
    balances: BTreeMap<Address, u64>,
    next_nonce: BTreeMap<Address, u64>,
}

impl DerivedLedger {
    pub fn new() -> Self {
        DerivedLedger::default()
    }

    /// Seeds a ledger from declared balances; only genesis may do this
    pub fn with_balances(balances: BTreeMap<Address, u64>) -> Self {
        DerivedLedger {
            balances,
            next_nonce: BTreeMap::new(),
        }
    }

    pub fn balances(&self) -> &BTreeMap<Address, u64> {
        &self.balances
    }

    /// Increases the balance of `address`
    pub fn credit(&mut self, address: &Address, amount: u64) {
        let balance = self.balances.entry(address.clone()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    /// Applies a transaction that already passed `Transaction::validate`
    /// against this ledger.
    ///
    /// The sender pays outputs plus fee; the fee is paid out later as part of
    /// the including block's reward.
    pub fn apply(&mut self, tx: &Transaction) {
        let nonce = self.next_nonce.entry(tx.from.clone()).or_insert(0);
        *nonce += 1;

        let sender = self.balances.entry(tx.from.clone()).or_insert(0);
        *sender = sender.saturating_sub(tx.total_outputs());

        for (address, amount) in &tx.outputs {
            self.credit(address, *amount);
        }
    }
}

impl LedgerView for DerivedLedger {
    fn balance_of(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    fn next_nonce_of(&self, address: &Address) -> u64 {
        self.next_nonce.get(address).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;

    #[test]
    fn test_unknown_address_is_empty() {
        let ledger = DerivedLedger::new();
        let address = Address("nobody".to_string());
        assert_eq!(ledger.balance_of(&address), 0);
        assert_eq!(ledger.next_nonce_of(&address), 0);
    }

    #[test]
    fn test_apply_moves_outputs_and_fee() {
        let sender = Wallet::new();
        let first = Wallet::new();
        let second = Wallet::new();

        let mut balances = BTreeMap::new();
        balances.insert(sender.address().clone(), 100);
        let mut ledger = DerivedLedger::with_balances(balances);

        let mut outputs = BTreeMap::new();
        outputs.insert(first.address().clone(), 30);
        outputs.insert(second.address().clone(), 20);
        let tx = Transaction::new(
            sender.address().clone(),
            0,
            *sender.public_key(),
            outputs,
            2,
            "",
        );

        ledger.apply(&tx);

        assert_eq!(ledger.balance_of(sender.address()), 48);
        assert_eq!(ledger.balance_of(first.address()), 30);
        assert_eq!(ledger.balance_of(second.address()), 20);
        assert_eq!(ledger.next_nonce_of(sender.address()), 1);
        // The fee has left circulation until the block reward pays it out.
        assert_eq!(ledger.balances().values().sum::<u64>(), 98);
    }

    #[test]
    fn test_clone_does_not_alias() {
        let address = Address("a".to_string());
        let parent = DerivedLedger::new();
        let mut child = parent.clone();
        child.credit(&address, 5);

        assert_eq!(parent.balance_of(&address), 0);
        assert_eq!(child.balance_of(&address), 5);
    }
}
