use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeMap;

use super::crypto::{self, verify_signature, Address, CryptoError, DigitalSignature, PublicKey, Wallet};
use super::ledger::LedgerView;

/// Reasons a transaction is refused by a block
///
/// All of these are local and recoverable: the transaction is dropped from
/// the block being built, the node carries on.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Duplicate transaction {0}")]
    DuplicateTransaction(String),

    #[error("Unsigned transaction {0}")]
    UnsignedTransaction(String),

    #[error("Invalid signature for transaction {0}")]
    InvalidSignature(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Replayed transaction: expected nonce {expected}, got {got}")]
    ReplayedTransaction { expected: u64, got: u64 },

    #[error("Out of order transaction: expected nonce {expected}, got {got}")]
    OutOfOrderTransaction { expected: u64, got: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// An authorized transfer of gold from one address to one or more others
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's address
    pub from: Address,

    /// Per-sender sequence number, starting at 0
    pub nonce: u64,

    /// Sender's verification key
    pub public_key: PublicKey,

    /// Signature over `id`; `None` until signed
    pub signature: Option<DigitalSignature>,

    /// Amount paid to each recipient
    pub outputs: BTreeMap<Address, u64>,

    /// Reward for whichever miner includes the transaction
    pub fee: u64,

    /// Opaque payload
    pub data: String,

    /// Content hash of every field above except the signature
    pub id: String,
}

/// The hashed view of a transaction. Field order is fixed and `outputs` is a
/// `BTreeMap`, so every peer derives byte-identical JSON.
#[derive(Serialize)]
struct SigningContent<'a> {
    from: &'a Address,
    nonce: u64,
    public_key: &'a PublicKey,
    outputs: &'a BTreeMap<Address, u64>,
    fee: u64,
    data: &'a str,
}

impl Transaction {
    /// Creates a new unsigned transaction
    ///
    /// # Arguments
    ///
    /// * `from` - The address of the sender
    /// * `nonce` - The sender's next nonce
    /// * `public_key` - The sender's public key
    /// * `outputs` - Recipients and the amount each receives
    /// * `fee` - The transaction fee
    /// * `data` - Free-form payload, ignored by consensus
    ///
    /// # Returns
    ///
    /// A new Transaction instance with its id already derived
    pub fn new(
        from: Address,
        nonce: u64,
        public_key: PublicKey,
        outputs: BTreeMap<Address, u64>,
        fee: u64,
        data: impl Into<String>,
    ) -> Self {
        let mut transaction = Transaction {
            from,
            nonce,
            public_key,
            signature: None,
            outputs,
            fee,
            data: data.into(),
            id: String::new(),
        };
        transaction.id = transaction.compute_id();
        transaction
    }

    /// Recomputes the content hash from the current field values
    pub fn compute_id(&self) -> String {
        let content = SigningContent {
            from: &self.from,
            nonce: self.nonce,
            public_key: &self.public_key,
            outputs: &self.outputs,
            fee: self.fee,
            data: &self.data,
        };
        let encoded = serde_json::to_vec(&content).expect("transaction content is plain data");
        crypto::hash(&encoded)
    }

    /// Signs the transaction id with a wallet
    pub fn sign(&mut self, wallet: &Wallet) {
        self.signature = Some(wallet.sign(self.id.as_bytes()));
    }

    /// Checks signature presence, signature validity and sender/key binding
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        let signature = match &self.signature {
            Some(sig) if !sig.is_empty() => sig,
            _ => return Err(TransactionError::UnsignedTransaction(self.id.clone())),
        };

        if self.id != self.compute_id() || !self.from.matches_key(&self.public_key) {
            return Err(TransactionError::InvalidSignature(self.id.clone()));
        }

        // A signature that cannot even be decoded is just a bad signature.
        match verify_signature(self.id.as_bytes(), signature, &self.public_key) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(TransactionError::InvalidSignature(self.id.clone())),
        }
    }

    /// Sum of all outputs, not counting the fee
    pub fn output_total(&self) -> u64 {
        self.outputs
            .values()
            .fold(0u64, |total, amount| total.saturating_add(*amount))
    }

    /// Gold leaving the sender's balance: outputs plus fee
    pub fn total_outputs(&self) -> u64 {
        self.output_total().saturating_add(self.fee)
    }

    /// Checks the transaction against a ledger snapshot without mutating it
    ///
    /// Checks run in a fixed order: signature, amounts, funds, then nonce.
    /// Duplicate detection is left to the block, which owns the id set.
    pub fn validate(&self, ledger: &impl LedgerView) -> Result<(), TransactionError> {
        self.verify_signature()?;

        if let Some((address, _)) = self.outputs.iter().find(|(_, amount)| **amount == 0) {
            return Err(TransactionError::InvalidAmount(format!(
                "output to {} must be positive",
                address
            )));
        }

        let required = self.total_outputs();
        let available = ledger.balance_of(&self.from);
        if required > available {
            return Err(TransactionError::InsufficientFunds { required, available });
        }

        let expected = ledger.next_nonce_of(&self.from);
        if self.nonce < expected {
            return Err(TransactionError::ReplayedTransaction {
                expected,
                got: self.nonce,
            });
        }
        // Gaps are refused rather than queued.
        if self.nonce > expected {
            return Err(TransactionError::OutOfOrderTransaction {
                expected,
                got: self.nonce,
            });
        }

        Ok(())
    }
}
