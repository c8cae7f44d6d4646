use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeMap;
use std::sync::Arc;

use super::chain::{ChainConfig, Target};
use super::crypto::{self, Address};
use super::ledger::{DerivedLedger, LedgerView};
use super::transaction::{Transaction, TransactionError};

/// Reasons a node refuses a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Duplicate block {0}")]
    DuplicateBlock(String),

    #[error("Block {0} does not have a valid proof")]
    InvalidProof(String),

    #[error("Block {id} is waiting for missing block {missing}")]
    MissingPredecessor { id: String, missing: String },

    #[error("Block {id} claims height {got}, expected {expected}")]
    InvalidChainLength { id: String, expected: u64, got: u64 },

    #[error("Block {id} does not extend block {prev}")]
    PredecessorMismatch { id: String, prev: String },

    #[error("Block {0} is not a genesis block")]
    NotGenesis(String),

    #[error("Block {id} contains an invalid transaction: {source}")]
    InvalidTransaction {
        id: String,
        #[source]
        source: TransactionError,
    },
}

/// The part of a block that travels between peers
///
/// Every field here is covered by the block hash. Balances are only present
/// on genesis; every other block's ledger is re-derived by replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlockHeader {
    pub prev_block_hash: String,
    pub chain_length: u64,
    pub transactions: Vec<Transaction>,
    pub proof: u64,
    pub reward_addr: Option<Address>,
    pub balances: Option<BTreeMap<Address, u64>>,
}

impl SealedBlockHeader {
    /// The fixed JSON encoding used for block ids and proof-of-work
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("block header is plain data")
    }

    /// Calculates the hash of the block, which is also its id
    pub fn hash(&self) -> String {
        crypto::hash(&self.canonical_bytes())
    }

    pub fn is_genesis(&self) -> bool {
        self.chain_length == 0
    }

    /// Returns true if the hash, read as a base-16 integer, is below `target`
    pub fn has_valid_proof(&self, target: &Target) -> bool {
        target.is_met_by_hex(&self.hash())
    }
}

/// A block together with the ledger derived for it
///
/// A freshly built block is a miner's working block: its transactions and
/// proof change until a valid proof is found. Blocks received from peers are
/// only ever built through [`Block::from_header`], which replays them.
#[derive(Debug, Clone)]
pub struct Block {
    header: SealedBlockHeader,
    ledger: DerivedLedger,
    config: Arc<ChainConfig>,
}

impl Block {
    /// Creates the genesis block with the given starting balances
    pub fn genesis(balances: BTreeMap<Address, u64>, config: Arc<ChainConfig>) -> Self {
        Block {
            ledger: DerivedLedger::with_balances(balances.clone()),
            header: SealedBlockHeader {
                prev_block_hash: String::new(),
                chain_length: 0,
                transactions: Vec::new(),
                proof: 0,
                reward_addr: None,
                balances: Some(balances),
            },
            config,
        }
    }

    /// Starts a new working block on top of `prev`
    ///
    /// # Arguments
    ///
    /// * `prev` - The block being extended
    /// * `reward_addr` - The address to receive all mining rewards for this block
    ///
    /// # Returns
    ///
    /// An empty block whose ledger already pays out `prev`'s reward
    pub fn next(prev: &Block, reward_addr: Address) -> Self {
        Block {
            header: SealedBlockHeader {
                prev_block_hash: prev.id(),
                chain_length: prev.chain_length() + 1,
                transactions: Vec::new(),
                proof: 0,
                reward_addr: Some(reward_addr),
                balances: None,
            },
            ledger: Block::seed_ledger(prev),
            config: Arc::clone(&prev.config),
        }
    }

    /// Rebuilds a block received from a peer on top of its predecessor
    pub fn from_header(header: SealedBlockHeader, prev: &Block) -> Result<Self, BlockError> {
        let mut block = Block {
            header,
            ledger: DerivedLedger::new(),
            config: Arc::clone(&prev.config),
        };

        let prev_id = prev.id();
        if block.header.prev_block_hash != prev_id {
            return Err(BlockError::PredecessorMismatch {
                id: block.id(),
                prev: prev_id,
            });
        }

        let expected = prev.chain_length() + 1;
        if block.header.chain_length != expected {
            return Err(BlockError::InvalidChainLength {
                id: block.id(),
                expected,
                got: block.header.chain_length,
            });
        }

        let id = block.id();
        block
            .rerun(prev)
            .map_err(|source| BlockError::InvalidTransaction { id, source })?;

        Ok(block)
    }

    /// Rebuilds a genesis block received from a peer
    pub fn genesis_from_header(
        header: SealedBlockHeader,
        config: Arc<ChainConfig>,
    ) -> Result<Self, BlockError> {
        let id = header.hash();
        if !header.is_genesis() {
            return Err(BlockError::NotGenesis(id));
        }

        let mut block = Block {
            header,
            ledger: DerivedLedger::new(),
            config,
        };
        block
            .rerun_genesis()
            .map_err(|source| BlockError::InvalidTransaction { id, source })?;

        Ok(block)
    }

    fn seed_ledger(prev: &Block) -> DerivedLedger {
        let mut ledger = prev.ledger.clone();
        if let Some(winner) = prev.reward_addr() {
            ledger.credit(winner, prev.total_rewards());
        }
        ledger
    }

    /// Restores balances and nonces by replaying every transaction on top of
    /// `prev`'s ledger. Any failing transaction fails the whole block.
    pub fn rerun(&mut self, prev: &Block) -> Result<(), TransactionError> {
        self.replay(Block::seed_ledger(prev))
    }

    /// Same as [`Block::rerun`], seeded from the balances genesis declares
    pub fn rerun_genesis(&mut self) -> Result<(), TransactionError> {
        let declared = self.header.balances.clone().unwrap_or_default();
        self.replay(DerivedLedger::with_balances(declared))
    }

    fn replay(&mut self, seed: DerivedLedger) -> Result<(), TransactionError> {
        let mut staged = Block {
            header: SealedBlockHeader {
                transactions: Vec::with_capacity(self.header.transactions.len()),
                ..self.header.clone()
            },
            ledger: seed,
            config: Arc::clone(&self.config),
        };
        for tx in &self.header.transactions {
            staged.add_transaction(tx.clone())?;
        }

        // Only the ledger is new; the rebuilt transaction list is identical.
        self.ledger = staged.ledger;
        Ok(())
    }

    /// Accepts a new transaction if it is valid against this block's ledger
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), TransactionError> {
        if self.contains(&tx.id) {
            return Err(TransactionError::DuplicateTransaction(tx.id));
        }

        tx.validate(&self.ledger)?;
        self.ledger.apply(&tx);
        self.header.transactions.push(tx);

        Ok(())
    }

    pub fn id(&self) -> String {
        self.header.hash()
    }

    pub fn has_valid_proof(&self) -> bool {
        self.header.has_valid_proof(&self.config.target)
    }

    pub fn header(&self) -> &SealedBlockHeader {
        &self.header
    }

    pub fn config(&self) -> &Arc<ChainConfig> {
        &self.config
    }

    pub fn chain_length(&self) -> u64 {
        self.header.chain_length
    }

    pub fn prev_block_hash(&self) -> &str {
        &self.header.prev_block_hash
    }

    pub fn proof(&self) -> u64 {
        self.header.proof
    }

    pub fn set_proof(&mut self, proof: u64) {
        self.header.proof = proof;
    }

    pub fn reward_addr(&self) -> Option<&Address> {
        self.header.reward_addr.as_ref()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.header.transactions
    }

    /// Only this block is checked, not its ancestors
    pub fn contains(&self, tx_id: &str) -> bool {
        self.header.transactions.iter().any(|tx| tx.id == tx_id)
    }

    /// Coinbase plus every included fee
    pub fn total_rewards(&self) -> u64 {
        self.header
            .transactions
            .iter()
            .fold(self.config.coinbase_reward, |reward, tx| reward.saturating_add(tx.fee))
    }

    /// Balances once this block's transactions are applied
    pub fn balances(&self) -> &BTreeMap<Address, u64> {
        self.ledger.balances()
    }

    /// Balances once this block's own reward is also paid out
    ///
    /// The ledger itself only receives the reward when the next block is
    /// built on top of this one.
    pub fn balances_with_reward(&self) -> BTreeMap<Address, u64> {
        let mut balances = self.ledger.balances().clone();
        if let Some(winner) = self.reward_addr() {
            let balance = balances.entry(winner.clone()).or_insert(0);
            *balance = balance.saturating_add(self.total_rewards());
        }
        balances
    }
}

impl LedgerView for Block {
    fn balance_of(&self, address: &Address) -> u64 {
        self.ledger.balance_of(address)
    }

    fn next_nonce_of(&self, address: &Address) -> u64 {
        self.ledger.next_nonce_of(address)
    }
}
