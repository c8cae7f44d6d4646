use log::{debug, info};

use std::collections::{BTreeMap, HashSet};

use crate::blockchain::block::{Block, BlockError, SealedBlockHeader};
use crate::blockchain::crypto::Address;
use crate::blockchain::transaction::{Transaction, TransactionError};
use crate::network::{Message, MessageHandler};

use super::client::{log_block_error, Client, ClientError};

/// A client that also searches for proofs
///
/// The miner always has exactly one working block, built on top of the
/// client's current tip. `find_proof` searches it in bounded bursts.
pub struct Miner {
    client: Client,
    current_block: Block,
    mining_rounds: u64,
}

impl Miner {
    pub fn new(client: Client) -> Self {
        let current_block = Block::next(client.last_block(), client.address().clone());
        let mining_rounds = client.config().mining_rounds;
        Miner {
            client,
            current_block,
            mining_rounds,
        }
    }

    /// Overrides how many proofs a single search burst tries
    pub fn with_mining_rounds(mut self, rounds: u64) -> Self {
        self.mining_rounds = rounds;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn address(&self) -> &Address {
        self.client.address()
    }

    /// The block currently being mined
    pub fn current_block(&self) -> &Block {
        &self.current_block
    }

    /// Starts a fresh search and schedules the first burst
    pub fn initialize(&mut self) {
        self.start_new_search(Vec::new());
        self.schedule_mining();
    }

    fn schedule_mining(&self) {
        self.client
            .net()
            .send_message(self.client.address(), &Message::StartMining);
    }

    /// Replaces the working block with an empty one on top of the current
    /// tip, then re-offers `carried` transactions to it.
    pub fn start_new_search(&mut self, carried: Vec<Transaction>) {
        self.current_block = Block::next(self.client.last_block(), self.client.address().clone());
        for tx in carried {
            if let Err(err) = self.current_block.add_transaction(tx) {
                debug!("{}: dropped carried transaction: {}", self.client.name(), err);
            }
        }
    }

    /// Tries up to `mining_rounds` proofs on the working block
    ///
    /// Returns the id of the sealed block when a proof is found. The block is
    /// accepted locally, announced, and a new search begins on top of it.
    pub fn find_proof(&mut self) -> Option<String> {
        let pause_point = self.current_block.proof().saturating_add(self.mining_rounds);

        while self.current_block.proof() < pause_point {
            if self.current_block.has_valid_proof() {
                let id = self.announce_proof();
                self.start_new_search(Vec::new());
                return Some(id);
            }
            let next = self.current_block.proof() + 1;
            self.current_block.set_proof(next);
        }

        None
    }

    fn announce_proof(&mut self) -> String {
        let header = self.current_block.header().clone();
        let id = header.hash();
        info!(
            "{}: found proof for block {} at height {}",
            self.client.name(),
            id,
            header.chain_length
        );

        if let Err(err) = self.client.receive_block(header.clone()) {
            log_block_error(self.client.name(), &err);
        }
        self.client.net().broadcast(&Message::ProofFound(header));

        id
    }

    /// Adds a transaction to the working block if it is valid there
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), TransactionError> {
        self.current_block.add_transaction(tx)
    }

    /// Posts a transaction like a client and mines it straight away
    pub fn post_transaction(
        &mut self,
        outputs: BTreeMap<Address, u64>,
        fee: u64,
    ) -> Result<Transaction, ClientError> {
        let tx = self.client.post_transaction(outputs, fee)?;
        if let Err(err) = self.add_transaction(tx.clone()) {
            debug!("{}: own transaction not mined yet: {}", self.client.name(), err);
        }
        Ok(tx)
    }

    /// Receives a block through the client, restarting the search when the
    /// new tip is at least as tall as the working block.
    pub fn receive_block(&mut self, header: SealedBlockHeader) -> Result<String, BlockError> {
        let id = self.client.receive_block(header)?;

        let tip = self.client.last_block();
        if tip.chain_length() >= self.current_block.chain_length() {
            let carried = self.sync_transactions(tip);
            debug!(
                "{}: restarting search on {} with {} carried transactions",
                self.client.name(),
                tip.id(),
                carried.len()
            );
            self.start_new_search(carried);
        }

        Ok(id)
    }

    /// Transactions in the working branch that `new_block`'s branch lacks
    ///
    /// Both branches are walked back to their common ancestor. The result is
    /// ordered oldest block first so per-sender nonces stay in sequence.
    pub fn sync_transactions(&self, new_block: &Block) -> Vec<Transaction> {
        let working_height = self.current_block.chain_length();
        let mut nb_ids: HashSet<&str> = HashSet::new();
        let mut abandoned: Vec<&Block> = Vec::new();

        let mut nb = Some(new_block);
        while let Some(block) = nb.filter(|b| b.chain_length() > working_height) {
            nb_ids.extend(block.transactions().iter().map(|tx| tx.id.as_str()));
            nb = self.client.block(block.prev_block_hash());
        }

        let mut cb = Some(&self.current_block);
        while let Some(block) = cb.filter(|b| b.chain_length() > new_block.chain_length()) {
            abandoned.push(block);
            cb = self.client.block(block.prev_block_hash());
        }

        while let (Some(c), Some(n)) = (cb, nb) {
            if c.id() == n.id() {
                break;
            }
            abandoned.push(c);
            nb_ids.extend(n.transactions().iter().map(|tx| tx.id.as_str()));
            cb = self.client.block(c.prev_block_hash());
            nb = self.client.block(n.prev_block_hash());
        }

        abandoned
            .into_iter()
            .rev()
            .flat_map(|block| block.transactions())
            .filter(|tx| !nb_ids.contains(tx.id.as_str()))
            .cloned()
            .collect()
    }
}

impl MessageHandler for Miner {
    fn name(&self) -> &str {
        self.client.name()
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::PostTransaction(tx) => {
                let tx_id = tx.id.clone();
                if let Err(err) = self.add_transaction(tx) {
                    debug!("{}: skipped transaction {}: {}", self.client.name(), tx_id, err);
                }
            }
            Message::ProofFound(header) => {
                if let Err(err) = self.receive_block(header) {
                    log_block_error(self.client.name(), &err);
                }
            }
            Message::MissingBlock(request) => self.client.provide_missing_block(&request),
            Message::StartMining => {
                self.find_proof();
                self.schedule_mining();
            }
        }
    }
}
