use log::{debug, info, warn};
use thiserror::Error;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::blockchain::block::{Block, BlockError, SealedBlockHeader};
use crate::blockchain::chain::ChainConfig;
use crate::blockchain::crypto::{Address, Wallet};
use crate::blockchain::ledger::LedgerView;
use crate::blockchain::transaction::Transaction;
use crate::network::{Message, MessageHandler, MissingBlockRequest, Network};

/// Errors a client reports to its own caller
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Requested {requested} gold, but only {available} is available")]
    InsufficientGold { requested: u64, available: u64 },
}

/// A peer's private view of the blockchain
///
/// Every block the client has accepted lives in `blocks`, keyed by id. Blocks
/// whose predecessor has not arrived yet wait in `pending_blocks`, keyed by
/// the id they are waiting for.
pub struct Client {
    name: String,
    wallet: Wallet,
    config: Arc<ChainConfig>,
    net: Arc<dyn Network>,
    nonce: u64,
    pending_outgoing: BTreeMap<String, Transaction>,
    blocks: HashMap<String, Block>,
    pending_blocks: HashMap<String, Vec<SealedBlockHeader>>,
    last_block: String,
    last_confirmed_block: String,
}

impl Client {
    /// Creates a client that starts from `genesis`
    ///
    /// # Arguments
    ///
    /// * `name` - Used only in log lines
    /// * `wallet` - The keypair the client signs with
    /// * `genesis` - The genesis block, which is always confirmed
    /// * `net` - How the client reaches its peers
    pub fn new(name: impl Into<String>, wallet: Wallet, genesis: &Block, net: Arc<dyn Network>) -> Self {
        let genesis_id = genesis.id();
        let mut blocks = HashMap::new();
        blocks.insert(genesis_id.clone(), genesis.clone());

        Client {
            name: name.into(),
            wallet,
            config: Arc::clone(genesis.config()),
            net,
            nonce: 0,
            pending_outgoing: BTreeMap::new(),
            blocks,
            pending_blocks: HashMap::new(),
            last_block: genesis_id.clone(),
            last_confirmed_block: genesis_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        self.wallet.address()
    }

    pub fn config(&self) -> &Arc<ChainConfig> {
        &self.config
    }

    pub(crate) fn net(&self) -> &Arc<dyn Network> {
        &self.net
    }

    /// Tip of the longest chain accepted so far
    pub fn last_block(&self) -> &Block {
        &self.blocks[&self.last_block]
    }

    /// Deepest block treated as final
    pub fn last_confirmed_block(&self) -> &Block {
        &self.blocks[&self.last_confirmed_block]
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn known_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of received blocks still waiting on a predecessor
    pub fn stuck_blocks(&self) -> usize {
        self.pending_blocks.values().map(Vec::len).sum()
    }

    pub fn pending_outgoing_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.pending_outgoing.values()
    }

    /// Blocks from the tip back to genesis
    pub fn chain(&self) -> Vec<&Block> {
        let mut chain = Vec::new();
        let mut cursor = Some(self.last_block());
        while let Some(block) = cursor {
            chain.push(block);
            cursor = self.blocks.get(block.prev_block_hash());
        }
        chain
    }

    /// Gold available according to the last confirmed block
    pub fn confirmed_balance(&self) -> u64 {
        self.last_confirmed_block().balance_of(self.address())
    }

    /// Confirmed gold minus everything promised in unconfirmed transactions
    pub fn available_gold(&self) -> u64 {
        let pending_spent = self
            .pending_outgoing
            .values()
            .fold(0u64, |total, tx| total.saturating_add(tx.total_outputs()));
        self.confirmed_balance().saturating_sub(pending_spent)
    }

    /// Signs and broadcasts a transaction paying `outputs` plus `fee`
    ///
    /// The transaction stays in the pending set until the confirmed block
    /// includes it.
    pub fn post_transaction(
        &mut self,
        outputs: BTreeMap<Address, u64>,
        fee: u64,
    ) -> Result<Transaction, ClientError> {
        let requested = outputs
            .values()
            .fold(fee, |total, amount| total.saturating_add(*amount));
        let available = self.available_gold();
        if requested > available {
            return Err(ClientError::InsufficientGold { requested, available });
        }

        let mut tx = Transaction::new(
            self.address().clone(),
            self.nonce,
            *self.wallet.public_key(),
            outputs,
            fee,
            "",
        );
        tx.sign(&self.wallet);

        self.pending_outgoing.insert(tx.id.clone(), tx.clone());
        self.nonce += 1;

        info!("{}: posting transaction {}", self.name, tx.id);
        self.net.broadcast(&Message::PostTransaction(tx.clone()));

        Ok(tx)
    }

    /// Validates a block and, if it builds a longer chain, adopts it
    ///
    /// On success returns the block's id. Any blocks that were waiting for it
    /// are accepted in the same call.
    pub fn receive_block(&mut self, header: SealedBlockHeader) -> Result<String, BlockError> {
        let id = self.accept_block(header)?;

        let mut unstuck = vec![id.clone()];
        while let Some(parent) = unstuck.pop() {
            let Some(waiting) = self.pending_blocks.remove(&parent) else {
                continue;
            };
            for header in waiting {
                match self.accept_block(header) {
                    Ok(child) => unstuck.push(child),
                    Err(err) => log_block_error(&self.name, &err),
                }
            }
        }

        Ok(id)
    }

    fn accept_block(&mut self, header: SealedBlockHeader) -> Result<String, BlockError> {
        let id = header.hash();

        if self.blocks.contains_key(&id) {
            return Err(BlockError::DuplicateBlock(id));
        }

        if !header.is_genesis() && !header.has_valid_proof(&self.config.target) {
            return Err(BlockError::InvalidProof(id));
        }

        let block = if header.is_genesis() {
            Block::genesis_from_header(header, Arc::clone(&self.config))?
        } else {
            match self.blocks.get(&header.prev_block_hash) {
                Some(prev) => Block::from_header(header, prev)?,
                None => {
                    let missing = header.prev_block_hash.clone();
                    self.stash_block(header);
                    return Err(BlockError::MissingPredecessor { id, missing });
                }
            }
        };

        let chain_length = block.chain_length();
        self.blocks.insert(id.clone(), block);
        debug!("{}: accepted block {} at height {}", self.name, id, chain_length);

        // Strictly longer only: on a tie the chain seen first keeps priority.
        if chain_length > self.last_block().chain_length() {
            self.last_block = id.clone();
            self.set_last_confirmed();
        }

        Ok(id)
    }

    fn stash_block(&mut self, header: SealedBlockHeader) {
        let missing = header.prev_block_hash.clone();
        match self.pending_blocks.entry(missing.clone()) {
            Entry::Occupied(mut waiting) => {
                if !waiting.get().contains(&header) {
                    waiting.get_mut().push(header);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![header]);
                // First block found waiting on this id: ask the network once.
                self.request_missing_block(&missing);
            }
        }
    }

    /// Asks the network for the block with id `missing`
    pub fn request_missing_block(&self, missing: &str) {
        info!("{}: asking for missing block {}", self.name, missing);
        let request = MissingBlockRequest {
            from: self.address().clone(),
            missing: missing.to_string(),
        };
        self.net.broadcast(&Message::MissingBlock(request));
    }

    /// Sends the requested block back to the requester, if we have it
    pub fn provide_missing_block(&self, request: &MissingBlockRequest) {
        if let Some(block) = self.blocks.get(&request.missing) {
            info!("{}: providing missing block {}", self.name, request.missing);
            self.net
                .send_message(&request.from, &Message::ProofFound(block.header().clone()));
        }
    }

    /// Broadcasts every pending outgoing transaction again
    pub fn resend_pending_transactions(&self) {
        for tx in self.pending_outgoing.values() {
            self.net.broadcast(&Message::PostTransaction(tx.clone()));
        }
    }

    /// Moves the confirmed pointer `confirmed_depth` blocks below the tip and
    /// drops pending transactions that the confirmed chain now includes.
    fn set_last_confirmed(&mut self) {
        let mut block = self.last_block();
        let confirmed_height = block.chain_length().saturating_sub(self.config.confirmed_depth);

        while block.chain_length() > confirmed_height {
            match self.blocks.get(block.prev_block_hash()) {
                Some(prev) => block = prev,
                None => break,
            }
        }

        let confirmed_id = block.id();
        let next_nonce = block.next_nonce_of(self.address());
        self.last_confirmed_block = confirmed_id;

        // Our nonces are sequential, so anything below the confirmed next
        // nonce is included at or below the confirmed block.
        self.pending_outgoing.retain(|_, tx| tx.nonce >= next_nonce);
    }

    /// Logs every balance seen by the last confirmed block
    pub fn show_all_balances(&self) {
        info!("{}: balances at confirmed height {}", self.name, self.last_confirmed_block().chain_length());
        for (address, balance) in self.last_confirmed_block().balances() {
            info!("  {}: {}", address.short(), balance);
        }
    }
}

impl MessageHandler for Client {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::ProofFound(header) => {
                if let Err(err) = self.receive_block(header) {
                    log_block_error(&self.name, &err);
                }
            }
            Message::MissingBlock(request) => self.provide_missing_block(&request),
            Message::PostTransaction(_) | Message::StartMining => {}
        }
    }
}

pub(crate) fn log_block_error(name: &str, err: &BlockError) {
    match err {
        BlockError::DuplicateBlock(_) | BlockError::MissingPredecessor { .. } => {
            debug!("{}: {}", name, err)
        }
        _ => warn!("{}: rejected block: {}", name, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::testing::{config, extend, genesis_for, seal};
    use crate::network::testing::RecordingNet;

    #[test]
    fn test_new_client_starts_at_genesis() {
        let alice = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let client = Client::new("Alice", alice, &genesis, Arc::new(RecordingNet::default()));

        assert_eq!(client.last_block().id(), genesis.id());
        assert_eq!(client.last_confirmed_block().id(), genesis.id());
        assert_eq!(client.confirmed_balance(), 100);
        assert_eq!(client.chain().len(), 1);
    }

    #[test]
    fn test_post_transaction_broadcasts_and_tracks() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let net = Arc::new(RecordingNet::default());
        let mut client = Client::new("Alice", alice, &genesis, net.clone());

        let mut outputs = BTreeMap::new();
        outputs.insert(bob.address().clone(), 40);
        let tx = client.post_transaction(outputs.clone(), 1).unwrap();
        assert_eq!(tx.nonce, 0);
        assert_eq!(client.available_gold(), 59);

        let second = client.post_transaction(outputs.clone(), 1).unwrap();
        assert_eq!(second.nonce, 1);
        assert_eq!(client.available_gold(), 18);

        match client.post_transaction(outputs, 1) {
            Err(ClientError::InsufficientGold { requested, available }) => {
                assert_eq!(requested, 41);
                assert_eq!(available, 18);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let sent = net.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (None, Message::PostTransaction(tx)));

        client.resend_pending_transactions();
        assert_eq!(net.take().len(), 2);
    }

    #[test]
    fn test_accepts_longer_chain() {
        let alice = Wallet::new();
        let miner = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let mut client = Client::new("Alice", alice, &genesis, Arc::new(RecordingNet::default()));

        let chain = extend(&genesis, &miner, 2);
        for block in &chain {
            client.receive_block(block.header().clone()).unwrap();
        }

        assert_eq!(client.last_block().id(), chain[1].id());
        assert_eq!(client.chain().len(), 3);
        // The first block's reward is paid inside the second block.
        assert_eq!(client.last_block().balance_of(miner.address()), cfg.coinbase_reward);
    }

    #[test]
    fn test_duplicate_block_rejected_without_change() {
        let alice = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let mut client = Client::new("Alice", alice.clone(), &genesis, Arc::new(RecordingNet::default()));

        let block = extend(&genesis, &alice, 1).remove(0);
        client.receive_block(block.header().clone()).unwrap();
        assert!(matches!(
            client.receive_block(block.header().clone()),
            Err(BlockError::DuplicateBlock(_))
        ));
        assert!(matches!(
            client.receive_block(genesis.header().clone()),
            Err(BlockError::DuplicateBlock(_))
        ));
        assert_eq!(client.known_blocks(), 2);
    }

    #[test]
    fn test_invalid_proof_rejected() {
        let alice = Wallet::new();
        let impossible = config(264);
        let genesis = genesis_for(&[(&alice, 100)], &impossible);
        let mut client = Client::new("Alice", alice.clone(), &genesis, Arc::new(RecordingNet::default()));

        let block = Block::next(&genesis, alice.address().clone());
        assert!(matches!(
            client.receive_block(block.header().clone()),
            Err(BlockError::InvalidProof(_))
        ));
        assert_eq!(client.known_blocks(), 1);
    }

    #[test]
    fn test_invalid_transaction_rejects_block() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let mut client = Client::new("Bob", bob.clone(), &genesis, Arc::new(RecordingNet::default()));

        // Alice signs a transfer bigger than her balance; the miner forces it in.
        let mut outputs = BTreeMap::new();
        outputs.insert(bob.address().clone(), 500);
        let mut tx = Transaction::new(alice.address().clone(), 0, *alice.public_key(), outputs, 1, "");
        tx.sign(&alice);

        let mut header = Block::next(&genesis, bob.address().clone()).header().clone();
        header.transactions.push(tx);
        while !header.has_valid_proof(&cfg.target) {
            header.proof += 1;
        }

        assert!(matches!(
            client.receive_block(header),
            Err(BlockError::InvalidTransaction { .. })
        ));
        assert_eq!(client.last_block().id(), genesis.id());
    }

    #[test]
    fn test_missing_block_held_then_accepted() {
        let alice = Wallet::new();
        let miner = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let net = Arc::new(RecordingNet::default());
        let mut client = Client::new("Alice", alice.clone(), &genesis, net.clone());

        let chain = extend(&genesis, &miner, 3);

        assert!(matches!(
            client.receive_block(chain[2].header().clone()),
            Err(BlockError::MissingPredecessor { .. })
        ));
        assert_eq!(client.stuck_blocks(), 1);

        let requests = net.take();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].1,
            Message::MissingBlock(MissingBlockRequest {
                from: alice.address().clone(),
                missing: chain[1].id(),
            })
        );

        // Seeing the same stuck block again does not ask twice.
        assert!(client.receive_block(chain[2].header().clone()).is_err());
        assert!(net.take().is_empty());
        assert_eq!(client.stuck_blocks(), 1);

        assert!(client.receive_block(chain[1].header().clone()).is_err());
        assert_eq!(client.stuck_blocks(), 2);

        // The root arrives; everything above it is accepted without re-announcement.
        client.receive_block(chain[0].header().clone()).unwrap();
        assert_eq!(client.stuck_blocks(), 0);
        assert_eq!(client.last_block().id(), chain[2].id());
        assert_eq!(client.known_blocks(), 4);
    }

    #[test]
    fn test_provide_missing_block() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let net = Arc::new(RecordingNet::default());
        let client = Client::new("Alice", alice, &genesis, net.clone());

        client.provide_missing_block(&MissingBlockRequest {
            from: bob.address().clone(),
            missing: "unknown".to_string(),
        });
        assert!(net.take().is_empty());

        client.provide_missing_block(&MissingBlockRequest {
            from: bob.address().clone(),
            missing: genesis.id(),
        });
        assert_eq!(
            net.take(),
            vec![(
                Some(bob.address().clone()),
                Message::ProofFound(genesis.header().clone())
            )]
        );
    }

    #[test]
    fn test_confirmation_depth_and_pending_cleanup() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let miner = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let mut client = Client::new("Alice", alice.clone(), &genesis, Arc::new(RecordingNet::default()));

        let mut outputs = BTreeMap::new();
        outputs.insert(bob.address().clone(), 10);
        let tx = client.post_transaction(outputs, 1).unwrap();

        let mut first = Block::next(&genesis, miner.address().clone());
        first.add_transaction(tx).unwrap();
        let first = seal(first);
        client.receive_block(first.header().clone()).unwrap();
        assert_eq!(client.pending_outgoing_transactions().count(), 1);

        let depth = cfg.confirmed_depth as usize;
        let rest = extend(&first, &miner, depth - 1);
        for block in &rest {
            client.receive_block(block.header().clone()).unwrap();
        }
        // Tip at height `depth`, so genesis is still the confirmed block.
        assert_eq!(client.last_confirmed_block().id(), genesis.id());
        assert_eq!(client.pending_outgoing_transactions().count(), 1);
        assert_eq!(client.available_gold(), 89);

        let tip = extend(rest.last().unwrap(), &miner, 1).remove(0);
        client.receive_block(tip.header().clone()).unwrap();
        assert_eq!(client.last_confirmed_block().id(), first.id());
        assert_eq!(client.pending_outgoing_transactions().count(), 0);
        assert_eq!(client.confirmed_balance(), 89);
    }

    #[test]
    fn test_equal_length_fork_keeps_first_seen() {
        let alice = Wallet::new();
        let minnie = Wallet::new();
        let mickey = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let mut client = Client::new("Alice", alice, &genesis, Arc::new(RecordingNet::default()));

        let first = extend(&genesis, &minnie, 1).remove(0);
        let rival = extend(&genesis, &mickey, 1).remove(0);

        client.receive_block(first.header().clone()).unwrap();
        client.receive_block(rival.header().clone()).unwrap();

        assert_eq!(client.last_block().id(), first.id());
        assert!(client.block(&rival.id()).is_some());
    }

    #[test]
    fn test_block_with_inflated_height_rejected() {
        let alice = Wallet::new();
        let miner = Wallet::new();
        let mallory = Wallet::new();
        let cfg = config(8);
        let genesis = genesis_for(&[(&alice, 100)], &cfg);
        let mut client = Client::new("Alice", alice, &genesis, Arc::new(RecordingNet::default()));

        let honest = extend(&genesis, &miner, 3);
        for block in &honest {
            client.receive_block(block.header().clone()).unwrap();
        }

        let mut forged = Block::next(&genesis, mallory.address().clone()).header().clone();
        forged.chain_length = 1_000_000;
        while !forged.has_valid_proof(&cfg.target) {
            forged.proof += 1;
        }

        assert!(matches!(
            client.receive_block(forged),
            Err(BlockError::InvalidChainLength { expected: 1, got: 1_000_000, .. })
        ));
        assert_eq!(client.last_block().id(), honest[2].id());
        assert_eq!(client.last_block().chain_length(), 3);
        assert_eq!(client.known_blocks(), 4);
    }
}
