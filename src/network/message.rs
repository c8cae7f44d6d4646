use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::block::SealedBlockHeader;
use crate::blockchain::crypto::Address;
use crate::blockchain::transaction::Transaction;

/// Errors raised while moving messages between peers
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Payload of a `MISSING_BLOCK` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingBlockRequest {
    /// Who to send the block back to
    pub from: Address,

    /// Id of the block being asked for
    pub missing: String,
}

/// Every event a peer can receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A transaction proposed to all peers
    PostTransaction(Transaction),

    /// A newly mined block, or a block sent in answer to a request
    ProofFound(SealedBlockHeader),

    /// Tells a miner to run its next burst of proof search
    StartMining,

    /// A request for a block the sender does not have
    MissingBlock(MissingBlockRequest),
}

impl Message {
    /// Event name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PostTransaction(_) => "POST_TRANSACTION",
            Message::ProofFound(_) => "PROOF_FOUND",
            Message::StartMining => "START_MINING",
            Message::MissingBlock(_) => "MISSING_BLOCK",
        }
    }

    /// Serializes the message into its wire form
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::EncodingError(e.to_string()))
    }

    /// Parses a wire payload
    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        bincode::deserialize(bytes).map_err(|e| NetworkError::DecodingError(e.to_string()))
    }
}
