// Node module
//
// A client tracks its own view of the chain and the transactions it has sent.
// A miner wraps a client and adds the proof-of-work search.

pub mod client;
pub mod miner;

pub use client::Client;
pub use miner::Miner;
