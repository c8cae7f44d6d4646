use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::message::Message;
use super::Network;
use crate::blockchain::crypto::Address;

/// In-process network: one unbounded mailbox per registered address
///
/// Messages are encoded on send and decoded by the receiving peer's task, so
/// peers never share a value, only bytes.
#[derive(Debug, Default)]
pub struct FakeNet {
    peers: DashMap<Address, UnboundedSender<Vec<u8>>>,
}

impl FakeNet {
    pub fn new() -> Self {
        FakeNet::default()
    }

    /// Registers a peer and returns its inbox
    ///
    /// Registering an address again replaces its previous inbox.
    pub fn register(&self, address: &Address) -> UnboundedReceiver<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers.insert(address.clone(), sender);
        receiver
    }

    /// Removes a peer; its task drains what is already queued, then stops
    pub fn unregister(&self, address: &Address) {
        self.peers.remove(address);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queues raw bytes for a peer. Returns false if nobody is listening.
    pub fn deliver(&self, to: &Address, payload: Vec<u8>) -> bool {
        match self.peers.get(to) {
            Some(sender) => sender.send(payload).is_ok(),
            None => false,
        }
    }
}

impl Network for FakeNet {
    fn broadcast(&self, message: &Message) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Dropping {} broadcast: {}", message.kind(), err);
                return;
            }
        };

        for entry in self.peers.iter() {
            if entry.value().send(payload.clone()).is_err() {
                debug!("Peer {} has stopped listening", entry.key().short());
            }
        }
    }

    fn send_message(&self, to: &Address, message: &Message) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Dropping {} for {}: {}", message.kind(), to.short(), err);
                return;
            }
        };

        if !self.deliver(to, payload) {
            debug!("No listener for {} sent to {}", message.kind(), to.short());
        }
    }
}
