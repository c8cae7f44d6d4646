// Network module
//
// The consensus core only ever talks to peers through the `Network` trait.
// This module holds the message types, the simulated network used by the
// driver and the loop that feeds a peer's inbox into its handler.

pub mod fake_net;
pub mod message;
pub mod peer;

pub use fake_net::FakeNet;
pub use message::{Message, MissingBlockRequest};
pub use peer::run_peer;

use crate::blockchain::crypto::Address;

/// The send capability a node uses to reach its peers
pub trait Network: Send + Sync {
    /// Sends `message` to every registered peer, the sender included
    fn broadcast(&self, message: &Message);

    /// Sends `message` to a single peer
    fn send_message(&self, to: &Address, message: &Message);
}

/// Typed dispatch of inbound messages to a node
pub trait MessageHandler {
    /// Name used in log lines
    fn name(&self) -> &str;

    /// Handles one message. Never fails: bad input is logged and dropped.
    fn handle(&mut self, message: Message);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records outbound traffic instead of delivering it
    #[derive(Default)]
    pub struct RecordingNet {
        sent: Mutex<Vec<(Option<Address>, Message)>>,
    }

    impl RecordingNet {
        /// Drains everything sent so far; `None` marks a broadcast
        pub fn take(&self) -> Vec<(Option<Address>, Message)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Network for RecordingNet {
        fn broadcast(&self, message: &Message) {
            self.sent.lock().unwrap().push((None, message.clone()));
        }

        fn send_message(&self, to: &Address, message: &Message) {
            self.sent.lock().unwrap().push((Some(to.clone()), message.clone()));
        }
    }
}
