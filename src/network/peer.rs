use log::{debug, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use super::message::Message;
use super::MessageHandler;

/// Drives one peer: decodes each inbox payload and hands it to the node
///
/// The loop yields after every message so a miner's search bursts interleave
/// with other peers. It ends when `shutdown` turns true, when the shutdown
/// sender goes away, or when the inbox is closed and drained. The node is
/// handed back so its final state can be inspected.
pub async fn run_peer<H>(
    mut peer: H,
    mut inbox: UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> H
where
    H: MessageHandler + Send,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            payload = inbox.recv() => match payload {
                Some(bytes) => match Message::decode(&bytes) {
                    Ok(message) => peer.handle(message),
                    Err(err) => warn!("{}: dropping malformed message: {}", peer.name(), err),
                },
                None => break,
            },
        }

        tokio::task::yield_now().await;
    }

    debug!("{}: stopped", peer.name());
    peer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::network::{FakeNet, Network};

    #[derive(Default)]
    struct Counter {
        seen: Vec<&'static str>,
    }

    impl MessageHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn handle(&mut self, message: Message) {
            self.seen.push(message.kind());
        }
    }

    #[tokio::test]
    async fn test_drains_inbox_and_skips_garbage() {
        let net = FakeNet::new();
        let wallet = Wallet::new();
        let inbox = net.register(wallet.address());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        net.send_message(wallet.address(), &Message::StartMining);
        assert!(net.deliver(wallet.address(), vec![0xde, 0xad, 0xbe, 0xef, 0x00]));
        net.broadcast(&Message::StartMining);
        net.unregister(wallet.address());

        let counter = run_peer(Counter::default(), inbox, shutdown_rx).await;
        assert_eq!(counter.seen, vec!["START_MINING", "START_MINING"]);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let net = FakeNet::new();
        let wallet = Wallet::new();
        let inbox = net.register(wallet.address());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_peer(Counter::default(), inbox, shutdown_rx));
        shutdown_tx.send(true).unwrap();

        let counter = task.await.unwrap();
        assert!(counter.seen.is_empty());
        // Still registered: the loop ended because of the signal, not the inbox.
        assert_eq!(net.peer_count(), 1);
    }
}
