use futures::future::join_all;
use log::info;
use tokio::sync::watch;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

mod blockchain;
mod network;
mod node;

use blockchain::{make_genesis, Address, ChainConfig, LedgerView, Wallet};
use network::{run_peer, FakeNet, Network};
use node::{Client, Miner};

/// How long the simulation runs unless `GOLDCHAIN_SIMULATION_MS` says otherwise
const DEFAULT_SIMULATION_MS: u64 = 5000;

/// When the late miner joins
const LATE_MINER_DELAY: Duration = Duration::from_millis(2000);

/// The late miner searches in longer bursts
const LATE_MINER_ROUNDS: u64 = 3000;

fn simulation_duration() -> anyhow::Result<Duration> {
    let millis = match std::env::var("GOLDCHAIN_SIMULATION_MS") {
        Ok(value) => value.trim().parse()?,
        Err(_) => DEFAULT_SIMULATION_MS,
    };
    Ok(Duration::from_millis(millis))
}

// Restores Donald from GOLDCHAIN_DONALD_SECRET so his address survives restarts
fn donald_wallet() -> anyhow::Result<Wallet> {
    match std::env::var("GOLDCHAIN_DONALD_SECRET") {
        Ok(secret) => Ok(Wallet::from_secret_key(&hex::decode(secret.trim())?)?),
        Err(_) => {
            let wallet = Wallet::new();
            info!(
                "Donald's secret key (set GOLDCHAIN_DONALD_SECRET to reuse it): {}",
                hex::encode(wallet.export_secret_key())
            );
            Ok(wallet)
        }
    }
}

// Log one peer's final view of the chain
fn report(client: &Client, everyone: &[(&str, &Address)]) {
    let tip = client.last_block();
    info!(
        "{}: tip {} at height {}, {} blocks known, {} still waiting",
        client.name(),
        tip.id(),
        tip.chain_length(),
        client.known_blocks(),
        client.stuck_blocks()
    );
    info!(
        "{}: longest chain has {} blocks, {} gold available, {} transactions unconfirmed",
        client.name(),
        client.chain().len(),
        client.available_gold(),
        client.pending_outgoing_transactions().count()
    );

    let confirmed = client.last_confirmed_block();
    let settled = tip.balances_with_reward();
    for (name, address) in everyone {
        info!(
            "{}:   {} has {} gold (confirmed at height {}), {} settled at the tip",
            client.name(),
            name,
            confirmed.balance_of(address),
            confirmed.chain_length(),
            settled.get(*address).copied().unwrap_or(0)
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Arc::new(ChainConfig::from_env()?);
    let run_for = simulation_duration()?;
    info!(
        "Starting simulation: target {}, {} ms",
        config.target,
        run_for.as_millis()
    );

    let fake_net = Arc::new(FakeNet::new());
    let net: Arc<dyn Network> = fake_net.clone();

    let alice = Wallet::new();
    let bob = Wallet::new();
    let charlie = Wallet::new();
    let minnie = Wallet::new();
    let mickey = Wallet::new();
    let donald = donald_wallet()?;

    let everyone = [
        ("Alice", alice.address().clone()),
        ("Bob", bob.address().clone()),
        ("Charlie", charlie.address().clone()),
        ("Minnie", minnie.address().clone()),
        ("Mickey", mickey.address().clone()),
        ("Donald", donald.address().clone()),
    ];
    let everyone: Vec<(&str, &Address)> = everyone.iter().map(|(name, addr)| (*name, addr)).collect();

    let mut balances = BTreeMap::new();
    balances.insert(alice.address().clone(), 233);
    balances.insert(bob.address().clone(), 99);
    balances.insert(charlie.address().clone(), 67);
    balances.insert(minnie.address().clone(), 400);
    balances.insert(mickey.address().clone(), 300);
    let genesis = make_genesis(balances, &config);

    let mut alice_client = Client::new("Alice", alice, &genesis, Arc::clone(&net));
    let bob_client = Client::new("Bob", bob, &genesis, Arc::clone(&net));
    let charlie_client = Client::new("Charlie", charlie, &genesis, Arc::clone(&net));
    let mut minnie_miner = Miner::new(Client::new("Minnie", minnie, &genesis, Arc::clone(&net)));
    let mut mickey_miner = Miner::new(Client::new("Mickey", mickey, &genesis, Arc::clone(&net)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Inboxes must exist before the first broadcast.
    let alice_inbox = fake_net.register(alice_client.address());
    let bob_inbox = fake_net.register(bob_client.address());
    let charlie_inbox = fake_net.register(charlie_client.address());
    let minnie_inbox = fake_net.register(minnie_miner.address());
    let mickey_inbox = fake_net.register(mickey_miner.address());
    info!("{} peers on the network", fake_net.peer_count());

    info!("Initial balances:");
    alice_client.show_all_balances();

    minnie_miner.initialize();
    mickey_miner.initialize();

    let mut outputs = BTreeMap::new();
    outputs.insert(bob_client.address().clone(), 40);
    alice_client.post_transaction(outputs, config.default_tx_fee)?;

    let mut outputs = BTreeMap::new();
    outputs.insert(charlie_client.address().clone(), 20);
    minnie_miner.post_transaction(outputs, config.default_tx_fee)?;

    // Alice stays offline until Donald arrives; her inbox queues meanwhile.
    let mut client_tasks = vec![
        tokio::spawn(run_peer(bob_client, bob_inbox, shutdown_rx.clone())),
        tokio::spawn(run_peer(charlie_client, charlie_inbox, shutdown_rx.clone())),
    ];
    let mut miner_tasks = vec![
        tokio::spawn(run_peer(minnie_miner, minnie_inbox, shutdown_rx.clone())),
        tokio::spawn(run_peer(mickey_miner, mickey_inbox, shutdown_rx.clone())),
    ];

    // Donald only knows genesis and has to catch up through missing-block requests.
    tokio::time::sleep(LATE_MINER_DELAY).await;
    let mut donald_miner = Miner::new(Client::new("Donald", donald, &genesis, Arc::clone(&net)))
        .with_mining_rounds(LATE_MINER_ROUNDS);
    let donald_inbox = fake_net.register(donald_miner.address());
    info!("Donald joins the network ({} peers)", fake_net.peer_count());
    donald_miner.initialize();
    miner_tasks.push(tokio::spawn(run_peer(donald_miner, donald_inbox, shutdown_rx.clone())));

    // Donald missed Alice's transfer, so she announces it again if still unconfirmed.
    alice_client.resend_pending_transactions();
    client_tasks.push(tokio::spawn(run_peer(alice_client, alice_inbox, shutdown_rx)));

    tokio::time::sleep(run_for.saturating_sub(LATE_MINER_DELAY)).await;
    info!("Stopping simulation");
    shutdown_tx.send(true)?;

    for client in join_all(client_tasks).await {
        let client = client?;
        fake_net.unregister(client.address());
        report(&client, &everyone);
    }
    for miner in join_all(miner_tasks).await {
        let miner = miner?;
        fake_net.unregister(miner.address());
        info!(
            "{}: was working on height {}",
            miner.client().name(),
            miner.current_block().chain_length()
        );
        report(miner.client(), &everyone);
    }

    Ok(())
}
