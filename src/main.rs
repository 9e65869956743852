//! Pyrite (PYR) Blockchain Node
//!
//! Wires the consensus engine together: persistent inventory, chain
//! state, miner thread, and a listener that runs the sync protocol with
//! every inbound peer. Configuration comes from the environment:
//! `PYRITE_NETWORK` (production | development), `PYRITE_DATA` (data
//! directory) and `PYRITE_LISTEN` (listen address).

use std::sync::Arc;

use pyrite_core::crypto::PrivateKey;
use pyrite_core::events::EventBus;
use pyrite_core::mining::Miner;
use pyrite_core::node::Node;
use pyrite_core::p2p::{run_sync, StreamTransport, SyncOutcome};
use pyrite_core::params::Params;
use pyrite_core::storage::db::RecordDb;
use pyrite_core::storage::Inventory;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let network = std::env::var("PYRITE_NETWORK").unwrap_or_else(|_| "development".into());
    let params = match network.as_str() {
        "production" => Params::production(),
        _ => Params::development(),
    };
    params.validate()?;
    info!(network, "starting pyrite node");

    let data_dir = std::env::var("PYRITE_DATA").unwrap_or_else(|_| "pyrite-data".into());
    let db = RecordDb::open(&data_dir)?;
    let inv = Arc::new(Inventory::with_db(params.clone(), db));
    let (blocks, merkles, txs) = inv.restore()?;
    info!(blocks, merkles, txs, "inventory restored");

    let bus = EventBus::new();
    let mut node = Node::new(params.clone(), inv.clone(), bus.clone(), true);
    node.rebuild_from_inventory()?;
    info!(head = %node.state().head(), height = node.state().head_height(), "chain state ready");

    // Mining pays out to a fresh throwaway key; durable wallets live
    // outside the core.
    let payout_key = PrivateKey::generate();
    let payout = payout_key.public_key().key_hash();
    info!(%payout, "mining payout public key hash");
    let miner = Miner::new(params.clone(), inv.clone(), payout, &bus);
    std::thread::spawn(move || miner.run());

    // Track the validated head so inbound syncs see the latest chain.
    let (head_tx, head_rx) = tokio::sync::watch::channel(node.state().head());
    let mut validated = bus.subscribe_validated_heads();
    tokio::spawn(async move {
        while let Ok(head) = validated.recv().await {
            let _ = head_tx.send(head);
        }
    });

    let listen = std::env::var("PYRITE_LISTEN").unwrap_or_else(|_| "127.0.0.1:7345".into());
    let listener = TcpListener::bind(&listen).await?;
    info!(%listen, "accepting peer connections");

    let sync_inv = inv.clone();
    let sync_bus = bus.clone();
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "failed to accept peer connection");
                    continue;
                }
            };
            let inv = sync_inv.clone();
            let bus = sync_bus.clone();
            let head = *head_rx.borrow();
            tokio::spawn(async move {
                let mut transport = StreamTransport::new(stream);
                match run_sync(&inv, head, &mut transport).await {
                    Ok(SyncOutcome::Received(candidate)) => {
                        info!(%addr, head = %candidate.head, "received candidate chain from peer");
                        bus.publish_candidate_head(candidate);
                    }
                    Ok(outcome) => debug!(%addr, ?outcome, "sync finished"),
                    Err(err) => warn!(%addr, %err, "sync with peer failed"),
                }
            });
        }
    });

    node.run().await;
    Ok(())
}
