use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use cid::Cid;
use clap::Parser;
use fil_markets_runtime::blockstore::MemoryBlockstore;
use fil_markets_runtime::config::MarketConfig;
use fil_markets_runtime::datastore::MemoryDatastore;
use fil_markets_runtime::network::{MemoryNetwork, PeerId};
use fil_markets_runtime::piecestore::MemoryPieceStore;
use fil_markets_runtime::test_utils::build_dag;
use fil_retrieval_market::testing::{TestRetrievalClientNode, TestRetrievalProviderNode, TestSectorAccessor};
use fil_retrieval_market::{Ask, DealStatus, Params, RetrievalClient, RetrievalPeer, RetrievalProvider};
use fil_storage_market::testing::{TestChain, TestStorageNode};
use fil_storage_market::transfer::MemoryTransferNetwork;
use fil_storage_market::{
    DataRef, ProposeStorageDealParams, StorageClient, StorageDealStatus, StorageProvider, StorageProviderInfo,
};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use log::info;

const CLIENT_PEER: &str = "client";
const PROVIDER_PEER: &str = "provider";
const POLL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[clap(name = env!("CARGO_PKG_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Runs a storage deal and a retrieval deal between an in-process client and provider.", long_about = None)]
struct Cli {
    /// JSON file with market settings; defaults are used for missing fields
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Seed for the generated payload
    #[clap(short, long, default_value_t = 1)]
    seed: u64,

    /// Number of leaf blocks in the payload
    #[clap(short, long, default_value_t = 4)]
    leaves: usize,

    /// Seconds to wait for each deal to finish
    #[clap(short, long, default_value_t = 30)]
    timeout: u64,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MarketConfig> {
    match path {
        None => Ok(MarketConfig::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
        }
    }
}

/// Polls `check` until it yields a value or `timeout` passes.
async fn poll<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = check().await? {
            return Ok(v);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for {}", what));
        }
        tokio::time::sleep(POLL).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let timeout = Duration::from_secs(cli.timeout);

    let client_wallet = Address::new_id(1000);
    let miner = Address::new_id(2000);
    let worker = Address::new_id(2001);
    let paych = Address::new_id(3000);

    let chain = TestChain::new();
    chain.set_head(10);
    chain.register_worker(miner, worker);
    let network = MemoryNetwork::new();
    let transfers = MemoryTransferNetwork::new();

    // Provider side: storage and retrieval share one host and one set of stores.
    let provider_ds = MemoryDatastore::shared();
    let provider_bs = MemoryBlockstore::shared();
    let pieces = Arc::new(MemoryPieceStore::new());
    let sectors = Arc::new(TestSectorAccessor::new());
    let provider_host = Arc::new(network.host(PeerId::new(PROVIDER_PEER)));
    let storage_provider = StorageProvider::new(
        miner,
        Arc::new(TestStorageNode::new(chain.clone())),
        provider_host.clone(),
        Arc::new(transfers.endpoint(PeerId::new(PROVIDER_PEER))),
        pieces.clone(),
        provider_ds.clone(),
        provider_bs.clone(),
        config.clone(),
    )?;
    storage_provider.start().await?;
    let retrieval_provider = RetrievalProvider::new(
        miner,
        Arc::new(TestRetrievalProviderNode::new(worker)),
        provider_host,
        pieces,
        sectors.clone(),
        provider_ds,
        provider_bs,
        config.clone(),
    )?;
    retrieval_provider.set_ask(Ask {
        price_per_byte: TokenAmount::from_atto(2),
        unseal_price: TokenAmount::from_atto(0),
        payment_interval: 4096,
        payment_interval_increase: 1024,
    })?;
    retrieval_provider.start().await?;

    // Client side.
    let client_ds = MemoryDatastore::shared();
    let client_bs = MemoryBlockstore::shared();
    let client_host = Arc::new(network.host(PeerId::new(CLIENT_PEER)));
    let storage_client = StorageClient::new(
        Arc::new(TestStorageNode::new(chain.clone())),
        client_host.clone(),
        Arc::new(transfers.endpoint(PeerId::new(CLIENT_PEER))),
        client_ds.clone(),
        client_bs.clone(),
        config.clone(),
    )?;
    storage_client.start().await?;
    let retrieval_client = RetrievalClient::new(
        Arc::new(TestRetrievalClientNode::new(paych)),
        client_host,
        client_ds,
        MemoryBlockstore::shared(),
        config,
    )?;
    retrieval_client.start().await?;

    let leaves = vec![2048; cli.leaves];
    let dag = build_dag(cli.seed, 512, &leaves)?;
    dag.put_into(&client_bs)?;
    info!("payload {} has {} blocks, {} bytes", dag.root, dag.blocks.len(), dag.total_size());

    let proposal = storage_client
        .propose_storage_deal(ProposeStorageDealParams {
            wallet: client_wallet,
            provider: StorageProviderInfo { address: miner, worker, peer_id: PeerId::new(PROVIDER_PEER) },
            data: DataRef::graphsync(dag.root),
            start_epoch: 100,
            end_epoch: 10_100,
            price_per_epoch: TokenAmount::from_atto(20_000),
            collateral: TokenAmount::from_atto(1_000),
            verified_deal: false,
            label: format!("demo {}", dag.root),
        })
        .await?;
    info!("proposed storage deal {}", proposal);

    let provider = &storage_provider;
    let proposal = &proposal;
    let deal = poll("storage deal", timeout, || async move {
        let deal = match provider.get_local_deal(proposal).await {
            Ok(deal) => deal,
            Err(_) => return Ok(None),
        };
        if deal.state == StorageDealStatus::Active {
            Ok(Some(deal))
        } else if deal.state.is_final() {
            Err(anyhow!("storage deal ended in {}: {}", deal.state, deal.message))
        } else {
            Ok(None)
        }
    })
    .await?;
    let sector = deal.sector_number.ok_or_else(|| anyhow!("active deal has no sector"))?;
    let piece_cid: Cid = deal.proposal().piece_cid;
    info!("storage deal active as deal {:?} in sector {}", deal.deal_id, sector);

    let sealed = chain.sector_data(sector).ok_or_else(|| anyhow!("sector {} was never sealed", sector))?;
    sectors.add_sector(sector, sealed);

    let id = retrieval_client
        .retrieve(
            dag.root,
            Params::new(TokenAmount::from_atto(2), 4096, 1024, TokenAmount::from_atto(0)).with_piece(piece_cid),
            TokenAmount::from_atto(2 * dag.total_size() + 1),
            RetrievalPeer { address: miner, id: PeerId::new(PROVIDER_PEER), piece_cid: Some(piece_cid) },
            client_wallet,
            miner,
        )
        .await?;
    let client = &retrieval_client;
    let retrieved = poll("retrieval deal", timeout, || async move {
        let deal = client.get_deal(id).await?;
        Ok(deal.status.is_final().then_some(deal))
    })
    .await?;
    if retrieved.status != DealStatus::Completed {
        return Err(anyhow!("retrieval ended in {}: {}", retrieved.status, retrieved.message));
    }

    let store = retrieval_client.deal_store(retrieved.id())?;
    for (cid, data) in &dag.blocks {
        match store.store.get(cid)? {
            Some(block) if &block == data => {}
            _ => return Err(anyhow!("retrieved payload is missing block {}", cid)),
        }
    }
    println!(
        "retrieved {} bytes of {} for {}",
        retrieved.total_received, dag.root, retrieved.funds_spent
    );

    retrieval_client.stop().await?;
    storage_client.stop().await?;
    retrieval_provider.stop().await?;
    storage_provider.stop().await?;
    Ok(())
}
