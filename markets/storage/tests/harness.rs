#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use fil_markets_runtime::blockstore::{MemoryBlockstore, SharedBlockstore};
use fil_markets_runtime::config::{BackoffConfigBuilder, MarketConfig, MarketConfigBuilder};
use fil_markets_runtime::datastore::{Datastore, MemoryDatastore};
use fil_markets_runtime::network::{MemoryNetwork, PeerId};
use fil_markets_runtime::piecestore::MemoryPieceStore;
use fil_markets_runtime::test_utils::{build_dag, init_logging, TestDag};
use fil_storage_market::testing::{TestChain, TestStorageNode};
use fil_storage_market::transfer::{DataTransfer, MemoryDataTransfer, MemoryTransferNetwork};
use fil_storage_market::{
    ClientDeal, DataRef, MinerDeal, ProposeStorageDealParams, StorageClient, StorageDealStatus, StorageProvider,
    StorageProviderInfo,
};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use lazy_static::lazy_static;

pub const CLIENT_PEER: &str = "storage-client-peer";
pub const PROVIDER_PEER: &str = "storage-provider-peer";
pub const HEAD: ChainEpoch = 100;
pub const START_EPOCH: ChainEpoch = 200;
pub const END_EPOCH: ChainEpoch = 1200;
pub const PRICE_PER_EPOCH: u64 = 10_000;
pub const COLLATERAL: u64 = 5_000;

lazy_static! {
    pub static ref CLIENT_WALLET: Address = Address::new_id(1001);
    pub static ref MINER: Address = Address::new_id(2001);
    pub static ref WORKER: Address = Address::new_id(2002);
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

pub fn fast_config() -> MarketConfig {
    let backoff = BackoffConfigBuilder::default()
        .min_delay(ms(10))
        .max_delay(ms(20))
        .max_attempts(2)
        .jitter(false)
        .build()
        .unwrap();
    MarketConfigBuilder::default()
        .stream_backoff(backoff)
        .close_transfer_timeout(ms(500))
        .deal_status_poll_interval(ms(20))
        .transfer_restart_timeout(ms(100))
        .shutdown_grace(ms(500))
        .build()
        .unwrap()
}

pub fn payload(seed: u64) -> TestDag {
    build_dag(seed, 200, &[1500, 2500]).unwrap()
}

pub struct Setup {
    pub chain: Arc<TestChain>,
    pub network: MemoryNetwork,
    pub transfers: MemoryTransferNetwork,
    pub client: StorageClient,
    pub client_node: Arc<TestStorageNode>,
    pub client_bs: SharedBlockstore,
    pub provider: Arc<StorageProvider>,
    pub provider_node: Arc<TestStorageNode>,
    pub provider_ds: Arc<dyn Datastore>,
    pub provider_bs: SharedBlockstore,
    pub pieces: Arc<MemoryPieceStore>,
}

/// A started client and provider sharing one chain, stream network and transfer network.
pub async fn setup() -> Setup {
    setup_with_client_transfer(|endpoint| Arc::new(endpoint)).await
}

/// Like `setup`, with the client's transfer endpoint wrapped by `wrap`.
pub async fn setup_with_client_transfer<F>(wrap: F) -> Setup
where
    F: FnOnce(MemoryDataTransfer) -> Arc<dyn DataTransfer>,
{
    init_logging();
    let chain = TestChain::new();
    chain.set_head(HEAD);
    chain.register_worker(*MINER, *WORKER);
    let network = MemoryNetwork::new();
    let transfers = MemoryTransferNetwork::new();

    let provider_node = Arc::new(TestStorageNode::new(chain.clone()));
    let provider_ds = MemoryDatastore::shared();
    let provider_bs = MemoryBlockstore::shared();
    let pieces = Arc::new(MemoryPieceStore::new());
    let provider =
        new_provider(&network, &transfers, provider_node.clone(), provider_ds.clone(), provider_bs.clone(), pieces.clone(), fast_config())
            .await;

    let client_node = Arc::new(TestStorageNode::new(chain.clone()));
    let client_bs = MemoryBlockstore::shared();
    let client = StorageClient::new(
        client_node.clone(),
        Arc::new(network.host(PeerId::new(CLIENT_PEER))),
        wrap(transfers.endpoint(PeerId::new(CLIENT_PEER))),
        MemoryDatastore::shared(),
        client_bs.clone(),
        fast_config(),
    )
    .unwrap();
    client.start().await.unwrap();

    Setup {
        chain,
        network,
        transfers,
        client,
        client_node,
        client_bs,
        provider,
        provider_node,
        provider_ds,
        provider_bs,
        pieces,
    }
}

pub async fn new_provider(
    network: &MemoryNetwork,
    transfers: &MemoryTransferNetwork,
    node: Arc<TestStorageNode>,
    datastore: Arc<dyn Datastore>,
    blockstore: SharedBlockstore,
    pieces: Arc<MemoryPieceStore>,
    config: MarketConfig,
) -> Arc<StorageProvider> {
    let provider = StorageProvider::new(
        *MINER,
        node,
        Arc::new(network.host(PeerId::new(PROVIDER_PEER))),
        Arc::new(transfers.endpoint(PeerId::new(PROVIDER_PEER))),
        pieces,
        datastore,
        blockstore,
        config,
    )
    .unwrap();
    provider.start().await.unwrap();
    provider
}

impl Setup {
    pub fn provider_info(&self) -> StorageProviderInfo {
        StorageProviderInfo { address: *MINER, worker: *WORKER, peer_id: PeerId::new(PROVIDER_PEER) }
    }

    pub fn params(&self, data: DataRef) -> ProposeStorageDealParams {
        ProposeStorageDealParams {
            wallet: *CLIENT_WALLET,
            provider: self.provider_info(),
            data,
            start_epoch: START_EPOCH,
            end_epoch: END_EPOCH,
            price_per_epoch: TokenAmount::from_atto(PRICE_PER_EPOCH),
            collateral: TokenAmount::from_atto(COLLATERAL),
            verified_deal: false,
            label: "test deal".to_string(),
        }
    }

    /// Stores `dag` on the client and proposes a pushed deal for it.
    pub async fn propose(&self, dag: &TestDag) -> Cid {
        dag.put_into(&self.client_bs).unwrap();
        self.client.propose_storage_deal(self.params(DataRef::graphsync(dag.root))).await.unwrap()
    }

    /// Restarts the provider on the same stores with `config`.
    pub async fn restart_provider(&mut self, config: MarketConfig) {
        self.provider.stop().await.unwrap();
        self.provider = new_provider(
            &self.network,
            &self.transfers,
            self.provider_node.clone(),
            self.provider_ds.clone(),
            self.provider_bs.clone(),
            self.pieces.clone(),
            config,
        )
        .await;
    }
}

/// Polls until `done` holds for the client deal.
pub async fn wait_for_client<F>(client: &StorageClient, cid: &Cid, done: F) -> ClientDeal
where
    F: Fn(&ClientDeal) -> bool,
{
    for _ in 0..500 {
        let deal = client.get_local_deal(cid).await.unwrap();
        if done(&deal) {
            return deal;
        }
        tokio::time::sleep(ms(10)).await;
    }
    panic!("client deal {} stuck: {:?}", cid, client.get_local_deal(cid).await.unwrap());
}

pub async fn wait_client_state(client: &StorageClient, cid: &Cid, state: StorageDealStatus) -> ClientDeal {
    wait_for_client(client, cid, |d| d.state == state || d.state.is_final()).await
}

/// Polls until `done` holds for the provider deal, which may not exist yet.
pub async fn wait_for_provider<F>(provider: &StorageProvider, cid: &Cid, done: F) -> MinerDeal
where
    F: Fn(&MinerDeal) -> bool,
{
    for _ in 0..500 {
        if let Ok(deal) = provider.get_local_deal(cid).await {
            if done(&deal) {
                return deal;
            }
        }
        tokio::time::sleep(ms(10)).await;
    }
    panic!("provider deal {} stuck: {:?}", cid, provider.get_local_deal(cid).await);
}

pub async fn wait_provider_state(provider: &StorageProvider, cid: &Cid, state: StorageDealStatus) -> MinerDeal {
    wait_for_provider(provider, cid, |d| d.state == state || d.state.is_final()).await
}
