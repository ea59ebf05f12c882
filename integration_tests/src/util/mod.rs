use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use fil_markets_runtime::blockstore::{MemoryBlockstore, SharedBlockstore};
use fil_markets_runtime::config::{BackoffConfigBuilder, MarketConfig, MarketConfigBuilder};
use fil_markets_runtime::datastore::{Datastore, MemoryDatastore};
use fil_markets_runtime::network::{MemoryNetwork, PeerId};
use fil_markets_runtime::piecestore::MemoryPieceStore;
use fil_markets_runtime::test_utils::init_logging;
use fil_retrieval_market::testing::{TestRetrievalClientNode, TestRetrievalProviderNode, TestSectorAccessor};
use fil_retrieval_market::{Ask, ClientDealState, DealId, RetrievalClient, RetrievalPeer, RetrievalProvider};
use fil_storage_market::testing::{TestChain, TestStorageNode};
use fil_storage_market::transfer::MemoryTransferNetwork;
use fil_storage_market::{ClientDeal, MinerDeal, StorageClient, StorageDealStatus, StorageProvider, StorageProviderInfo};
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use crate::*;

pub mod workflows;

pub fn market_config() -> MarketConfig {
    let backoff = BackoffConfigBuilder::default()
        .min_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(40))
        .max_attempts(3)
        .jitter(false)
        .build()
        .expect("valid backoff config");
    MarketConfigBuilder::default()
        .stream_backoff(backoff)
        .close_transfer_timeout(Duration::from_millis(500))
        .deal_status_poll_interval(Duration::from_millis(20))
        .transfer_restart_timeout(Duration::from_secs(5))
        .shutdown_grace(Duration::from_millis(500))
        .build()
        .expect("valid market config")
}

pub fn retrieval_ask() -> Ask {
    Ask {
        price_per_byte: TokenAmount::from_atto(RETRIEVAL_PRICE_PER_BYTE),
        unseal_price: TokenAmount::zero(),
        payment_interval: PAYMENT_INTERVAL,
        payment_interval_increase: PAYMENT_INTERVAL_INCREASE,
    }
}

/// One client and one storage provider on a shared test chain. The provider runs storage and
/// retrieval on the same peer, datastore, block store and piece store, and its sealed sectors
/// become readable by retrieval once [`workflows::expose_sector`] copies them out.
pub struct MarketFixture {
    pub chain: Arc<TestChain>,
    pub network: MemoryNetwork,
    pub transfers: MemoryTransferNetwork,

    pub provider_node: Arc<TestStorageNode>,
    pub provider_ds: Arc<dyn Datastore>,
    pub provider_bs: SharedBlockstore,
    pub pieces: Arc<MemoryPieceStore>,
    pub sectors: Arc<TestSectorAccessor>,
    pub retrieval_provider_node: Arc<TestRetrievalProviderNode>,
    pub storage_provider: Arc<StorageProvider>,
    pub retrieval_provider: Arc<RetrievalProvider>,

    pub client_node: Arc<TestStorageNode>,
    pub client_bs: SharedBlockstore,
    pub retrieval_client_node: Arc<TestRetrievalClientNode>,
    pub storage_client: StorageClient,
    pub retrieval_client: RetrievalClient,
}

impl MarketFixture {
    pub async fn new() -> Self {
        init_logging();
        let chain = TestChain::new();
        chain.set_head(GENESIS_HEAD);
        chain.register_worker(*MINER_ADDR, *WORKER_ADDR);
        let network = MemoryNetwork::new();
        let transfers = MemoryTransferNetwork::new();

        let provider_node = Arc::new(TestStorageNode::new(chain.clone()));
        let provider_ds = MemoryDatastore::shared();
        let provider_bs = MemoryBlockstore::shared();
        let pieces = Arc::new(MemoryPieceStore::new());
        let sectors = Arc::new(TestSectorAccessor::new());
        let retrieval_provider_node = Arc::new(TestRetrievalProviderNode::new(*WORKER_ADDR));
        let (storage_provider, retrieval_provider) = start_providers(
            &network,
            &transfers,
            &provider_node,
            &retrieval_provider_node,
            &provider_ds,
            &provider_bs,
            &pieces,
            &sectors,
        )
        .await;

        let client_node = Arc::new(TestStorageNode::new(chain.clone()));
        let client_ds = MemoryDatastore::shared();
        let client_bs = MemoryBlockstore::shared();
        let client_host = Arc::new(network.host(PeerId::new(CLIENT_PEER)));
        let storage_client = StorageClient::new(
            client_node.clone(),
            client_host.clone(),
            Arc::new(transfers.endpoint(PeerId::new(CLIENT_PEER))),
            client_ds.clone(),
            client_bs.clone(),
            market_config(),
        )
        .expect("storage client");
        storage_client.start().await.expect("storage client start");

        let retrieval_client_node = Arc::new(TestRetrievalClientNode::new(*PAYMENT_CHANNEL));
        let retrieval_client = RetrievalClient::new(
            retrieval_client_node.clone(),
            client_host,
            client_ds,
            MemoryBlockstore::shared(),
            market_config(),
        )
        .expect("retrieval client");
        retrieval_client.start().await.expect("retrieval client start");

        Self {
            chain,
            network,
            transfers,
            provider_node,
            provider_ds,
            provider_bs,
            pieces,
            sectors,
            retrieval_provider_node,
            storage_provider,
            retrieval_provider,
            client_node,
            client_bs,
            retrieval_client_node,
            storage_client,
            retrieval_client,
        }
    }

    /// Stops both providers and starts new ones on the same stores, as after a process restart.
    pub async fn restart_providers(&mut self) {
        self.storage_provider.stop().await.expect("storage provider stop");
        self.retrieval_provider.stop().await.expect("retrieval provider stop");
        let (storage, retrieval) = start_providers(
            &self.network,
            &self.transfers,
            &self.provider_node,
            &self.retrieval_provider_node,
            &self.provider_ds,
            &self.provider_bs,
            &self.pieces,
            &self.sectors,
        )
        .await;
        self.storage_provider = storage;
        self.retrieval_provider = retrieval;
    }

    pub fn storage_provider_info(&self) -> StorageProviderInfo {
        StorageProviderInfo { address: *MINER_ADDR, worker: *WORKER_ADDR, peer_id: PeerId::new(PROVIDER_PEER) }
    }

    pub fn retrieval_peer(&self, piece_cid: Option<Cid>) -> RetrievalPeer {
        RetrievalPeer { address: *MINER_ADDR, id: PeerId::new(PROVIDER_PEER), piece_cid }
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_providers(
    network: &MemoryNetwork,
    transfers: &MemoryTransferNetwork,
    storage_node: &Arc<TestStorageNode>,
    retrieval_node: &Arc<TestRetrievalProviderNode>,
    datastore: &Arc<dyn Datastore>,
    blockstore: &SharedBlockstore,
    pieces: &Arc<MemoryPieceStore>,
    sectors: &Arc<TestSectorAccessor>,
) -> (Arc<StorageProvider>, Arc<RetrievalProvider>) {
    let host = Arc::new(network.host(PeerId::new(PROVIDER_PEER)));
    let storage = StorageProvider::new(
        *MINER_ADDR,
        storage_node.clone(),
        host.clone(),
        Arc::new(transfers.endpoint(PeerId::new(PROVIDER_PEER))),
        pieces.clone(),
        datastore.clone(),
        blockstore.clone(),
        market_config(),
    )
    .expect("storage provider");
    storage.start().await.expect("storage provider start");

    let retrieval = RetrievalProvider::new(
        *MINER_ADDR,
        retrieval_node.clone(),
        host,
        pieces.clone(),
        sectors.clone(),
        datastore.clone(),
        blockstore.clone(),
        market_config(),
    )
    .expect("retrieval provider");
    retrieval.set_ask(retrieval_ask()).expect("retrieval ask");
    retrieval.start().await.expect("retrieval provider start");
    (storage, retrieval)
}

const POLL: Duration = Duration::from_millis(10);
const POLL_ROUNDS: usize = 1000;

/// Polls the client's deal until it reaches `state` or a final state.
pub async fn wait_storage_client(client: &StorageClient, cid: &Cid, state: StorageDealStatus) -> ClientDeal {
    for _ in 0..POLL_ROUNDS {
        let deal = client.get_local_deal(cid).await.expect("client deal");
        if deal.state == state || deal.state.is_final() {
            return deal;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("client storage deal {} never reached {}", cid, state);
}

/// Polls the provider's deal, which may not exist yet, until it reaches `state` or a final
/// state.
pub async fn wait_storage_provider(provider: &StorageProvider, cid: &Cid, state: StorageDealStatus) -> MinerDeal {
    for _ in 0..POLL_ROUNDS {
        if let Ok(deal) = provider.get_local_deal(cid).await {
            if deal.state == state || deal.state.is_final() {
                return deal;
            }
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("provider storage deal {} never reached {}", cid, state);
}

pub async fn wait_retrieval_final(client: &RetrievalClient, id: DealId) -> ClientDealState {
    for _ in 0..POLL_ROUNDS {
        let deal = client.get_deal(id).await.expect("retrieval deal");
        if deal.status.is_final() {
            return deal;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("retrieval deal {} never finished", id);
}
