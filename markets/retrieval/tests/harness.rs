#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use fil_markets_runtime::blockstore::{MemoryBlockstore, SharedBlockstore};
use fil_markets_runtime::config::{BackoffConfigBuilder, MarketConfig, MarketConfigBuilder};
use fil_markets_runtime::datastore::{Datastore, MemoryDatastore};
use fil_markets_runtime::network::{MemoryNetwork, PeerId};
use fil_markets_runtime::piecestore::MemoryPieceStore;
use fil_markets_runtime::test_utils::{init_logging, random_bytes, TestDag};
use fil_markets_runtime::util::cid::raw_cid;
use fil_retrieval_market::testing::{
    store_payload_piece, TestRetrievalClientNode, TestRetrievalProviderNode, TestSectorAccessor,
};
use fil_retrieval_market::{
    Ask, ClientDealState, DealId, Params, ProviderDealIdentifier, ProviderDealState, RetrievalClient,
    RetrievalPeer, RetrievalProvider,
};
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use lazy_static::lazy_static;
use num_traits::Zero;

pub const CLIENT_PEER: &str = "client-peer";
pub const PROVIDER_PEER: &str = "provider-peer";
pub const PRICE_PER_BYTE: u64 = 1000;
pub const PAYMENT_INTERVAL: u64 = 10_000;
pub const PAYMENT_INTERVAL_INCREASE: u64 = 1000;

lazy_static! {
    pub static ref CLIENT_WALLET: Address = Address::new_id(1001);
    pub static ref MINER: Address = Address::new_id(2001);
    pub static ref WORKER: Address = Address::new_id(2002);
    pub static ref PAY_CH: Address = Address::new_id(3001);
    pub static ref PIECE_CID: Cid = raw_cid(b"retrieval test piece").unwrap();
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
        .shutdown_grace(ms(500))
        .build()
        .unwrap()
}

pub fn default_ask() -> Ask {
    Ask {
        price_per_byte: TokenAmount::from_atto(PRICE_PER_BYTE),
        unseal_price: TokenAmount::zero(),
        payment_interval: PAYMENT_INTERVAL,
        payment_interval_increase: PAYMENT_INTERVAL_INCREASE,
    }
}

pub fn default_params() -> Params {
    Params::new(
        TokenAmount::from_atto(PRICE_PER_BYTE),
        PAYMENT_INTERVAL,
        PAYMENT_INTERVAL_INCREASE,
        TokenAmount::zero(),
    )
}

/// A single raw block payload.
pub fn raw_payload(seed: u64, size: usize) -> TestDag {
    let data = random_bytes(seed, size);
    let root = raw_cid(&data).unwrap();
    TestDag { root, blocks: vec![(root, data)] }
}

pub struct Setup {
    pub network: MemoryNetwork,
    pub client: RetrievalClient,
    pub client_node: Arc<TestRetrievalClientNode>,
    pub client_ds: Arc<dyn Datastore>,
    pub client_bs: SharedBlockstore,
    pub provider: Arc<RetrievalProvider>,
    pub provider_node: Arc<TestRetrievalProviderNode>,
    pub pieces: Arc<MemoryPieceStore>,
    pub sectors: Arc<TestSectorAccessor>,
    pub dag: TestDag,
}

/// A started client and provider on one in-memory network. The provider stores `dag` in a
/// piece sealed into each of `sectors`.
pub async fn setup_with(dag: TestDag, ask: Ask, sector_ids: &[SectorNumber]) -> Setup {
    init_logging();
    let network = MemoryNetwork::new();

    let pieces = Arc::new(MemoryPieceStore::new());
    let sectors = Arc::new(TestSectorAccessor::new());
    store_payload_piece(pieces.as_ref(), &sectors, *PIECE_CID, dag.root, &dag.blocks, sector_ids)
        .await
        .unwrap();

    let provider_node = Arc::new(TestRetrievalProviderNode::new(*WORKER));
    let provider = RetrievalProvider::new(
        *MINER,
        provider_node.clone(),
        Arc::new(network.host(PeerId::new(PROVIDER_PEER))),
        pieces.clone(),
        sectors.clone(),
        MemoryDatastore::shared(),
        MemoryBlockstore::shared(),
        fast_config(),
    )
    .unwrap();
    provider.set_ask(ask).unwrap();
    provider.start().await.unwrap();

    let client_node = Arc::new(TestRetrievalClientNode::new(*PAY_CH));
    let client_ds = MemoryDatastore::shared();
    let client_bs = MemoryBlockstore::shared();
    let client = new_client(&network, client_node.clone(), client_ds.clone(), client_bs.clone()).await;

    Setup { network, client, client_node, client_ds, client_bs, provider, provider_node, pieces, sectors, dag }
}

pub async fn setup(dag: TestDag) -> Setup {
    setup_with(dag, default_ask(), &[1]).await
}

pub async fn new_client(
    network: &MemoryNetwork,
    node: Arc<TestRetrievalClientNode>,
    datastore: Arc<dyn Datastore>,
    blockstore: SharedBlockstore,
) -> RetrievalClient {
    let client = RetrievalClient::new(
        node,
        Arc::new(network.host(PeerId::new(CLIENT_PEER))),
        datastore,
        blockstore,
        fast_config(),
    )
    .unwrap();
    client.start().await.unwrap();
    client
}

impl Setup {
    pub fn peer(&self) -> RetrievalPeer {
        RetrievalPeer { address: *MINER, id: PeerId::new(PROVIDER_PEER), piece_cid: None }
    }

    pub async fn retrieve(&self, params: Params, funds: u64) -> DealId {
        self.client
            .retrieve(self.dag.root, params, TokenAmount::from_atto(funds), self.peer(), *CLIENT_WALLET, *MINER)
            .await
            .unwrap()
    }

    pub fn provider_key(&self, id: DealId) -> ProviderDealIdentifier {
        ProviderDealIdentifier { receiver: PeerId::new(CLIENT_PEER), deal_id: id }
    }
}

/// Polls until `done` holds for the client deal.
pub async fn wait_for_client<F>(client: &RetrievalClient, id: DealId, done: F) -> ClientDealState
where
    F: Fn(&ClientDealState) -> bool,
{
    for _ in 0..500 {
        let deal = client.get_deal(id).await.unwrap();
        if done(&deal) {
            return deal;
        }
        tokio::time::sleep(ms(10)).await;
    }
    panic!("client deal {} stuck: {:?}", id, client.get_deal(id).await.unwrap());
}

pub async fn wait_client_final(client: &RetrievalClient, id: DealId) -> ClientDealState {
    wait_for_client(client, id, |d| d.status.is_final()).await
}

pub async fn wait_provider_final(provider: &RetrievalProvider, key: &ProviderDealIdentifier) -> ProviderDealState {
    for _ in 0..500 {
        if let Ok(deal) = provider.get_deal(key).await {
            if deal.status.is_final() {
                return deal;
            }
        }
        tokio::time::sleep(ms(10)).await;
    }
    panic!("provider deal {} stuck: {:?}", key, provider.get_deal(key).await);
}
