use cid::Cid;
use fil_markets_runtime::test_utils::TestDag;
use fil_retrieval_market::{ClientDealState, DealStatus, Params};
use fil_storage_market::{DataRef, MinerDeal, ProposeStorageDealParams, StorageDealStatus};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::econ::TokenAmount;
use log::info;
use num_traits::Zero;

use crate::util::{wait_retrieval_final, wait_storage_client, wait_storage_provider, MarketFixture};
use crate::*;

pub fn storage_params(f: &MarketFixture, root: Cid) -> ProposeStorageDealParams {
    ProposeStorageDealParams {
        wallet: *CLIENT_WALLET,
        provider: f.storage_provider_info(),
        data: DataRef::graphsync(root),
        start_epoch: DEAL_START,
        end_epoch: DEAL_END,
        price_per_epoch: TokenAmount::from_atto(STORAGE_PRICE_PER_EPOCH),
        collateral: TokenAmount::from_atto(PROVIDER_COLLATERAL),
        verified_deal: false,
        label: format!("payload {}", root),
    }
}

/// Stores `dag` with the provider and waits for the deal to go active on both sides.
pub async fn make_storage_deal(f: &MarketFixture, dag: &TestDag) -> (Cid, MinerDeal) {
    dag.put_into(&f.client_bs).expect("client payload");
    let cid = f.storage_client.propose_storage_deal(storage_params(f, dag.root)).await.expect("proposal");

    let provider_deal = wait_storage_provider(&f.storage_provider, &cid, StorageDealStatus::Active).await;
    assert_eq!(provider_deal.state, StorageDealStatus::Active, "provider: {}", provider_deal.message);
    let client_deal = wait_storage_client(&f.storage_client, &cid, StorageDealStatus::Active).await;
    assert_eq!(client_deal.state, StorageDealStatus::Active, "client: {}", client_deal.message);
    assert_eq!(client_deal.deal_id, provider_deal.deal_id);
    info!("storage deal {} active as deal {:?}", cid, provider_deal.deal_id);
    (cid, provider_deal)
}

/// Makes the sector holding `deal` readable by the retrieval provider.
pub fn expose_sector(f: &MarketFixture, deal: &MinerDeal) {
    let sector = deal.sector_number.expect("sealed deal has a sector");
    let data = f.chain.sector_data(sector).expect("sector was sealed");
    f.sectors.add_sector(sector, data);
}

pub fn retrieval_params(piece_cid: Option<Cid>) -> Params {
    let params = Params::new(
        TokenAmount::from_atto(RETRIEVAL_PRICE_PER_BYTE),
        PAYMENT_INTERVAL,
        PAYMENT_INTERVAL_INCREASE,
        TokenAmount::zero(),
    );
    match piece_cid {
        Some(piece) => params.with_piece(piece),
        None => params,
    }
}

/// Retrieves the whole DAG under `root` and waits for the deal to finish.
pub async fn retrieve(f: &MarketFixture, root: Cid, piece_cid: Option<Cid>, funds: u64) -> ClientDealState {
    let id = f
        .retrieval_client
        .retrieve(
            root,
            retrieval_params(piece_cid),
            TokenAmount::from_atto(funds),
            f.retrieval_peer(piece_cid),
            *CLIENT_WALLET,
            *MINER_ADDR,
        )
        .await
        .expect("retrieval proposal");
    let deal = wait_retrieval_final(&f.retrieval_client, id).await;
    if deal.status == DealStatus::Completed {
        info!("retrieved {} bytes of {}", deal.total_received, root);
    }
    deal
}

/// Checks that every block of `dag` landed in the store of retrieval deal `deal`.
pub fn assert_retrieved(f: &MarketFixture, deal: &ClientDealState, dag: &TestDag) {
    assert_eq!(deal.status, DealStatus::Completed, "{}", deal.message);
    assert_eq!(deal.total_received, dag.total_size());
    let store = f.retrieval_client.deal_store(deal.id()).expect("retrieval store");
    for (cid, data) in &dag.blocks {
        let block = store.store.get(cid).expect("block read");
        assert_eq!(block.as_ref(), Some(data), "block {} missing", cid);
    }
}
