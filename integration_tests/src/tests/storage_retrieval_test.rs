use fil_markets_runtime::piecestore::PieceStore;
use fil_markets_runtime::test_utils::build_dag;
use fil_markets_runtime::util::cid::raw_cid;
use fil_retrieval_market::{DealStatus, QueryItemStatus, QueryParams, QueryResponseStatus};
use fil_storage_market::StorageDealStatus;
use fvm_shared::econ::TokenAmount;

use crate::util::workflows::{assert_retrieved, expose_sector, make_storage_deal, retrieve};
use crate::util::{wait_storage_client, wait_storage_provider, MarketFixture};
use crate::*;

/// A payload stored through a storage deal can be queried and retrieved from the same
/// provider, unsealing the sector it was sealed into.
pub async fn store_then_retrieve_test(f: &MarketFixture) {
    let dag = build_dag(21, 600, &[3000, 2000, 1000]).expect("payload");
    let (_, deal) = make_storage_deal(f, &dag).await;
    let piece_cid = deal.proposal().piece_cid;
    let sector = deal.sector_number.expect("sector");

    // Indexed as soon as the deal is active.
    let query = f
        .retrieval_client
        .query(&f.retrieval_peer(None), dag.root, QueryParams { piece_cid: None })
        .await
        .expect("query");
    assert_eq!(query.status, QueryResponseStatus::Available);
    assert_eq!(query.piece_cid_found, QueryItemStatus::Available);
    assert_eq!(query.size, deal.proposal().piece_size.unpadded().0);
    assert_eq!(query.payment_address, *WORKER_ADDR);
    assert_eq!(query.min_price_per_byte, TokenAmount::from_atto(RETRIEVAL_PRICE_PER_BYTE));

    expose_sector(f, &deal);
    let retrieved = retrieve(f, dag.root, Some(piece_cid), 1_000_000).await;
    assert_retrieved(f, &retrieved, &dag);
    assert_eq!(f.sectors.unseal_calls(), vec![sector]);
    assert_eq!(
        retrieved.funds_spent,
        TokenAmount::from_atto(RETRIEVAL_PRICE_PER_BYTE * dag.total_size())
    );
    assert_eq!(f.retrieval_provider.stats()["deals_completed"], 1);
}

/// A payload the provider never stored is reported unavailable, at no price.
pub async fn query_unknown_payload_test(f: &MarketFixture) {
    let unknown = raw_cid(b"never stored").expect("cid");
    let query = f
        .retrieval_client
        .query(&f.retrieval_peer(None), unknown, QueryParams { piece_cid: None })
        .await
        .expect("query");
    assert_eq!(query.status, QueryResponseStatus::Unavailable);
    assert_eq!(query.piece_cid_found, QueryItemStatus::Unavailable);
    assert_eq!(query.min_price_per_byte, TokenAmount::from_atto(0));

    let retrieved = retrieve(f, unknown, None, 1_000_000).await;
    assert_ne!(retrieved.status, DealStatus::Completed);
}

/// Storing the same payload twice yields one piece held by two deals in two sectors, and
/// retrieval still works when only the second sector can be read.
pub async fn same_payload_two_deals_test(f: &MarketFixture) {
    let dag = build_dag(33, 300, &[2500, 2500]).expect("payload");
    let (_, first) = make_storage_deal(f, &dag).await;

    let mut params = crate::util::workflows::storage_params(f, dag.root);
    params.label = "second copy".to_string();
    let second_cid = f.storage_client.propose_storage_deal(params).await.expect("second proposal");
    let second = wait_storage_provider(&f.storage_provider, &second_cid, StorageDealStatus::Active).await;
    assert_eq!(second.state, StorageDealStatus::Active, "{}", second.message);
    wait_storage_client(&f.storage_client, &second_cid, StorageDealStatus::Active).await;

    let piece_cid = first.proposal().piece_cid;
    assert_eq!(second.proposal().piece_cid, piece_cid);
    assert_ne!(first.sector_number, second.sector_number);
    let info = f.pieces.get_piece_info(&piece_cid).expect("piece info");
    assert_eq!(info.deals.len(), 2);

    let broken = first.sector_number.expect("sector");
    expose_sector(f, &first);
    expose_sector(f, &second);
    f.sectors.fail_sector(broken);
    let retrieved = retrieve(f, dag.root, Some(piece_cid), 1_000_000).await;
    assert_retrieved(f, &retrieved, &dag);
}
