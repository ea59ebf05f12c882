use fil_markets_runtime::test_utils::build_dag;
use fil_storage_market::{AskBounds, StorageDealStatus};
use fvm_shared::econ::TokenAmount;

use crate::util::workflows::{assert_retrieved, expose_sector, make_storage_deal, retrieve};
use crate::util::{wait_storage_client, wait_storage_provider, MarketFixture};

/// Deals and the storage ask survive a provider restart, and an active deal still follows the
/// chain to expiry afterwards.
pub async fn provider_restart_keeps_deals_test(f: &mut MarketFixture) {
    let ask = f
        .storage_provider
        .set_ask(TokenAmount::from_atto(1_000), TokenAmount::from_atto(0), 50_000, AskBounds::default())
        .await
        .expect("set ask");
    assert_eq!(ask.ask.seq_no, 1);

    let dag = build_dag(41, 400, &[1500, 1500, 1500]).expect("payload");
    let (cid, deal) = make_storage_deal(f, &dag).await;

    f.restart_providers().await;
    assert_eq!(f.storage_provider.get_ask().expect("ask"), Some(ask));
    let deals = f.storage_provider.list_local_deals().expect("deals");
    assert_eq!(deals.len(), 1);
    assert_eq!(deals[0].state, StorageDealStatus::Active);

    expose_sector(f, &deal);
    let retrieved = retrieve(f, dag.root, None, 1_000_000).await;
    assert_retrieved(f, &retrieved, &dag);

    f.chain.expire(deal.deal_id.expect("deal id")).expect("expire");
    let provider_deal = wait_storage_provider(&f.storage_provider, &cid, StorageDealStatus::Expired).await;
    assert_eq!(provider_deal.state, StorageDealStatus::Expired, "{}", provider_deal.message);
    let client_deal = wait_storage_client(&f.storage_client, &cid, StorageDealStatus::Expired).await;
    assert_eq!(client_deal.state, StorageDealStatus::Expired, "{}", client_deal.message);
}

/// Restarting twice in a row leaves deals where they were.
pub async fn repeated_restart_is_idempotent_test(f: &mut MarketFixture) {
    let dag = build_dag(42, 300, &[1200]).expect("payload");
    let (cid, _) = make_storage_deal(f, &dag).await;
    f.restart_providers().await;
    f.restart_providers().await;
    let deal = f.storage_provider.get_local_deal(&cid).await.expect("deal");
    assert_eq!(deal.state, StorageDealStatus::Active);
    assert_eq!(f.chain.deal_ids().len(), 1);
}
