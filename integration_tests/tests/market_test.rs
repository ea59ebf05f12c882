use fil_markets_integration_tests::tests::*;
use fil_markets_integration_tests::util::MarketFixture;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_then_retrieve() {
    store_then_retrieve_test(&MarketFixture::new().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_unknown_payload() {
    query_unknown_payload_test(&MarketFixture::new().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_payload_two_deals() {
    same_payload_two_deals_test(&MarketFixture::new().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_restart_keeps_deals() {
    provider_restart_keeps_deals_test(&mut MarketFixture::new().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_restart_is_idempotent() {
    repeated_restart_is_idempotent_test(&mut MarketFixture::new().await).await;
}
