// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_markets_runtime::blockstore::MemoryBlockstore;
use fil_markets_runtime::carstore::{load_car_bytes, StoreTracker};
use fil_markets_runtime::commp::generate_piece_commitment;
use fil_markets_runtime::datastore::MemoryDatastore;
use fil_markets_runtime::statestore::StateStore;
use fil_markets_runtime::test_utils::build_dag;
use fil_markets_runtime::traversal::{traverse_blockstore, Selector};
use fil_markets_runtime::ErrorKind;
use fvm_ipld_blockstore::Blockstore;

#[tokio::test]
async fn tracked_store_exports_whole_dag() {
    let dag = build_dag(5, 300, &[700, 900, 1100]).unwrap();
    let tracker = StoreTracker::new();
    let tracked = tracker.get_or_create("deal-1", dag.root).unwrap();
    dag.put_into(&tracked.store).unwrap();

    let car = tracker.export_car("deal-1").await.unwrap();
    let reloaded = MemoryBlockstore::shared();
    assert_eq!(load_car_bytes(&reloaded, &car).await.unwrap(), vec![dag.root]);
    assert_eq!(traverse_blockstore(&reloaded, dag.root, Selector::all()).unwrap(), dag.blocks);

    // Export is deterministic, so the commitment is too.
    let again = tracker.export_car("deal-1").await.unwrap();
    assert_eq!(generate_piece_commitment(&car).unwrap(), generate_piece_commitment(&again).unwrap());

    tracker.clean("deal-1").unwrap();
    assert_eq!(tracker.get("deal-1").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(!tracked.store.has(&dag.root).unwrap());
}

#[test]
fn state_store_survives_reopen() {
    let bs = MemoryBlockstore::shared();
    let ds = MemoryDatastore::shared();

    let store: StateStore<_, u64, String> = StateStore::open(bs.clone(), ds.clone(), "notes", 1).unwrap();
    store.begin(&1, &"first".to_string()).unwrap();
    store.begin(&2, &"second".to_string()).unwrap();
    store.mutate(&2, |v: &mut String| {
        v.push_str(" edited");
        Ok(())
    })
    .unwrap();
    assert_eq!(store.begin(&1, &"again".to_string()).unwrap_err().kind(), ErrorKind::AlreadyExists);

    let reopened: StateStore<_, u64, String> = StateStore::open(bs, ds, "notes", 1).unwrap();
    let mut all = reopened.list().unwrap();
    all.sort();
    assert_eq!(all, vec![(1, "first".to_string()), (2, "second edited".to_string())]);
    assert_eq!(reopened.end(&1).unwrap(), Some("first".to_string()));
    assert!(!reopened.has(&1).unwrap());
}
