// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::blockstore::SharedBlockstore;
use fil_markets_runtime::carstore::{StoreTracker, TrackedStore};
use fil_markets_runtime::config::MarketConfig;
use fil_markets_runtime::datastore::{Datastore, NamespacedDatastore};
use fil_markets_runtime::fsm::{Notification, StateGroup};
use fil_markets_runtime::network::{
    open_with_backoff, StreamOpener, StreamRegistry, RETRIEVAL_QUERY_PROTOCOL,
};
use fil_markets_runtime::statestore::StateStore;
use fil_markets_runtime::util::{AsDealErrors, ReadySignal, Unsubscribe};
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use log::{info, warn};
use num_traits::ToPrimitive;
use tokio::sync::Mutex;

pub use self::states::{client_fsm, store_key, ClientEvent, ClientEventKind, CLIENT_ACTIVE};
use crate::migrations::CLIENT_MIGRATIONS;
use crate::node::RetrievalClientNode;
use crate::stats::StatsRecorder;
use crate::types::{
    ClientDealState, DealId, DealProposal, DealStatus, Params, Query, QueryParams, QueryResponse,
    RetrievalPeer, RetrievalStats, DEAL_STATE_VERSION,
};

mod states;

const NEXT_DEAL_ID_KEY: &str = "next-deal-id";

/// What client entry actions run against.
pub struct ClientDealEnvironment {
    pub(crate) node: Arc<dyn RetrievalClientNode>,
    pub(crate) network: Arc<dyn StreamOpener>,
    pub(crate) config: MarketConfig,
    pub(crate) streams: StreamRegistry<DealId>,
    pub(crate) stores: StoreTracker,
}

/// Retrieves payload DAGs from providers, paying for them incrementally over a payment channel.
pub struct RetrievalClient {
    env: Arc<ClientDealEnvironment>,
    deals: StateGroup<ClientDealState, ClientEvent>,
    meta: Arc<dyn Datastore>,
    // Serialises duplicate checks and deal id allocation.
    retrieve_lock: Mutex<()>,
    ready: ReadySignal,
    stats: StatsRecorder,
    _stats_subscription: Unsubscribe<Notification<ClientDealState, ClientEvent>>,
}

impl RetrievalClient {
    /// Opens the client's deal store under `/retrievals/client` in `datastore`. Must be called
    /// within a tokio runtime.
    pub fn new(
        node: Arc<dyn RetrievalClientNode>,
        network: Arc<dyn StreamOpener>,
        datastore: Arc<dyn Datastore>,
        blockstore: SharedBlockstore,
        config: MarketConfig,
    ) -> Result<Self, DealError> {
        let meta: Arc<dyn Datastore> = Arc::new(NamespacedDatastore::new(datastore, "/retrievals/client"));
        let store = StateStore::open(blockstore, meta.clone(), "retrieval-client", DEAL_STATE_VERSION)?;
        let env = Arc::new(ClientDealEnvironment {
            node,
            network,
            config,
            streams: StreamRegistry::new(),
            stores: StoreTracker::new(),
        });
        let deals = StateGroup::new(client_fsm(), env.clone(), store)?;

        let stats = StatsRecorder::new();
        let recorder = stats.clone();
        let stats_subscription = deals.subscribe(move |(event, deal): &Notification<_, _>| {
            match (event, deal.status) {
                (ClientEvent::Complete(_), DealStatus::Completed) => {
                    recorder.increment("deals_completed", 1);
                    recorder.record_average("bytes_received", deal.total_received);
                    recorder.record_average("funds_spent", deal.funds_spent.atto().to_u64().unwrap_or(u64::MAX));
                }
                (_, DealStatus::Errored) => recorder.increment("deals_failed", 1),
                (_, DealStatus::Cancelled) => recorder.increment("deals_cancelled", 1),
                _ => {}
            }
        });

        Ok(Self {
            env,
            deals,
            meta,
            retrieve_lock: Mutex::new(()),
            ready: ReadySignal::new(),
            stats,
            _stats_subscription: stats_subscription,
        })
    }

    /// Upgrades stored deals, restarts every deal still in progress and fires the ready signal.
    pub async fn start(&self) -> Result<(), DealError> {
        let res = self.restart_deals().await;
        if let Err(e) = &res {
            warn!("retrieval client failed to start: {}", e);
        }
        self.ready.fire(res.clone());
        res
    }

    async fn restart_deals(&self) -> Result<(), DealError> {
        let report = self.deals.migrate(&CLIENT_MIGRATIONS)?;
        if report.migrated > 0 {
            info!("migrated {} retrieval client deals", report.migrated);
        }
        for (key, e) in &report.failed {
            warn!("failed to migrate retrieval client deal {}: {}", key, e);
        }
        for deal in self.deals.active()? {
            info!("restarting retrieval deal {} in state {}", deal.id(), deal.status);
            if let Err(e) = self.deals.send(deal.id(), ClientEvent::Restart).await {
                warn!("failed to restart retrieval deal {}: {}", deal.id(), e);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DealError> {
        self.deals.stop(self.env.config.shutdown_grace).await
    }

    /// Calls `f` once the client has started.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<(), DealError>) + Send + 'static,
    {
        self.ready.on_ready(f)
    }

    /// Asks `peer` whether it can serve `payload_cid`, and on what terms.
    pub async fn query(
        &self,
        peer: &RetrievalPeer,
        payload_cid: Cid,
        params: QueryParams,
    ) -> Result<QueryResponse, DealError> {
        let mut stream = open_with_backoff(
            self.env.network.as_ref(),
            &peer.id,
            RETRIEVAL_QUERY_PROTOCOL,
            &self.env.config.stream_backoff,
        )
        .await?;
        let res = async {
            stream.write(&Query { payload_cid, params }).await?;
            stream.read::<QueryResponse>().await
        }
        .await;
        if let Err(e) = stream.close().await {
            warn!("closing query stream to {}: {}", peer.id, e);
        }
        res
    }

    /// Starts retrieving `payload_cid` from `peer`. At most one deal per peer and payload may
    /// be active at a time.
    pub async fn retrieve(
        &self,
        payload_cid: Cid,
        mut params: Params,
        total_funds: TokenAmount,
        peer: RetrievalPeer,
        client_wallet: Address,
        miner_wallet: Address,
    ) -> Result<DealId, DealError> {
        let _guard = self.retrieve_lock.lock().await;

        if let Some(existing) = self
            .deals
            .active()?
            .into_iter()
            .find(|d| d.sender == peer.id && *d.payload_cid() == payload_cid)
        {
            return Err(deal_error!(already_exists;
                "there is an active retrieval deal with peer {} for payload CID {} (retrieval deal ID {}, state {}) - existing deal must be cancelled before starting a new retrieval deal",
                peer.id, payload_cid, existing.id(), existing.status));
        }

        if params.piece_cid.is_none() {
            params.piece_cid = peer.piece_cid;
        }
        let id = self.next_deal_id()?;
        let proposal = DealProposal { payload_cid, id, params };
        let deal = ClientDealState::new(proposal, peer.id.clone(), total_funds, client_wallet, miner_wallet);
        self.deals.begin(deal).await?;
        self.deals.send(id, ClientEvent::Open).await?;
        info!("started retrieval deal {} for {} from {}", id, payload_cid, peer.id);
        Ok(id)
    }

    /// Rechecks funds for every deal paused on `pay_ch` for lack of them.
    pub async fn try_restart_insufficient_funds(&self, pay_ch: &Address) -> Result<(), DealError> {
        let waiting = self.deals.active()?.into_iter().filter(|d| {
            d.status == DealStatus::InsufficientFunds
                && d.payment_info.as_ref().map(|p| &p.pay_ch) == Some(pay_ch)
        });
        for deal in waiting {
            self.deals.send(deal.id(), ClientEvent::RecheckFunds).await?;
        }
        Ok(())
    }

    pub async fn cancel_deal(&self, id: DealId) -> Result<(), DealError> {
        self.deals
            .send(id, ClientEvent::Cancel)
            .await
            .map_err(|e| e.wrap(format!("cancelling retrieval deal {}", id)))
    }

    pub async fn get_deal(&self, id: DealId) -> Result<ClientDealState, DealError> {
        self.deals.get_sync(&id).await
    }

    pub fn list_deals(&self) -> Result<Vec<ClientDealState>, DealError> {
        self.deals.list()
    }

    pub fn subscribe_to_events<F>(&self, f: F) -> Unsubscribe<Notification<ClientDealState, ClientEvent>>
    where
        F: Fn(&ClientEvent, &ClientDealState) + Send + Sync + 'static,
    {
        self.deals.subscribe(move |(event, deal): &Notification<_, _>| f(event, deal))
    }

    pub fn stats(&self) -> RetrievalStats {
        self.stats.snapshot()
    }

    /// The block store a deal writes received blocks into.
    pub fn deal_store(&self, id: DealId) -> Result<TrackedStore, DealError> {
        self.env.stores.get(&store_key(id))
    }

    /// Everything received for a deal, as a CAR rooted at its payload.
    pub async fn export_car(&self, id: DealId) -> Result<Vec<u8>, DealError> {
        self.env.stores.export_car(&store_key(id)).await
    }

    fn next_deal_id(&self) -> Result<DealId, DealError> {
        let next: DealId = match self.meta.get(NEXT_DEAL_ID_KEY)? {
            Some(bytes) => from_slice(&bytes).or_serialization("decoding next deal id")?,
            None => 0,
        };
        let after = to_vec(&(next + 1)).or_serialization("encoding next deal id")?;
        self.meta.put(NEXT_DEAL_ID_KEY, &after)?;
        Ok(next)
    }
}
