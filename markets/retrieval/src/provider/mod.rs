// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use fil_markets_runtime::blockstore::SharedBlockstore;
use fil_markets_runtime::config::MarketConfig;
use fil_markets_runtime::datastore::{Datastore, NamespacedDatastore};
use fil_markets_runtime::fsm::{Notification, StateGroup};
use fil_markets_runtime::network::{
    MessageStream, StreamHandler, StreamHost, StreamRegistry, RETRIEVAL_DEAL_PROTOCOL,
    RETRIEVAL_QUERY_PROTOCOL,
};
use fil_markets_runtime::piecestore::{PieceStore, PieceStoreError};
use fil_markets_runtime::statestore::StateStore;
use fil_markets_runtime::unsealing::{SectorAccessor, UnsealingLoader};
use fil_markets_runtime::util::{AsDealErrors, ReadySignal, Unsubscribe};
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::address::Address;
use log::{debug, info, warn};
use num_traits::Zero;

pub use self::states::{
    check_terms, piece_info_for_payload, provider_fsm, ProviderEvent, ProviderEventKind, PROVIDER_ACTIVE,
};
use crate::migrations::PROVIDER_MIGRATIONS;
use crate::node::RetrievalProviderNode;
use crate::stats::StatsRecorder;
use crate::types::{
    Ask, DealProposal, DealResponse, DealStatus, ProviderDealIdentifier, ProviderDealState, Query,
    QueryItemStatus, QueryResponse, QueryResponseStatus, RetrievalStats, DEAL_STATE_VERSION,
};

mod states;

const ASK_KEY: &str = "latest-ask";

/// Final say on a deal that meets the ask. Returns whether to accept, and the reason given
/// to the client on rejection.
pub type DealDecider = Arc<dyn Fn(&ProviderDealState) -> Result<(bool, String), DealError> + Send + Sync>;

/// What provider entry actions run against.
pub struct ProviderDealEnvironment {
    pub(crate) node: Arc<dyn RetrievalProviderNode>,
    pub(crate) pieces: Arc<dyn PieceStore>,
    pub(crate) loader: UnsealingLoader,
    pub(crate) config: MarketConfig,
    pub(crate) streams: StreamRegistry<ProviderDealIdentifier>,
    ask: RwLock<Ask>,
    decider: RwLock<Option<DealDecider>>,
}

impl ProviderDealEnvironment {
    pub(crate) fn ask(&self) -> Result<Ask, DealError> {
        self.ask.read().map(|a| a.clone()).map_err(|_| deal_error!(illegal_state; "ask lock poisoned"))
    }

    pub(crate) fn decider(&self) -> Result<Option<DealDecider>, DealError> {
        self.decider.read().map(|d| d.clone()).map_err(|_| deal_error!(illegal_state; "decider lock poisoned"))
    }
}

/// Serves retrieval queries and deals for one miner.
pub struct RetrievalProvider {
    miner: Address,
    env: Arc<ProviderDealEnvironment>,
    host: Arc<dyn StreamHost>,
    deals: StateGroup<ProviderDealState, ProviderEvent>,
    meta: Arc<dyn Datastore>,
    ready: ReadySignal,
    stats: StatsRecorder,
    _stats_subscription: Unsubscribe<Notification<ProviderDealState, ProviderEvent>>,
}

impl RetrievalProvider {
    /// Opens the provider's deal store under `/retrievals/provider` in `datastore`. Unsealed blocks
    /// are cached in `blockstore`. Must be called within a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        miner: Address,
        node: Arc<dyn RetrievalProviderNode>,
        host: Arc<dyn StreamHost>,
        pieces: Arc<dyn PieceStore>,
        sectors: Arc<dyn SectorAccessor>,
        datastore: Arc<dyn Datastore>,
        blockstore: SharedBlockstore,
        config: MarketConfig,
    ) -> Result<Arc<Self>, DealError> {
        let meta: Arc<dyn Datastore> = Arc::new(NamespacedDatastore::new(datastore, "/retrievals/provider"));
        let store =
            StateStore::open(blockstore.clone(), meta.clone(), "retrieval-provider", DEAL_STATE_VERSION)?;
        let env = Arc::new(ProviderDealEnvironment {
            node,
            loader: UnsealingLoader::new(blockstore, pieces.clone(), sectors),
            pieces,
            config,
            streams: StreamRegistry::new(),
            ask: RwLock::new(Ask::default()),
            decider: RwLock::new(None),
        });
        let deals = StateGroup::new(provider_fsm(), env.clone(), store)?;

        let stats = StatsRecorder::new();
        let recorder = stats.clone();
        let stats_subscription = deals.subscribe(move |(event, deal): &Notification<_, _>| {
            match (event, deal.status) {
                (ProviderEvent::Complete, DealStatus::Completed) => {
                    recorder.increment("deals_completed", 1);
                    recorder.record_average("bytes_sent", deal.total_sent);
                }
                (ProviderEvent::DealAccepted(_), _) => recorder.increment("deals_accepted", 1),
                (ProviderEvent::DealRejected(_), _) => recorder.increment("deals_rejected", 1),
                (_, DealStatus::Errored) => recorder.increment("deals_failed", 1),
                _ => {}
            }
        });

        Ok(Arc::new(Self {
            miner,
            env,
            host,
            deals,
            meta,
            ready: ReadySignal::new(),
            stats,
            _stats_subscription: stats_subscription,
        }))
    }

    /// Upgrades stored deals, loads the saved ask, restarts deals in progress and starts
    /// listening for queries and deals.
    pub async fn start(self: &Arc<Self>) -> Result<(), DealError> {
        let res = self.restart_deals().await;
        match &res {
            Ok(()) => {
                let weak = Arc::downgrade(self);
                self.host.set_stream_handler(RETRIEVAL_QUERY_PROTOCOL, Arc::new(QueryHandler(weak.clone())));
                self.host.set_stream_handler(RETRIEVAL_DEAL_PROTOCOL, Arc::new(DealHandler(weak)));
                info!("retrieval provider for {} listening as {}", self.miner, self.host.local_peer());
            }
            Err(e) => warn!("retrieval provider failed to start: {}", e),
        }
        self.ready.fire(res.clone());
        res
    }

    async fn restart_deals(&self) -> Result<(), DealError> {
        let report = self.deals.migrate(&PROVIDER_MIGRATIONS)?;
        if report.migrated > 0 {
            info!("migrated {} retrieval provider deals", report.migrated);
        }
        for (key, e) in &report.failed {
            warn!("failed to migrate retrieval provider deal {}: {}", key, e);
        }
        if let Some(bytes) = self.meta.get(ASK_KEY)? {
            let ask: Ask = from_slice(&bytes).or_serialization("decoding stored retrieval ask")?;
            self.replace_ask(ask)?;
        }
        for deal in self.deals.active()? {
            let key = deal.identifier();
            info!("restarting retrieval deal {} in state {}", key, deal.status);
            if let Err(e) = self.deals.send(key.clone(), ProviderEvent::Restart).await {
                warn!("failed to restart retrieval deal {}: {}", key, e);
            }
        }
        Ok(())
    }

    /// Stops serving new streams and shuts the deal state machines down.
    pub async fn stop(&self) -> Result<(), DealError> {
        self.host.remove_stream_handler(RETRIEVAL_QUERY_PROTOCOL);
        self.host.remove_stream_handler(RETRIEVAL_DEAL_PROTOCOL);
        self.deals.stop(self.env.config.shutdown_grace).await
    }

    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<(), DealError>) + Send + 'static,
    {
        self.ready.on_ready(f)
    }

    /// Replaces the ask and persists it.
    pub fn set_ask(&self, ask: Ask) -> Result<(), DealError> {
        let bytes = to_vec(&ask).or_serialization("encoding retrieval ask")?;
        self.meta.put(ASK_KEY, &bytes)?;
        self.replace_ask(ask)
    }

    pub fn get_ask(&self) -> Result<Ask, DealError> {
        self.env.ask()
    }

    fn replace_ask(&self, ask: Ask) -> Result<(), DealError> {
        *self.env.ask.write().map_err(|_| deal_error!(illegal_state; "ask lock poisoned"))? = ask;
        Ok(())
    }

    pub fn set_deal_decider(&self, decider: Option<DealDecider>) -> Result<(), DealError> {
        *self.env.decider.write().map_err(|_| deal_error!(illegal_state; "decider lock poisoned"))? = decider;
        Ok(())
    }

    pub async fn cancel_deal(&self, key: ProviderDealIdentifier) -> Result<(), DealError> {
        let ctx = format!("cancelling retrieval deal {}", key);
        self.deals.send(key, ProviderEvent::Cancel).await.map_err(|e| e.wrap(ctx))
    }

    pub async fn get_deal(&self, key: &ProviderDealIdentifier) -> Result<ProviderDealState, DealError> {
        self.deals.get_sync(key).await
    }

    pub fn list_deals(&self) -> Result<Vec<ProviderDealState>, DealError> {
        self.deals.list()
    }

    pub fn subscribe_to_events<F>(&self, f: F) -> Unsubscribe<Notification<ProviderDealState, ProviderEvent>>
    where
        F: Fn(&ProviderEvent, &ProviderDealState) + Send + Sync + 'static,
    {
        self.deals.subscribe(move |(event, deal): &Notification<_, _>| f(event, deal))
    }

    pub fn stats(&self) -> RetrievalStats {
        self.stats.snapshot()
    }

    /// Answers one query and closes the stream.
    pub async fn handle_query_stream(&self, mut stream: MessageStream) {
        self.stats.increment("queries", 1);
        match stream.read::<Query>().await {
            Ok(query) => {
                let response = self.answer_query(&query).await;
                debug!("query for {} from {}: {:?}", query.payload_cid, stream.remote_peer(), response.status);
                if let Err(e) = stream.write(&response).await {
                    warn!("failed to answer query from {}: {}", stream.remote_peer(), e);
                }
            }
            Err(e) => warn!("failed to read query from {}: {}", stream.remote_peer(), e),
        }
        if let Err(e) = stream.close().await {
            debug!("closing query stream: {}", e);
        }
    }

    async fn answer_query(&self, query: &Query) -> QueryResponse {
        let ask = self.get_ask().unwrap_or_default();
        let mut response = QueryResponse {
            status: QueryResponseStatus::Unavailable,
            piece_cid_found: QueryItemStatus::Unavailable,
            size: 0,
            payment_address: self.miner,
            min_price_per_byte: ask.price_per_byte,
            max_payment_interval: ask.payment_interval,
            max_payment_interval_increase: ask.payment_interval_increase,
            message: String::new(),
            unseal_price: ask.unseal_price,
        };

        match self.env.node.get_miner_worker_address(&self.miner).await {
            Ok(worker) => response.payment_address = worker,
            Err(e) => {
                response.status = QueryResponseStatus::Error;
                response.message = format!("retrieving miner worker address: {}", e.msg());
                return response;
            }
        }

        let lookup =
            piece_info_for_payload(self.env.pieces.as_ref(), &query.payload_cid, query.params.piece_cid.as_ref());
        match lookup {
            Ok(piece) => {
                response.status = QueryResponseStatus::Available;
                response.piece_cid_found = QueryItemStatus::Available;
                response.size = piece.deals.first().map(|d| d.length.unpadded().0).unwrap_or_default();
            }
            Err(PieceStoreError::NotFound) => {}
            Err(e) => {
                response.status = QueryResponseStatus::Error;
                response.piece_cid_found = QueryItemStatus::Unknown;
                response.message = e.to_string();
            }
        }
        if response.status != QueryResponseStatus::Available {
            response.min_price_per_byte = Zero::zero();
            response.unseal_price = Zero::zero();
        }
        response
    }

    /// Reads a deal proposal and hands the stream to the new deal's state machine.
    pub async fn handle_deal_stream(&self, mut stream: MessageStream) {
        let proposal = match stream.read::<DealProposal>().await {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("failed to read deal proposal from {}: {}", stream.remote_peer(), e);
                let _ = stream.close().await;
                return;
            }
        };
        let deal = ProviderDealState::new(proposal, stream.remote_peer().clone());
        let key = deal.identifier();

        if let Err(e) = self.deals.begin(deal).await {
            warn!("refusing retrieval deal {}: {}", key, e);
            let response = DealResponse::new(DealStatus::Errored, key.deal_id).with_message(e.msg());
            if let Err(e) = stream.write(&response).await {
                debug!("could not tell {} its deal was refused: {}", key, e);
            }
            let _ = stream.close().await;
            return;
        }
        if let Err(e) = self.env.streams.insert(key.clone(), stream) {
            warn!("failed to track stream of retrieval deal {}: {}", key, e);
        }
        if let Err(e) = self.deals.send(key.clone(), ProviderEvent::Open).await {
            warn!("failed to open retrieval deal {}: {}", key, e);
        }
    }
}

struct QueryHandler(Weak<RetrievalProvider>);

#[async_trait]
impl StreamHandler for QueryHandler {
    async fn handle_stream(&self, stream: MessageStream) {
        if let Some(provider) = self.0.upgrade() {
            provider.handle_query_stream(stream).await;
        }
    }
}

struct DealHandler(Weak<RetrievalProvider>);

#[async_trait]
impl StreamHandler for DealHandler {
    async fn handle_stream(&self, stream: MessageStream) {
        if let Some(provider) = self.0.upgrade() {
            provider.handle_deal_stream(stream).await;
        }
    }
}
