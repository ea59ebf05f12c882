// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::blockstore::{MemoryBlockstore, SharedBlockstore};
use fil_markets_runtime::carstore::{load_car_bytes, StoreTracker};
use fil_markets_runtime::config::MarketConfig;
use fil_markets_runtime::datastore::{Datastore, NamespacedDatastore};
use fil_markets_runtime::fsm::{Notification, StateGroup};
use fil_markets_runtime::network::{
    MessageStream, StreamHandler, StreamHost, StreamRegistry, STORAGE_ASK_PROTOCOL, STORAGE_DEAL_PROTOCOL,
    STORAGE_DEAL_STATUS_PROTOCOL,
};
use fil_markets_runtime::piecestore::PieceStore;
use fil_markets_runtime::statestore::StateStore;
use fil_markets_runtime::util::{AsDealErrors, ReadySignal, Unsubscribe};
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use log::{debug, info, warn};

pub use self::states::{provider_fsm, store_key, ProviderEvent, ProviderEventKind, PROVIDER_ACTIVE};
use crate::asks::{AskBounds, AskStore};
use crate::messages::{
    AskRequest, AskResponse, DealStatusRequest, DealStatusResponse, Proposal, Response, SignedResponse,
};
use crate::node::StorageProviderNode;
use crate::piece::prepare_piece;
use crate::transfer::{forward_transfer_events, DataTransfer, TransferEvent};
use crate::types::{
    Balance, MinerDeal, ProviderDealState, SignedStorageAsk, DEAL_STATE_VERSION,
};
use crate::validation::ProviderRequestValidator;

mod states;

/// Final say on a deal that passed validation. Returns whether to accept, and the reason given
/// to the client on rejection.
pub type DealDecider = Arc<dyn Fn(&MinerDeal) -> Result<(bool, String), DealError> + Send + Sync>;

/// What provider entry actions run against.
pub struct ProviderDealEnvironment {
    pub(crate) miner: Address,
    pub(crate) node: Arc<dyn StorageProviderNode>,
    pub(crate) pieces: Arc<dyn PieceStore>,
    pub(crate) transfer: Arc<dyn DataTransfer>,
    pub(crate) asks: AskStore,
    pub(crate) config: MarketConfig,
    pub(crate) streams: StreamRegistry<Cid>,
    pub(crate) stores: Arc<StoreTracker>,
    decider: RwLock<Option<DealDecider>>,
}

impl ProviderDealEnvironment {
    pub(crate) fn decider(&self) -> Result<Option<DealDecider>, DealError> {
        self.decider.read().map(|d| d.clone()).map_err(|_| deal_error!(illegal_state; "decider lock poisoned"))
    }

    /// Signs `value`'s encoding with the miner's worker key.
    async fn sign<T: serde::Serialize>(&self, value: &T) -> Result<Signature, DealError> {
        let worker = self.node.get_miner_worker_address(&self.miner).await?;
        let bytes = to_vec(value).or_serialization("encoding message for signing")?;
        self.node.sign_bytes(&worker, &bytes).await
    }

    /// Writes a signed response on the deal's stream and closes it. Fails with `NotFound`
    /// when the stream is gone.
    pub(crate) async fn send_response(&self, proposal: &Cid, response: Response) -> Result<(), DealError> {
        let stream = self.streams.get(proposal)?;
        let signature = self.sign(&response).await.map_err(|e| e.wrap("signing response"))?;
        let written = stream.write(&SignedResponse { response, signature }).await;
        self.streams.close(proposal, self.config.close_transfer_timeout).await;
        written
    }
}

/// Accepts storage deals for one miner and carries them from proposal to expiry.
pub struct StorageProvider {
    env: Arc<ProviderDealEnvironment>,
    host: Arc<dyn StreamHost>,
    deals: StateGroup<MinerDeal, ProviderEvent>,
    ready: ReadySignal,
    transfer_subscription: Mutex<Option<Unsubscribe<TransferEvent>>>,
}

impl StorageProvider {
    /// Opens the provider's deal store under `/deals/provider` in `datastore`. Must be called
    /// within a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        miner: Address,
        node: Arc<dyn StorageProviderNode>,
        host: Arc<dyn StreamHost>,
        transfer: Arc<dyn DataTransfer>,
        pieces: Arc<dyn PieceStore>,
        datastore: Arc<dyn Datastore>,
        blockstore: SharedBlockstore,
        config: MarketConfig,
    ) -> Result<Arc<Self>, DealError> {
        let meta: Arc<dyn Datastore> = Arc::new(NamespacedDatastore::new(datastore, "/deals/provider"));
        let store = StateStore::open(blockstore, meta.clone(), "storage-provider", DEAL_STATE_VERSION)?;
        let env = Arc::new(ProviderDealEnvironment {
            miner,
            asks: AskStore::new(miner, node.clone(), meta, config.default_storage_ask.clone()),
            node,
            pieces,
            transfer,
            config,
            streams: StreamRegistry::new(),
            stores: Arc::new(StoreTracker::new()),
            decider: RwLock::new(None),
        });
        let deals = StateGroup::new(provider_fsm(), env.clone(), store)?;

        Ok(Arc::new(Self {
            env,
            host,
            deals,
            ready: ReadySignal::new(),
            transfer_subscription: Mutex::new(None),
        }))
    }

    /// Loads the saved ask, or sets the default one, restarts deals in progress and starts
    /// listening for deals, ask requests and status requests.
    pub async fn start(self: &Arc<Self>) -> Result<(), DealError> {
        let res = self.restart_deals().await;
        match &res {
            Ok(()) => {
                let weak = Arc::downgrade(self);
                self.host.set_stream_handler(STORAGE_DEAL_PROTOCOL, Arc::new(DealHandler(weak.clone())));
                self.host.set_stream_handler(STORAGE_ASK_PROTOCOL, Arc::new(AskHandler(weak.clone())));
                self.host.set_stream_handler(STORAGE_DEAL_STATUS_PROTOCOL, Arc::new(StatusHandler(weak)));
                info!("storage provider for {} listening as {}", self.env.miner, self.host.local_peer());
            }
            Err(e) => warn!("storage provider failed to start: {}", e),
        }
        self.ready.fire(res.clone());
        res
    }

    async fn restart_deals(&self) -> Result<(), DealError> {
        if !self.env.asks.load()? {
            self.env.asks.set_default().await?;
        }

        self.env.transfer.register_validator(Arc::new(ProviderRequestValidator::new(
            Arc::new(self.deals.clone()),
            self.env.stores.clone(),
        )));
        let subscription =
            forward_transfer_events(self.env.transfer.as_ref(), self.deals.clone(), states::transfer_event);
        if let Some(old) = self
            .transfer_subscription
            .lock()
            .map_err(|_| deal_error!(illegal_state; "subscription lock poisoned"))?
            .replace(subscription)
        {
            old.unsubscribe();
        }

        for deal in self.deals.active()? {
            info!("restarting storage deal {} in state {}", deal.proposal_cid, deal.state);
            if let Err(e) = self.deals.send(deal.proposal_cid, ProviderEvent::Restart).await {
                warn!("failed to restart storage deal {}: {}", deal.proposal_cid, e);
            }
        }
        Ok(())
    }

    /// Stops serving new streams and shuts the deal state machines down.
    pub async fn stop(&self) -> Result<(), DealError> {
        self.host.remove_stream_handler(STORAGE_DEAL_PROTOCOL);
        self.host.remove_stream_handler(STORAGE_ASK_PROTOCOL);
        self.host.remove_stream_handler(STORAGE_DEAL_STATUS_PROTOCOL);
        if let Some(subscription) = self.transfer_subscription.lock().ok().and_then(|mut s| s.take()) {
            subscription.unsubscribe();
        }
        self.deals.stop(self.env.config.shutdown_grace).await
    }

    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<(), DealError>) + Send + 'static,
    {
        self.ready.on_ready(f)
    }

    /// Publishes a new ask at `price` per GiB per epoch, valid for `duration` epochs.
    pub async fn set_ask(
        &self,
        price: TokenAmount,
        verified_price: TokenAmount,
        duration: ChainEpoch,
        bounds: AskBounds,
    ) -> Result<SignedStorageAsk, DealError> {
        self.env.asks.set_price(price, verified_price, duration, bounds).await
    }

    pub fn get_ask(&self) -> Result<Option<SignedStorageAsk>, DealError> {
        self.env.asks.get_ask()
    }

    pub fn set_deal_decider(&self, decider: Option<DealDecider>) -> Result<(), DealError> {
        *self.env.decider.write().map_err(|_| deal_error!(illegal_state; "decider lock poisoned"))? = decider;
        Ok(())
    }

    /// Supplies the payload of a manual-transfer deal as a CAR. Data whose piece commitment
    /// differs from the proposal's is refused and the deal left waiting.
    pub async fn import_data_for_deal(&self, proposal_cid: &Cid, car: &[u8]) -> Result<(), DealError> {
        let deal = self
            .deals
            .get(proposal_cid)
            .map_err(|e| e.wrap("failed getting deal"))?;

        let staging = MemoryBlockstore::shared();
        load_car_bytes(&staging, car).await?;
        let piece = prepare_piece(&staging, deal.data_ref.root)
            .await
            .map_err(|e| e.wrap("failed to generate commP"))?;
        let expected = deal.proposal().piece_cid;
        if piece.piece_cid != expected {
            return Err(deal_error!(illegal_argument;
                "given data does not match expected commP (got: {}, expected {})", piece.piece_cid, expected));
        }

        let tracked = self.env.stores.get_or_create(&store_key(proposal_cid), deal.data_ref.root)?;
        for (cid, data) in &piece.blocks {
            tracked.store.put_keyed(cid, data).or_illegal_state("importing deal data")?;
        }
        info!("imported {} bytes of data for storage deal {}", car.len(), proposal_cid);
        self.deals.send(*proposal_cid, ProviderEvent::VerifiedData).await
    }

    pub async fn get_local_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, DealError> {
        self.deals.get_sync(proposal_cid).await
    }

    pub fn list_local_deals(&self) -> Result<Vec<MinerDeal>, DealError> {
        self.deals.list()
    }

    /// Moves `amount` into the miner's market escrow and waits for the message to land.
    pub async fn add_storage_collateral(&self, amount: &TokenAmount) -> Result<(), DealError> {
        let msg = self.env.node.add_funds(&self.env.miner, amount).await?;
        self.env.node.wait_for_message(&msg).await
    }

    pub async fn get_storage_collateral(&self) -> Result<Balance, DealError> {
        self.env.node.get_balance(&self.env.miner).await
    }

    pub fn subscribe_to_events<F>(&self, f: F) -> Unsubscribe<Notification<MinerDeal, ProviderEvent>>
    where
        F: Fn(&ProviderEvent, &MinerDeal) + Send + Sync + 'static,
    {
        self.deals.subscribe(move |(event, deal): &Notification<_, _>| f(event, deal))
    }

    /// Reads a deal proposal and hands the stream to the new deal's state machine. A proposal
    /// seen before gets the deal's current state back.
    pub async fn handle_deal_stream(&self, mut stream: MessageStream) {
        let proposal = match stream.read::<Proposal>().await {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("failed to read deal proposal from {}: {}", stream.remote_peer(), e);
                let _ = stream.close().await;
                return;
            }
        };
        let proposal_cid = match proposal.deal_proposal.cid() {
            Ok(cid) => cid,
            Err(e) => {
                warn!("failed to compute proposal CID from {}: {}", stream.remote_peer(), e);
                let _ = stream.close().await;
                return;
            }
        };

        if let Ok(existing) = self.deals.get(&proposal_cid) {
            debug!("resending response for storage deal {} in state {}", proposal_cid, existing.state);
            self.resend_response(stream, &existing).await;
            return;
        }

        let deal = MinerDeal::new(proposal.deal_proposal, proposal_cid, stream.remote_peer().clone(), proposal.piece);
        if let Err(e) = self.env.streams.insert(proposal_cid, stream) {
            warn!("failed to track stream of storage deal {}: {}", proposal_cid, e);
            return;
        }
        if let Err(e) = self.deals.begin(deal).await {
            warn!("refusing storage deal {}: {}", proposal_cid, e);
            self.env.streams.close(&proposal_cid, self.env.config.close_transfer_timeout).await;
            return;
        }
        if let Err(e) = self.deals.send(proposal_cid, ProviderEvent::Open).await {
            warn!("failed to open storage deal {}: {}", proposal_cid, e);
        }
    }

    async fn resend_response(&self, mut stream: MessageStream, deal: &MinerDeal) {
        let response = Response {
            state: deal.state,
            message: deal.message.clone(),
            proposal: deal.proposal_cid,
            publish_message: deal.publish_cid,
        };
        match self.env.sign(&response).await {
            Ok(signature) => {
                if let Err(e) = stream.write(&SignedResponse { response, signature }).await {
                    debug!("could not resend response for storage deal {}: {}", deal.proposal_cid, e);
                }
            }
            Err(e) => warn!("signing response for storage deal {}: {}", deal.proposal_cid, e),
        }
        let _ = stream.close().await;
    }

    /// Answers one ask request and closes the stream.
    pub async fn handle_ask_stream(&self, mut stream: MessageStream) {
        match stream.read::<AskRequest>().await {
            Ok(request) => {
                let ask = if request.miner == self.env.miner {
                    self.get_ask().unwrap_or_else(|e| {
                        warn!("reading storage ask: {}", e);
                        None
                    })
                } else {
                    debug!("ask request for miner {} sent to {}", request.miner, self.env.miner);
                    None
                };
                if let Err(e) = stream.write(&AskResponse { ask }).await {
                    warn!("failed to answer ask request from {}: {}", stream.remote_peer(), e);
                }
            }
            Err(e) => warn!("failed to read ask request from {}: {}", stream.remote_peer(), e),
        }
        if let Err(e) = stream.close().await {
            debug!("closing ask stream: {}", e);
        }
    }

    /// Answers one deal status request with the signed provider view of the deal.
    pub async fn handle_deal_status_stream(&self, mut stream: MessageStream) {
        let request = match stream.read::<DealStatusRequest>().await {
            Ok(request) => request,
            Err(e) => {
                warn!("failed to read deal status request from {}: {}", stream.remote_peer(), e);
                let _ = stream.close().await;
                return;
            }
        };
        let deal_state = match self.deal_status(&request).await {
            Ok(state) => state,
            Err(e) => {
                debug!("deal status request for {}: {}", request.proposal, e);
                ProviderDealState { message: e.msg().to_string(), ..ProviderDealState::not_found(request.proposal) }
            }
        };
        match self.env.sign(&deal_state).await {
            Ok(signature) => {
                if let Err(e) = stream.write(&DealStatusResponse { deal_state, signature }).await {
                    warn!("failed to answer deal status request from {}: {}", stream.remote_peer(), e);
                }
            }
            Err(e) => warn!("signing deal status response: {}", e),
        }
        if let Err(e) = stream.close().await {
            debug!("closing deal status stream: {}", e);
        }
    }

    async fn deal_status(&self, request: &DealStatusRequest) -> Result<ProviderDealState, DealError> {
        let deal = self
            .deals
            .get(&request.proposal)
            .map_err(|_| deal_error!(not_found; "no such proposal"))?;
        let valid = self
            .env
            .node
            .verify_signature(&request.signature, &deal.proposal().client, &request.proposal.to_bytes())
            .await?;
        if !valid {
            return Err(deal_error!(forbidden; "invalid deal status request signature"));
        }
        Ok(deal.provider_state())
    }
}

struct DealHandler(Weak<StorageProvider>);

#[async_trait]
impl StreamHandler for DealHandler {
    async fn handle_stream(&self, stream: MessageStream) {
        if let Some(provider) = self.0.upgrade() {
            provider.handle_deal_stream(stream).await;
        }
    }
}

struct AskHandler(Weak<StorageProvider>);

#[async_trait]
impl StreamHandler for AskHandler {
    async fn handle_stream(&self, stream: MessageStream) {
        if let Some(provider) = self.0.upgrade() {
            provider.handle_ask_stream(stream).await;
        }
    }
}

struct StatusHandler(Weak<StorageProvider>);

#[async_trait]
impl StreamHandler for StatusHandler {
    async fn handle_stream(&self, stream: MessageStream) {
        if let Some(provider) = self.0.upgrade() {
            provider.handle_deal_status_stream(stream).await;
        }
    }
}
