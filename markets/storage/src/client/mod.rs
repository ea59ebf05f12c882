// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, Mutex};

use cid::Cid;
use fil_markets_runtime::blockstore::SharedBlockstore;
use fil_markets_runtime::config::MarketConfig;
use fil_markets_runtime::datastore::{Datastore, NamespacedDatastore};
use fil_markets_runtime::fsm::{Notification, StateGroup};
use fil_markets_runtime::network::{
    open_with_backoff, StreamOpener, STORAGE_ASK_PROTOCOL, STORAGE_DEAL_STATUS_PROTOCOL,
};
use fil_markets_runtime::statestore::StateStore;
use fil_markets_runtime::util::{AsDealErrors, ReadySignal, Unsubscribe};
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use log::{info, warn};
use num_traits::Zero;

pub use self::states::{client_fsm, ClientEvent, ClientEventKind, CLIENT_ACTIVE};
use crate::messages::{AskRequest, AskResponse, DealStatusRequest, DealStatusResponse};
use crate::node::StorageClientNode;
use crate::piece::prepare_piece;
use crate::transfer::{forward_transfer_events, DataTransfer, TransferEvent};
use crate::types::{
    Balance, ClientDeal, DealProposal, ProposeStorageDealParams, ProviderDealState, SignedStorageAsk,
    StorageDealStatus, StorageProviderInfo, DEAL_STATE_VERSION,
};
use crate::validation::ClientRequestValidator;

mod states;

/// What client entry actions run against.
pub struct ClientDealEnvironment {
    pub(crate) node: Arc<dyn StorageClientNode>,
    pub(crate) network: Arc<dyn StreamOpener>,
    pub(crate) transfer: Arc<dyn DataTransfer>,
    /// Where payloads are sent from.
    pub(crate) blockstore: SharedBlockstore,
    pub(crate) config: MarketConfig,
}

impl ClientDealEnvironment {
    /// Asks the deal's provider where the deal stands, over a request signed by the client.
    pub(crate) async fn get_provider_deal_state(&self, deal: &ClientDeal) -> Result<ProviderDealState, DealError> {
        let signature = self
            .node
            .sign_bytes(&deal.proposal().client, &deal.proposal_cid.to_bytes())
            .await
            .map_err(|e| e.wrap("failed to sign status request"))?;
        let mut stream = open_with_backoff(
            self.network.as_ref(),
            &deal.miner,
            STORAGE_DEAL_STATUS_PROTOCOL,
            &self.config.stream_backoff,
        )
        .await?;
        let res = async {
            stream
                .write(&DealStatusRequest { proposal: deal.proposal_cid, signature })
                .await
                .map_err(|e| e.wrap("failed to send deal status request"))?;
            stream
                .read::<DealStatusResponse>()
                .await
                .map_err(|e| e.wrap("failed to read deal status response"))
        }
        .await;
        if let Err(e) = stream.close().await {
            warn!("closing deal status stream to {}: {}", deal.miner, e);
        }
        let response = res?;

        let plaintext = to_vec(&response.deal_state).or_serialization("encoding provider deal state")?;
        let valid = self.node.verify_signature(&response.signature, &deal.miner_worker, &plaintext).await?;
        if !valid {
            return Err(deal_error!(forbidden; "invalid deal status response signature"));
        }
        Ok(response.deal_state)
    }
}

/// Proposes storage deals to providers and follows them from funding to expiry.
pub struct StorageClient {
    env: Arc<ClientDealEnvironment>,
    deals: StateGroup<ClientDeal, ClientEvent>,
    ready: ReadySignal,
    transfer_subscription: Mutex<Option<Unsubscribe<TransferEvent>>>,
}

impl StorageClient {
    /// Opens the client's deal store under `/deals/client` in `datastore`. Payloads are sent
    /// from `blockstore`. Must be called within a tokio runtime.
    pub fn new(
        node: Arc<dyn StorageClientNode>,
        network: Arc<dyn StreamOpener>,
        transfer: Arc<dyn DataTransfer>,
        datastore: Arc<dyn Datastore>,
        blockstore: SharedBlockstore,
        config: MarketConfig,
    ) -> Result<Self, DealError> {
        let meta: Arc<dyn Datastore> = Arc::new(NamespacedDatastore::new(datastore, "/deals/client"));
        let store = StateStore::open(blockstore.clone(), meta, "storage-client", DEAL_STATE_VERSION)?;
        let env = Arc::new(ClientDealEnvironment { node, network, transfer, blockstore, config });
        let deals = StateGroup::new(client_fsm(), env.clone(), store)?;

        env.transfer
            .register_validator(Arc::new(ClientRequestValidator::new(Arc::new(deals.clone()), env.blockstore.clone())));
        let subscription = forward_transfer_events(env.transfer.as_ref(), deals.clone(), states::transfer_event);

        Ok(Self {
            env,
            deals,
            ready: ReadySignal::new(),
            transfer_subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Restarts every deal still in progress and fires the ready signal.
    pub async fn start(&self) -> Result<(), DealError> {
        let res = self.restart_deals().await;
        if let Err(e) = &res {
            warn!("storage client failed to start: {}", e);
        }
        self.ready.fire(res.clone());
        res
    }

    async fn restart_deals(&self) -> Result<(), DealError> {
        for deal in self.deals.active()? {
            info!("restarting storage deal {} in state {}", deal.proposal_cid, deal.state);
            if let Err(e) = self.deals.send(deal.proposal_cid, ClientEvent::Restart).await {
                warn!("failed to restart storage deal {}: {}", deal.proposal_cid, e);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DealError> {
        if let Some(subscription) = self.transfer_subscription.lock().ok().and_then(|mut s| s.take()) {
            subscription.unsubscribe();
        }
        self.deals.stop(self.env.config.shutdown_grace).await
    }

    /// Calls `f` once the client has started.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<(), DealError>) + Send + 'static,
    {
        self.ready.on_ready(f)
    }

    /// Signs a proposal for storing `params.data` with the provider and starts the deal. The
    /// piece commitment is computed from the payload unless the data reference carries one.
    pub async fn propose_storage_deal(&self, params: ProposeStorageDealParams) -> Result<Cid, DealError> {
        let (piece_cid, piece_size) = match (params.data.piece_cid, params.data.piece_size) {
            (Some(cid), Some(size)) => (cid, size),
            (Some(_), None) => {
                return Err(deal_error!(illegal_argument; "data reference has a piece CID but no piece size"))
            }
            _ => {
                let piece = prepare_piece(&self.env.blockstore, params.data.root)
                    .await
                    .map_err(|e| e.wrap("computing commP failed"))?;
                (piece.piece_cid, piece.piece_size)
            }
        };
        piece_size
            .validate()
            .map_err(|e| deal_error!(illegal_argument; "proposal piece size is invalid: {}", e))?;

        let proposal = DealProposal {
            piece_cid,
            piece_size,
            verified_deal: params.verified_deal,
            client: params.wallet,
            provider: params.provider.address,
            label: params.label,
            start_epoch: params.start_epoch,
            end_epoch: params.end_epoch,
            storage_price_per_epoch: params.price_per_epoch,
            provider_collateral: params.collateral,
            client_collateral: TokenAmount::zero(),
        };
        let signed = self
            .env
            .node
            .sign_proposal(&params.wallet, proposal)
            .await
            .map_err(|e| e.wrap("signing deal proposal failed"))?;
        let proposal_cid = signed.cid()?;
        let deal = ClientDeal::new(signed, proposal_cid, params.provider.peer_id.clone(), params.provider.worker, params.data);

        self.deals.begin(deal).await?;
        self.deals.send(proposal_cid, ClientEvent::Open).await?;
        info!("proposed storage deal {} to {}", proposal_cid, params.provider.address);
        Ok(proposal_cid)
    }

    pub async fn get_local_deal(&self, proposal_cid: &Cid) -> Result<ClientDeal, DealError> {
        self.deals.get_sync(proposal_cid).await
    }

    pub fn list_local_deals(&self) -> Result<Vec<ClientDeal>, DealError> {
        self.deals.list()
    }

    /// Queries the provider of a local deal for its side of the deal.
    pub async fn get_provider_deal_state(&self, proposal_cid: &Cid) -> Result<ProviderDealState, DealError> {
        let deal = self.deals.get(proposal_cid)?;
        self.env.get_provider_deal_state(&deal).await
    }

    /// Fetches the provider's current ask and checks it was signed by its worker.
    pub async fn get_ask(&self, info: &StorageProviderInfo) -> Result<SignedStorageAsk, DealError> {
        let mut stream = open_with_backoff(
            self.env.network.as_ref(),
            &info.peer_id,
            STORAGE_ASK_PROTOCOL,
            &self.env.config.stream_backoff,
        )
        .await
        .map_err(|e| e.wrap("failed to open stream to miner"))?;
        let res = async {
            stream
                .write(&AskRequest { miner: info.address })
                .await
                .map_err(|e| e.wrap("failed to send ask request"))?;
            stream.read::<AskResponse>().await.map_err(|e| e.wrap("failed to read ask response"))
        }
        .await;
        if let Err(e) = stream.close().await {
            warn!("closing ask stream to {}: {}", info.peer_id, e);
        }

        let ask = res?.ask.ok_or_else(|| deal_error!(not_found; "got no ask back"))?;
        if ask.ask.miner != info.address {
            return Err(deal_error!(illegal_state; "got back ask for wrong miner"));
        }
        let plaintext = to_vec(&ask.ask).or_serialization("encoding storage ask")?;
        let valid = self.env.node.verify_signature(&ask.signature, &info.worker, &plaintext).await?;
        if !valid {
            return Err(deal_error!(forbidden; "ask was not properly signed"));
        }
        Ok(ask)
    }

    /// Moves `amount` into `addr`'s market escrow and waits for the message to land.
    pub async fn add_payment_escrow(&self, addr: &Address, amount: &TokenAmount) -> Result<(), DealError> {
        let msg = self.env.node.add_funds(addr, amount).await?;
        self.env.node.wait_for_message(&msg).await
    }

    pub async fn get_payment_escrow(&self, addr: &Address) -> Result<Balance, DealError> {
        self.env.node.get_balance(addr).await
    }

    pub fn subscribe_to_events<F>(&self, f: F) -> Unsubscribe<Notification<ClientDeal, ClientEvent>>
    where
        F: Fn(&ClientEvent, &ClientDeal) + Send + Sync + 'static,
    {
        self.deals.subscribe(move |(event, deal): &Notification<_, _>| f(event, deal))
    }

    /// Resumes the payload transfer of a deal whose transfer stalled.
    pub async fn restart_data_transfer(&self, proposal_cid: &Cid) -> Result<(), DealError> {
        let deal = self.deals.get(proposal_cid)?;
        if deal.state != StorageDealStatus::Transferring {
            return Err(deal_error!(illegal_state;
                "deal {} is not transferring data (state {})", proposal_cid, deal.state));
        }
        self.deals.send(*proposal_cid, ClientEvent::Restart).await
    }
}
