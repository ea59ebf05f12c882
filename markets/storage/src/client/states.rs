// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal_events;
use fil_markets_runtime::fsm::{EventTable, FsmContext, FsmDefinition};
use fil_markets_runtime::network::{open_with_backoff, STORAGE_DEAL_PROTOCOL};
use fil_markets_runtime::traversal::Selector;
use fil_markets_runtime::util::AsDealErrors;
use fil_markets_runtime::DealError;
use fvm_ipld_encoding::to_vec;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use log::{debug, info, warn};
use num_traits::Zero;

use super::ClientDealEnvironment;
use crate::messages::{Proposal, SignedResponse};
use crate::transfer::{close_channel_within, encode_voucher, ChannelId, TransferEvent, TransferEventCode};
use crate::types::{ClientDeal, DealCompletion, StorageDataTransferVoucher, StorageDealStatus};

deal_events! {
    /// Everything that moves a client storage deal forward.
    pub enum ClientEvent / ClientEventKind {
        Open,
        ReserveFundsFailed(String),
        FundingInitiated(Cid, TokenAmount),
        FundsReserved(TokenAmount),
        FundingComplete,
        WriteProposalFailed(String),
        ReadResponseFailed(String),
        ResponseVerificationFailed,
        ResponseDealDidNotMatch(Cid, Cid),
        UnexpectedDealState(StorageDealStatus, String),
        InitiateDataTransfer,
        DataTransferInitiated(ChannelId),
        DataTransferRestarted,
        DataTransferRestartFailed(String),
        DataTransferFailed(String),
        DataTransferCancelled,
        DataTransferComplete,
        WaitForDealState(bool),
        PollingFailed(String),
        DealRejected(StorageDealStatus, String),
        DealAccepted(Option<Cid>),
        DealPublishFailed(String),
        DealPublished(DealID),
        DealPrecommitFailed(String),
        DealPrecommitted(SectorNumber),
        DealActivationFailed(String),
        DealActivated,
        DealCompletionFailed(String),
        DealExpired,
        DealSlashed(ChainEpoch),
        Failed,
        Restart,
        Error(String),
    }
}

type Ctx = FsmContext<ClientDeal, ClientEvent>;
type Env = Arc<ClientDealEnvironment>;

/// States in which the client is moving the payload to the provider.
const TRANSFERRING: [StorageDealStatus; 3] = [
    StorageDealStatus::StartDataTransfer,
    StorageDealStatus::Transferring,
    StorageDealStatus::ClientTransferRestart,
];

/// Client statuses that are not final.
pub const CLIENT_ACTIVE: [StorageDealStatus; 12] = [
    StorageDealStatus::Unknown,
    StorageDealStatus::ReserveClientFunds,
    StorageDealStatus::ClientFunding,
    StorageDealStatus::FundsReserved,
    StorageDealStatus::StartDataTransfer,
    StorageDealStatus::Transferring,
    StorageDealStatus::ClientTransferRestart,
    StorageDealStatus::CheckForAcceptance,
    StorageDealStatus::ProposalAccepted,
    StorageDealStatus::AwaitingPreCommit,
    StorageDealStatus::Sealing,
    StorageDealStatus::Active,
];

/// Provider states after which the client stops polling and treats the deal as failed.
fn is_failed(state: StorageDealStatus) -> bool {
    matches!(
        state,
        StorageDealStatus::Failing | StorageDealStatus::Error | StorageDealStatus::ProposalRejected
    )
}

/// Provider states showing the deal was published.
fn is_accepted(state: StorageDealStatus) -> bool {
    matches!(
        state,
        StorageDealStatus::Staged
            | StorageDealStatus::AwaitingPreCommit
            | StorageDealStatus::Sealing
            | StorageDealStatus::Finalizing
            | StorageDealStatus::Active
            | StorageDealStatus::Expired
            | StorageDealStatus::Slashed
    )
}

/// Maps data-transfer events on a client channel to deal events.
pub(crate) fn transfer_event(event: &TransferEvent) -> Option<ClientEvent> {
    match &event.code {
        TransferEventCode::Complete => Some(ClientEvent::DataTransferComplete),
        TransferEventCode::Error(m) => Some(ClientEvent::DataTransferFailed(m.clone())),
        TransferEventCode::Cancelled => Some(ClientEvent::DataTransferCancelled),
        _ => None,
    }
}

fn record_message(deal: &mut ClientDeal, event: &ClientEvent) -> Result<(), DealError> {
    use ClientEvent::*;
    deal.message = match event {
        ReserveFundsFailed(m) => format!("adding market funds failed: {}", m),
        WriteProposalFailed(m) => format!("sending proposal to storage provider failed: {}", m),
        ReadResponseFailed(m) => format!("error reading Response message: {}", m),
        ResponseVerificationFailed => "unable to verify signature on deal response".to_string(),
        ResponseDealDidNotMatch(got, expected) => {
            format!("miner responded to a wrong proposal: {} != {}", got, expected)
        }
        UnexpectedDealState(state, m) => format!(
            "unexpected deal status while waiting for data request: {} ({}). Provider message: {}",
            *state as u64, state, m
        ),
        DataTransferFailed(m) => format!("failed to complete data transfer: {}", m),
        DataTransferRestartFailed(m) => format!("failed to restart data transfer: {}", m),
        DataTransferCancelled => "data transfer cancelled".to_string(),
        PollingFailed(m) => m.clone(),
        DealRejected(state, m) => format!("deal failed: (State={}) {}", *state as u64, m),
        DealPublishFailed(m) => format!("error validating deal published: {}", m),
        DealPrecommitFailed(m) => format!("error waiting for deal pre-commit message to appear on chain: {}", m),
        DealActivationFailed(m) => format!("error in deal activation: {}", m),
        DealCompletionFailed(m) => format!("error waiting for deal completion: {}", m),
        // Keep the reason the deal started failing.
        Error(_) if !deal.message.is_empty() && deal.state == StorageDealStatus::Failing => return Ok(()),
        Error(m) => m.clone(),
        _ => return Ok(()),
    };
    Ok(())
}

pub(crate) fn client_table() -> EventTable<ClientDeal, ClientEvent> {
    use ClientEventKind as K;
    use StorageDealStatus::*;

    EventTable::new()
        .event(K::Open)
        .from(Unknown)
        .to(ReserveClientFunds)
        .event(K::ReserveFundsFailed)
        .from_many([ReserveClientFunds, ClientFunding])
        .to(Failing)
        .action(record_message)
        .event(K::FundingInitiated)
        .from(ReserveClientFunds)
        .to(ClientFunding)
        .action(|deal, event| {
            if let ClientEvent::FundingInitiated(msg, amount) = event {
                deal.add_funds_cid = Some(*msg);
                deal.funds_reserved += amount;
            }
            Ok(())
        })
        .event(K::FundsReserved)
        .from(ReserveClientFunds)
        .to(FundsReserved)
        .action(|deal, event| {
            if let ClientEvent::FundsReserved(amount) = event {
                deal.funds_reserved += amount;
            }
            Ok(())
        })
        .event(K::FundingComplete)
        .from(ClientFunding)
        .to(FundsReserved)
        .event(K::WriteProposalFailed)
        .from(FundsReserved)
        .to(Error)
        .action(record_message)
        .event(K::ReadResponseFailed)
        .from(FundsReserved)
        .to(Failing)
        .action(record_message)
        .event(K::ResponseVerificationFailed)
        .from(FundsReserved)
        .to(Failing)
        .action(record_message)
        .event(K::ResponseDealDidNotMatch)
        .from_many([FundsReserved, CheckForAcceptance])
        .to(Failing)
        .action(record_message)
        .event(K::UnexpectedDealState)
        .from(FundsReserved)
        .to(Failing)
        .action(record_message)
        .event(K::InitiateDataTransfer)
        .from(FundsReserved)
        .to(StartDataTransfer)
        .event(K::DataTransferInitiated)
        .from(StartDataTransfer)
        .to(Transferring)
        // The transfer may finish before the channel's opening is recorded.
        .from_any()
        .to_just_record()
        .action(|deal, event| {
            if let ClientEvent::DataTransferInitiated(channel) = event {
                deal.transfer_channel_id = Some(channel.clone());
            }
            Ok(())
        })
        .event(K::DataTransferRestarted)
        .from(ClientTransferRestart)
        .to(Transferring)
        // The restarted transfer may already have completed.
        .from_any()
        .to_just_record()
        .event(K::DataTransferRestartFailed)
        .from(ClientTransferRestart)
        .to(Failing)
        .action(record_message)
        .event(K::DataTransferFailed)
        .from_many(TRANSFERRING)
        .to(Failing)
        .action(record_message)
        .event(K::DataTransferCancelled)
        .from_many(TRANSFERRING)
        .to(Failing)
        .action(record_message)
        .event(K::DataTransferComplete)
        .from_many(TRANSFERRING)
        .to(CheckForAcceptance)
        .event(K::WaitForDealState)
        .from(CheckForAcceptance)
        .to_no_change()
        .action(|deal, event| {
            if let ClientEvent::WaitForDealState(poll_error) = event {
                deal.poll_retry_count += 1;
                if *poll_error {
                    deal.poll_error_count += 1;
                }
            }
            Ok(())
        })
        .event(K::PollingFailed)
        .from(CheckForAcceptance)
        .to(Failing)
        .action(record_message)
        .event(K::DealRejected)
        .from(CheckForAcceptance)
        .to(Failing)
        .action(record_message)
        .event(K::DealAccepted)
        .from(CheckForAcceptance)
        .to(ProposalAccepted)
        .action(|deal, event| {
            if let ClientEvent::DealAccepted(publish) = event {
                deal.publish_message = *publish;
            }
            Ok(())
        })
        .event(K::DealPublishFailed)
        .from(ProposalAccepted)
        .to(Error)
        .action(record_message)
        .event(K::DealPublished)
        .from(ProposalAccepted)
        .to(AwaitingPreCommit)
        .action(|deal, event| {
            if let ClientEvent::DealPublished(id) = event {
                deal.deal_id = Some(*id);
                deal.funds_reserved = TokenAmount::zero();
            }
            Ok(())
        })
        .event(K::DealPrecommitFailed)
        .from(AwaitingPreCommit)
        .to(Error)
        .action(record_message)
        .event(K::DealPrecommitted)
        .from(AwaitingPreCommit)
        .to(Sealing)
        .action(|deal, event| {
            if let ClientEvent::DealPrecommitted(sector) = event {
                deal.sector_number = Some(*sector);
            }
            Ok(())
        })
        .event(K::DealActivationFailed)
        .from(Sealing)
        .to(Error)
        .action(record_message)
        .event(K::DealActivated)
        .from(Sealing)
        .to(Active)
        .event(K::DealCompletionFailed)
        .from(Active)
        .to(Error)
        .action(record_message)
        .event(K::DealExpired)
        .from(Active)
        .to(Expired)
        .event(K::DealSlashed)
        .from(Active)
        .to(Slashed)
        .action(|deal, event| {
            if let ClientEvent::DealSlashed(epoch) = event {
                deal.slash_epoch = *epoch;
            }
            Ok(())
        })
        .event(K::Failed)
        .from(Failing)
        .to(Error)
        .action(|deal, _| {
            deal.funds_reserved = TokenAmount::zero();
            Ok(())
        })
        .event(K::Restart)
        .from(Transferring)
        .to(ClientTransferRestart)
        .from_many(CLIENT_ACTIVE)
        .to_no_change()
        .event(K::Error)
        .from(Failing)
        .to(Error)
        .from_many(CLIENT_ACTIVE)
        .to(Failing)
        .action(record_message)
}

/// The client storage deal state machine.
pub fn client_fsm() -> FsmDefinition<ClientDeal, ClientEvent, ClientDealEnvironment> {
    use StorageDealStatus::*;

    FsmDefinition::new("storage-client", client_table())
        .on_entry(ReserveClientFunds, reserve_client_funds)
        .on_entry(ClientFunding, wait_for_funding)
        .on_entry(FundsReserved, propose_deal)
        .on_entry(StartDataTransfer, initiate_data_transfer)
        .on_entry(ClientTransferRestart, restart_data_transfer)
        .on_entry(CheckForAcceptance, check_for_deal_acceptance)
        .on_entry(ProposalAccepted, validate_deal_published)
        .on_entry(AwaitingPreCommit, verify_deal_pre_committed)
        .on_entry(Sealing, verify_deal_activated)
        .on_entry(Active, wait_for_deal_completion)
        .on_entry(Failing, fail_deal)
        .finality_states(StorageDealStatus::FINALITY)
        .on_entry_error(|e| ClientEvent::Error(e.msg().to_string()))
}

async fn reserve_client_funds(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let proposal = deal.proposal();
    let amount = proposal.client_balance_requirement();
    match env.node.reserve_funds(&proposal.client, &proposal.client, &amount).await {
        Ok(Some(msg)) => ctx.trigger(ClientEvent::FundingInitiated(msg, amount)),
        Ok(None) => ctx.trigger(ClientEvent::FundsReserved(amount)),
        Err(e) => ctx.trigger(ClientEvent::ReserveFundsFailed(e.msg().to_string())),
    }
}

async fn wait_for_funding(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let Some(msg) = deal.add_funds_cid else {
        return ctx.trigger(ClientEvent::ReserveFundsFailed("no add funds message to wait for".to_string()));
    };
    match env.node.wait_for_message(&msg).await {
        Ok(()) => ctx.trigger(ClientEvent::FundingComplete),
        Err(e) => ctx.trigger(ClientEvent::ReserveFundsFailed(format!("AddFunds: {}", e.msg()))),
    }
}

async fn propose_deal(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let mut stream = match open_with_backoff(
        env.network.as_ref(),
        &deal.miner,
        STORAGE_DEAL_PROTOCOL,
        &env.config.stream_backoff,
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => return ctx.trigger(ClientEvent::WriteProposalFailed(e.msg().to_string())),
    };
    let proposal = Proposal { deal_proposal: deal.client_deal_proposal.clone(), piece: deal.data_ref.clone() };
    if let Err(e) = stream.write(&proposal).await {
        return ctx.trigger(ClientEvent::WriteProposalFailed(e.msg().to_string()));
    }
    let read = stream.read::<SignedResponse>().await;
    if let Err(e) = stream.close().await {
        debug!("closing deal stream for {}: {}", deal.proposal_cid, e);
    }
    let signed = match read {
        Ok(signed) => signed,
        Err(e) => return ctx.trigger(ClientEvent::ReadResponseFailed(e.msg().to_string())),
    };

    let plaintext = to_vec(&signed.response).or_serialization("encoding deal response")?;
    let verified = env
        .node
        .verify_signature(&signed.signature, &deal.miner_worker, &plaintext)
        .await
        .unwrap_or(false);
    if !verified {
        return ctx.trigger(ClientEvent::ResponseVerificationFailed);
    }
    let response = signed.response;
    if response.proposal != deal.proposal_cid {
        return ctx.trigger(ClientEvent::ResponseDealDidNotMatch(response.proposal, deal.proposal_cid));
    }
    if response.state != StorageDealStatus::WaitingForData {
        return ctx.trigger(ClientEvent::UnexpectedDealState(response.state, response.message));
    }
    ctx.trigger(ClientEvent::InitiateDataTransfer)
}

async fn initiate_data_transfer(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    if deal.data_ref.is_manual() {
        info!("storage deal {}: manual data transfer, waiting for the provider to import the data", deal.proposal_cid);
        return ctx.trigger(ClientEvent::DataTransferComplete);
    }
    let voucher = encode_voucher(&StorageDataTransferVoucher { proposal: deal.proposal_cid })?;
    let opened = env
        .transfer
        .open_push_data_channel(&deal.miner, voucher, deal.data_ref.root, Selector::all(), env.blockstore.clone())
        .await;
    match opened {
        Ok(channel) => ctx.trigger(ClientEvent::DataTransferInitiated(channel)),
        Err(e) => ctx.trigger(ClientEvent::DataTransferFailed(format!("failed to open push data channel: {}", e.msg()))),
    }
}

async fn restart_data_transfer(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let Some(channel) = &deal.transfer_channel_id else {
        return ctx.trigger(ClientEvent::DataTransferRestartFailed("channel id on client deal is empty".to_string()));
    };
    match env.transfer.restart_data_channel(channel).await {
        Ok(()) => ctx.trigger(ClientEvent::DataTransferRestarted),
        Err(e) => ctx.trigger(ClientEvent::DataTransferRestartFailed(e.msg().to_string())),
    }
}

async fn check_for_deal_acceptance(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let state = match env.get_provider_deal_state(&deal).await {
        Ok(state) => state,
        Err(e) => {
            warn!("storage deal {}: error when querying provider deal state: {}", deal.proposal_cid, e);
            return wait_again(ctx, &env, &deal, true).await;
        }
    };
    if is_failed(state.state) {
        return ctx.trigger(ClientEvent::DealRejected(state.state, state.message));
    }
    if is_accepted(state.state) {
        if state.proposal_cid != deal.proposal_cid {
            return ctx.trigger(ClientEvent::ResponseDealDidNotMatch(state.proposal_cid, deal.proposal_cid));
        }
        return ctx.trigger(ClientEvent::DealAccepted(state.publish_cid));
    }
    debug!("storage deal {}: provider reports {}, polling again", deal.proposal_cid, state.state);
    wait_again(ctx, &env, &deal, false).await
}

async fn wait_again(ctx: Ctx, env: &ClientDealEnvironment, deal: &ClientDeal, poll_error: bool) -> Result<(), DealError> {
    if poll_error {
        if let Some(max) = env.config.max_status_poll_errors {
            if deal.poll_error_count + 1 > max {
                return ctx.trigger(ClientEvent::PollingFailed(format!(
                    "giving up on deal status after {} failed polls",
                    deal.poll_error_count + 1
                )));
            }
        }
    }
    tokio::time::sleep(env.config.deal_status_poll_interval).await;
    ctx.trigger(ClientEvent::WaitForDealState(poll_error))
}

async fn validate_deal_published(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let deal_id = match env.node.validate_published_deal(&deal).await {
        Ok(id) => id,
        Err(e) => return ctx.trigger(ClientEvent::DealPublishFailed(e.msg().to_string())),
    };
    release_reserved_funds(&env, &deal).await;
    ctx.trigger(ClientEvent::DealPublished(deal_id))
}

async fn verify_deal_pre_committed(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let Some(deal_id) = deal.deal_id else {
        return ctx.trigger(ClientEvent::DealPrecommitFailed("deal has no on-chain id".to_string()));
    };
    let proposal = deal.proposal();
    match env
        .node
        .on_deal_sector_pre_committed(&proposal.provider, deal_id, proposal, deal.publish_message)
        .await
    {
        Ok(sector) => ctx.trigger(ClientEvent::DealPrecommitted(sector)),
        Err(e) => ctx.trigger(ClientEvent::DealPrecommitFailed(e.msg().to_string())),
    }
}

async fn verify_deal_activated(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let (Some(deal_id), Some(sector)) = (deal.deal_id, deal.sector_number) else {
        return ctx.trigger(ClientEvent::DealActivationFailed("deal has no on-chain id or sector".to_string()));
    };
    let proposal = deal.proposal();
    match env.node.on_deal_sector_committed(&proposal.provider, deal_id, sector, proposal).await {
        Ok(()) => ctx.trigger(ClientEvent::DealActivated),
        Err(e) => ctx.trigger(ClientEvent::DealActivationFailed(e.msg().to_string())),
    }
}

async fn wait_for_deal_completion(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    let Some(deal_id) = deal.deal_id else {
        return ctx.trigger(ClientEvent::DealCompletionFailed("deal has no on-chain id".to_string()));
    };
    match env.node.on_deal_expired_or_slashed(deal_id).await {
        Ok(DealCompletion::Expired) => ctx.trigger(ClientEvent::DealExpired),
        Ok(DealCompletion::Slashed(epoch)) => ctx.trigger(ClientEvent::DealSlashed(epoch)),
        Err(e) => ctx.trigger(ClientEvent::DealCompletionFailed(e.msg().to_string())),
    }
}

async fn fail_deal(ctx: Ctx, env: Env, deal: ClientDeal) -> Result<(), DealError> {
    release_reserved_funds(&env, &deal).await;
    if let Some(channel) = &deal.transfer_channel_id {
        close_channel_within(env.transfer.as_ref(), channel, env.config.close_transfer_timeout, &deal.proposal_cid)
            .await;
    }
    warn!("storage deal {} failed: {}", deal.proposal_cid, deal.message);
    ctx.trigger(ClientEvent::Failed)
}

async fn release_reserved_funds(env: &ClientDealEnvironment, deal: &ClientDeal) {
    if deal.funds_reserved.is_zero() {
        return;
    }
    if let Err(e) = env.node.release_funds(&deal.proposal().client, &deal.funds_reserved).await {
        warn!("storage deal {}: failed to release funds: {}", deal.proposal_cid, e);
    }
}
