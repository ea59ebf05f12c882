// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal_events;
use fil_markets_runtime::fsm::{EventTable, FsmContext, FsmDefinition};
use fil_markets_runtime::piecestore::DealInfo;
use fil_markets_runtime::{deal_error, DealError, ErrorKind};
use fvm_ipld_encoding::to_vec;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use log::{debug, info, warn};
use num_traits::Zero;

use super::ProviderDealEnvironment;
use crate::messages::Response;
use crate::piece::prepare_piece;
use crate::transfer::{close_channel_within, ChannelId, TransferEvent, TransferEventCode};
use crate::types::{DealCompletion, MinerDeal, PackingResult, StorageDealStatus};

deal_events! {
    /// Everything that moves a provider storage deal forward.
    pub enum ProviderEvent / ProviderEventKind {
        Open,
        NodeErrored(String),
        DealRejected(String),
        RejectionSent,
        DealDeciding,
        DataRequested,
        ResponseSent,
        SendResponseFailed(String),
        DataTransferInitiated(ChannelId),
        DataTransferRestarted(ChannelId),
        DataTransferFailed(String),
        DataTransferCancelled,
        DataTransferCompleted,
        AwaitTransferRestartTimeout,
        DataVerificationFailed(String),
        VerifiedData,
        FundingInitiated(Cid, TokenAmount),
        FundsReserved(TokenAmount),
        Funded,
        TrackFundsFailed(String),
        DealPublishInitiated(Cid),
        DealPublishError(String),
        DealPublished(DealID),
        DealHandoffFailed(String),
        DealHandedOff(PackingResult),
        DealPrecommitFailed(String),
        DealPrecommitted(SectorNumber),
        DealActivationFailed(String),
        DealActivated,
        PieceStoreErrored(String),
        CleanupFinished,
        DealCompletionFailed(String),
        DealExpired,
        DealSlashed(ChainEpoch),
        Failed,
        Restart,
        Error(String),
    }
}

type Ctx = FsmContext<MinerDeal, ProviderEvent>;
type Env = Arc<ProviderDealEnvironment>;

/// States in which the provider is receiving the payload.
const TRANSFERRING: [StorageDealStatus; 2] =
    [StorageDealStatus::Transferring, StorageDealStatus::ProviderTransferAwaitRestart];

/// States that need the client's deal stream, which does not survive a restart.
const NEEDS_STREAM: [StorageDealStatus; 3] =
    [StorageDealStatus::Validating, StorageDealStatus::AcceptWait, StorageDealStatus::Rejecting];

/// Provider statuses that are not final.
pub const PROVIDER_ACTIVE: [StorageDealStatus; 18] = [
    StorageDealStatus::Unknown,
    StorageDealStatus::Validating,
    StorageDealStatus::AcceptWait,
    StorageDealStatus::Rejecting,
    StorageDealStatus::WaitingForData,
    StorageDealStatus::Transferring,
    StorageDealStatus::ProviderTransferAwaitRestart,
    StorageDealStatus::VerifyData,
    StorageDealStatus::ReserveProviderFunds,
    StorageDealStatus::ProviderFunding,
    StorageDealStatus::Publish,
    StorageDealStatus::Publishing,
    StorageDealStatus::Staged,
    StorageDealStatus::AwaitingPreCommit,
    StorageDealStatus::Sealing,
    StorageDealStatus::Finalizing,
    StorageDealStatus::Active,
    StorageDealStatus::Failing,
];

/// Key of the block store a deal's payload is received into.
pub fn store_key(proposal: &Cid) -> String {
    proposal.to_string()
}

/// Maps data-transfer events on a provider channel to deal events.
pub(crate) fn transfer_event(event: &TransferEvent) -> Option<ProviderEvent> {
    match &event.code {
        TransferEventCode::Open => Some(ProviderEvent::DataTransferInitiated(event.channel.clone())),
        TransferEventCode::Restart => Some(ProviderEvent::DataTransferRestarted(event.channel.clone())),
        TransferEventCode::Complete => Some(ProviderEvent::DataTransferCompleted),
        TransferEventCode::Error(m) => Some(ProviderEvent::DataTransferFailed(m.clone())),
        TransferEventCode::Cancelled => Some(ProviderEvent::DataTransferCancelled),
        TransferEventCode::Progress(_) => None,
    }
}

fn record_message(deal: &mut MinerDeal, event: &ProviderEvent) -> Result<(), DealError> {
    use ProviderEvent::*;
    deal.message = match event {
        NodeErrored(m) => format!("error calling node: {}", m),
        DealRejected(m) => format!("deal rejected: {}", m),
        SendResponseFailed(m) => format!("sending response to deal: {}", m),
        DataTransferFailed(m) => format!("error transferring data: {}", m),
        DataTransferCancelled => "data transfer cancelled".to_string(),
        AwaitTransferRestartTimeout if deal.state == StorageDealStatus::ProviderTransferAwaitRestart => {
            "timed out waiting for client to restart transfer".to_string()
        }
        DataVerificationFailed(m) => format!("deal data verification failed: {}", m),
        TrackFundsFailed(m) => format!("error tracking deal funds: {}", m),
        DealPublishError(m) => format!("PublishStorageDeal error: {}", m),
        DealHandoffFailed(m) => format!("handing off deal to node: {}", m),
        DealPrecommitFailed(m) => format!("error awaiting deal pre-commit: {}", m),
        DealActivationFailed(m) => format!("error activating deal: {}", m),
        PieceStoreErrored(m) => format!("accessing piece store: {}", m),
        DealCompletionFailed(m) => format!("error waiting for deal completion: {}", m),
        Restart if NEEDS_STREAM.contains(&deal.state) => {
            format!("provider restarted while deal was {}", deal.state)
        }
        // Keep the reason the deal started failing.
        Error(_) if !deal.message.is_empty() && deal.state == StorageDealStatus::Failing => return Ok(()),
        Error(m) => m.clone(),
        _ => return Ok(()),
    };
    Ok(())
}

fn record_channel(deal: &mut MinerDeal, event: &ProviderEvent) -> Result<(), DealError> {
    if let ProviderEvent::DataTransferInitiated(channel) | ProviderEvent::DataTransferRestarted(channel) = event {
        deal.transfer_channel_id = Some(channel.clone());
    }
    Ok(())
}

pub(crate) fn provider_table() -> EventTable<MinerDeal, ProviderEvent> {
    use ProviderEventKind as K;
    use StorageDealStatus::*;

    EventTable::new()
        .event(K::Open)
        .from(Unknown)
        .to(Validating)
        .event(K::NodeErrored)
        .from_many(PROVIDER_ACTIVE)
        .to(Failing)
        .action(record_message)
        .event(K::DealRejected)
        .from_many([Validating, AcceptWait])
        .to(Rejecting)
        .action(record_message)
        .event(K::RejectionSent)
        .from(Rejecting)
        .to(Failing)
        .event(K::DealDeciding)
        .from(Validating)
        .to(AcceptWait)
        .event(K::DataRequested)
        .from(AcceptWait)
        .to(WaitingForData)
        .event(K::ResponseSent)
        .from_any()
        .to_just_record()
        .event(K::SendResponseFailed)
        .from_many([WaitingForData, Rejecting])
        .to(Failing)
        .action(record_message)
        .event(K::DataTransferInitiated)
        .from_many([WaitingForData, ProviderTransferAwaitRestart])
        .to(Transferring)
        .from(Transferring)
        .to_just_record()
        .action(record_channel)
        .event(K::DataTransferRestarted)
        .from_many(TRANSFERRING)
        .to(Transferring)
        .action(record_channel)
        .event(K::DataTransferFailed)
        .from_many([WaitingForData, Transferring, ProviderTransferAwaitRestart])
        .to(Failing)
        .action(record_message)
        .event(K::DataTransferCancelled)
        .from_many([WaitingForData, Transferring, ProviderTransferAwaitRestart])
        .to(Failing)
        .action(record_message)
        .event(K::DataTransferCompleted)
        .from_many([WaitingForData, Transferring, ProviderTransferAwaitRestart])
        .to(VerifyData)
        .event(K::AwaitTransferRestartTimeout)
        .from(ProviderTransferAwaitRestart)
        .to(Failing)
        // The client restarted the transfer in time.
        .from_any()
        .to_just_record()
        .action(record_message)
        .event(K::DataVerificationFailed)
        .from(VerifyData)
        .to(Failing)
        .action(record_message)
        .event(K::VerifiedData)
        .from_many([VerifyData, WaitingForData])
        .to(ReserveProviderFunds)
        .event(K::FundingInitiated)
        .from(ReserveProviderFunds)
        .to(ProviderFunding)
        .action(|deal, event| {
            if let ProviderEvent::FundingInitiated(msg, amount) = event {
                deal.add_funds_cid = Some(*msg);
                deal.funds_reserved += amount;
            }
            Ok(())
        })
        .event(K::FundsReserved)
        .from(ReserveProviderFunds)
        .to(Publish)
        .action(|deal, event| {
            if let ProviderEvent::FundsReserved(amount) = event {
                deal.funds_reserved += amount;
            }
            Ok(())
        })
        .event(K::Funded)
        .from(ProviderFunding)
        .to(Publish)
        .event(K::TrackFundsFailed)
        .from_many([ReserveProviderFunds, ProviderFunding])
        .to(Failing)
        .action(record_message)
        .event(K::DealPublishInitiated)
        .from(Publish)
        .to(Publishing)
        .action(|deal, event| {
            if let ProviderEvent::DealPublishInitiated(msg) = event {
                deal.publish_cid = Some(*msg);
            }
            Ok(())
        })
        .event(K::DealPublishError)
        .from_many([Publish, Publishing])
        .to(Failing)
        .action(record_message)
        .event(K::DealPublished)
        .from(Publishing)
        .to(Staged)
        .action(|deal, event| {
            if let ProviderEvent::DealPublished(id) = event {
                deal.deal_id = Some(*id);
                deal.funds_reserved = TokenAmount::zero();
            }
            Ok(())
        })
        .event(K::DealHandoffFailed)
        .from(Staged)
        .to(Failing)
        .action(record_message)
        .event(K::DealHandedOff)
        .from(Staged)
        .to(AwaitingPreCommit)
        .action(|deal, event| {
            if let ProviderEvent::DealHandedOff(packing) = event {
                deal.sector_number = Some(packing.sector_number);
                deal.offset = Some(packing.offset);
            }
            Ok(())
        })
        .event(K::DealPrecommitFailed)
        .from(AwaitingPreCommit)
        .to(Failing)
        .action(record_message)
        .event(K::DealPrecommitted)
        .from(AwaitingPreCommit)
        .to(Sealing)
        .action(|deal, event| {
            if let ProviderEvent::DealPrecommitted(sector) = event {
                deal.sector_number = Some(*sector);
            }
            Ok(())
        })
        .event(K::DealActivationFailed)
        .from(Sealing)
        .to(Failing)
        .action(record_message)
        .event(K::DealActivated)
        .from(Sealing)
        .to(Finalizing)
        .event(K::PieceStoreErrored)
        .from(Finalizing)
        .to(Failing)
        .action(record_message)
        .event(K::CleanupFinished)
        .from(Finalizing)
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
        .event(K::Failed)
        .from(Failing)
        .to(Error)
        .action(|deal, _| {
            deal.funds_reserved = TokenAmount::zero();
            Ok(())
        })
        .event(K::Restart)
        .from_many(NEEDS_STREAM)
        .to(Error)
        .from(Transferring)
        .to(ProviderTransferAwaitRestart)
        .from_many(PROVIDER_ACTIVE)
        .to_no_change()
        .action(record_message)
        .event(K::Error)
        .from(Failing)
        .to(Error)
        .from_many(PROVIDER_ACTIVE)
        .to(Failing)
        .action(record_message)
}

/// The provider storage deal state machine.
pub fn provider_fsm() -> FsmDefinition<MinerDeal, ProviderEvent, ProviderDealEnvironment> {
    use StorageDealStatus::*;

    FsmDefinition::new("storage-provider", provider_table())
        .on_entry(Validating, validate_deal_proposal)
        .on_entry(AcceptWait, decide_on_proposal)
        .on_entry(Rejecting, reject_deal)
        .on_entry(WaitingForData, send_data_request)
        .on_entry(ProviderTransferAwaitRestart, wait_for_transfer_restart)
        .on_entry(VerifyData, verify_data)
        .on_entry(ReserveProviderFunds, reserve_provider_funds)
        .on_entry(ProviderFunding, wait_for_funding)
        .on_entry(Publish, publish_deal)
        .on_entry(Publishing, wait_for_publish)
        .on_entry(Staged, hand_off_deal)
        .on_entry(AwaitingPreCommit, verify_deal_pre_committed)
        .on_entry(Sealing, verify_deal_activated)
        .on_entry(Finalizing, record_piece_info)
        .on_entry(Active, wait_for_deal_completion)
        .on_entry(Failing, fail_deal)
        .finality_states(StorageDealStatus::FINALITY)
        .on_entry_error(|e| ProviderEvent::Error(e.msg().to_string()))
}

async fn validate_deal_proposal(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    match check_proposal(&env, &deal).await {
        Ok(()) => ctx.trigger(ProviderEvent::DealDeciding),
        Err(reason) => ctx.trigger(ProviderEvent::DealRejected(reason)),
    }
}

/// Checks a proposal against the chain, the ask and the client's escrow. Returns the reason
/// for rejecting it.
async fn check_proposal(env: &ProviderDealEnvironment, deal: &MinerDeal) -> Result<(), String> {
    let proposal = deal.proposal();
    let head = env
        .node
        .get_chain_head()
        .await
        .map_err(|e| format!("node error getting most recent state id: {}", e.msg()))?;

    let plaintext = to_vec(proposal).map_err(|e| e.to_string())?;
    let verified = env
        .node
        .verify_signature(&deal.client_deal_proposal.client_signature, &proposal.client, &plaintext)
        .await
        .unwrap_or(false);
    if !verified {
        return Err("could not verify signature".to_string());
    }
    if proposal.provider != env.miner {
        return Err("incorrect provider for deal".to_string());
    }
    proposal.piece_size.validate().map_err(|e| format!("proposal piece size is invalid: {}", e))?;
    if proposal.end_epoch <= proposal.start_epoch {
        return Err("proposal end before proposal start".to_string());
    }
    if head > proposal.start_epoch {
        return Err("deal start epoch is too soon or deal already expired".to_string());
    }

    let ask = env
        .asks
        .get_ask()
        .map_err(|e| e.msg().to_string())?
        .ok_or_else(|| "no storage ask has been set".to_string())?
        .ask;
    let min_price = ask.min_price_per_epoch(proposal.piece_size, proposal.verified_deal);
    if proposal.storage_price_per_epoch < min_price {
        return Err(format!(
            "storage price per epoch less than asking price: {} < {}",
            proposal.storage_price_per_epoch.atto(),
            min_price.atto()
        ));
    }
    if proposal.piece_size.0 < ask.min_piece_size.0 {
        return Err(format!(
            "piece size less than minimum required size: {} < {}",
            proposal.piece_size.0, ask.min_piece_size.0
        ));
    }
    if proposal.piece_size.0 > ask.max_piece_size.0 {
        return Err(format!(
            "piece size more than maximum allowed size: {} > {}",
            proposal.piece_size.0, ask.max_piece_size.0
        ));
    }

    let balance = env
        .node
        .get_balance(&proposal.client)
        .await
        .map_err(|e| format!("node error getting client market balance failed: {}", e.msg()))?;
    let required = proposal.client_balance_requirement();
    if balance.available < required {
        return Err(format!(
            "clientMarketBalance.Available too small: {} < {}",
            balance.available.atto(),
            required.atto()
        ));
    }
    Ok(())
}

async fn decide_on_proposal(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let Some(decider) = env.decider()? else {
        return ctx.trigger(ProviderEvent::DataRequested);
    };
    match decider(&deal) {
        Ok((true, _)) => ctx.trigger(ProviderEvent::DataRequested),
        Ok((false, reason)) => ctx.trigger(ProviderEvent::DealRejected(reason)),
        Err(e) => ctx.trigger(ProviderEvent::DealRejected(format!("custom deal decision logic failed: {}", e.msg()))),
    }
}

async fn reject_deal(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let response = Response {
        state: StorageDealStatus::Failing,
        message: deal.message.clone(),
        proposal: deal.proposal_cid,
        publish_message: None,
    };
    match env.send_response(&deal.proposal_cid, response).await {
        Ok(()) => ctx.trigger(ProviderEvent::RejectionSent),
        Err(e) => ctx.trigger(ProviderEvent::SendResponseFailed(e.msg().to_string())),
    }
}

/// Tells the client its proposal was accepted and the provider awaits the payload. The state
/// is already persisted, so a transfer opened in response finds the deal ready for it.
async fn send_data_request(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let response = Response {
        state: StorageDealStatus::WaitingForData,
        message: String::new(),
        proposal: deal.proposal_cid,
        publish_message: None,
    };
    match env.send_response(&deal.proposal_cid, response).await {
        Ok(()) => ctx.trigger(ProviderEvent::ResponseSent),
        // Re-entered after a restart: the client already has its answer.
        Err(e) if e.kind() == ErrorKind::NotFound => ctx.trigger(ProviderEvent::ResponseSent),
        Err(e) => ctx.trigger(ProviderEvent::SendResponseFailed(e.msg().to_string())),
    }
}

async fn wait_for_transfer_restart(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    debug!("storage deal {}: waiting for the client to restart its transfer", deal.proposal_cid);
    tokio::time::sleep(env.config.transfer_restart_timeout).await;
    ctx.trigger(ProviderEvent::AwaitTransferRestartTimeout)
}

async fn verify_data(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let tracked = match env.stores.get(&store_key(&deal.proposal_cid)) {
        Ok(tracked) => tracked,
        Err(e) => return ctx.trigger(ProviderEvent::DataVerificationFailed(e.msg().to_string())),
    };
    let piece = match prepare_piece(&tracked.store, tracked.root).await {
        Ok(piece) => piece,
        Err(e) => return ctx.trigger(ProviderEvent::DataVerificationFailed(format!("error generating CommP: {}", e.msg()))),
    };
    if piece.piece_cid != deal.proposal().piece_cid {
        return ctx.trigger(ProviderEvent::DataVerificationFailed(
            "proposal CommP doesn't match calculated CommP".to_string(),
        ));
    }
    ctx.trigger(ProviderEvent::VerifiedData)
}

async fn reserve_provider_funds(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let proposal = deal.proposal();
    let worker = match env.node.get_miner_worker_address(&proposal.provider).await {
        Ok(worker) => worker,
        Err(e) => return ctx.trigger(ProviderEvent::NodeErrored(e.msg().to_string())),
    };
    let amount = proposal.provider_balance_requirement().clone();
    match env.node.reserve_funds(&worker, &proposal.provider, &amount).await {
        Ok(Some(msg)) => ctx.trigger(ProviderEvent::FundingInitiated(msg, amount)),
        Ok(None) => ctx.trigger(ProviderEvent::FundsReserved(amount)),
        Err(e) => ctx.trigger(ProviderEvent::TrackFundsFailed(e.msg().to_string())),
    }
}

async fn wait_for_funding(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let Some(msg) = deal.add_funds_cid else {
        return ctx.trigger(ProviderEvent::TrackFundsFailed("no add funds message to wait for".to_string()));
    };
    match env.node.wait_for_message(&msg).await {
        Ok(()) => ctx.trigger(ProviderEvent::Funded),
        Err(e) => ctx.trigger(ProviderEvent::TrackFundsFailed(format!("AddFunds: {}", e.msg()))),
    }
}

async fn publish_deal(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    match env.node.publish_deals(&deal).await {
        Ok(msg) => ctx.trigger(ProviderEvent::DealPublishInitiated(msg)),
        Err(e) => ctx.trigger(ProviderEvent::DealPublishError(e.msg().to_string())),
    }
}

async fn wait_for_publish(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let Some(msg) = deal.publish_cid else {
        return ctx.trigger(ProviderEvent::DealPublishError("deal has no publish message".to_string()));
    };
    let deal_id = match env.node.wait_for_publish_deals(&msg, deal.proposal()).await {
        Ok(id) => id,
        Err(e) => return ctx.trigger(ProviderEvent::DealPublishError(e.msg().to_string())),
    };
    release_reserved_funds(&env, &deal).await;
    info!("storage deal {} published as deal {}", deal.proposal_cid, deal_id);
    ctx.trigger(ProviderEvent::DealPublished(deal_id))
}

async fn hand_off_deal(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let car = match env.stores.export_car(&store_key(&deal.proposal_cid)).await {
        Ok(car) => car,
        Err(e) => return ctx.trigger(ProviderEvent::DealHandoffFailed(format!("reading piece data: {}", e.msg()))),
    };
    let size = deal.proposal().piece_size.unpadded();
    match env.node.on_deal_complete(&deal, size, car).await {
        Ok(packing) => ctx.trigger(ProviderEvent::DealHandedOff(packing)),
        Err(e) => ctx.trigger(ProviderEvent::DealHandoffFailed(e.msg().to_string())),
    }
}

async fn verify_deal_pre_committed(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let Some(deal_id) = deal.deal_id else {
        return ctx.trigger(ProviderEvent::DealPrecommitFailed("deal has no on-chain id".to_string()));
    };
    let proposal = deal.proposal();
    match env
        .node
        .on_deal_sector_pre_committed(&proposal.provider, deal_id, proposal, deal.publish_cid)
        .await
    {
        Ok(sector) => ctx.trigger(ProviderEvent::DealPrecommitted(sector)),
        Err(e) => ctx.trigger(ProviderEvent::DealPrecommitFailed(e.msg().to_string())),
    }
}

async fn verify_deal_activated(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let (Some(deal_id), Some(sector)) = (deal.deal_id, deal.sector_number) else {
        return ctx.trigger(ProviderEvent::DealActivationFailed("deal has no on-chain id or sector".to_string()));
    };
    let proposal = deal.proposal();
    match env.node.on_deal_sector_committed(&proposal.provider, deal_id, sector, proposal).await {
        Ok(()) => ctx.trigger(ProviderEvent::DealActivated),
        Err(e) => ctx.trigger(ProviderEvent::DealActivationFailed(e.msg().to_string())),
    }
}

/// Indexes the sealed piece and its blocks for retrieval, then drops the received payload.
async fn record_piece_info(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let key = store_key(&deal.proposal_cid);
    if let Err(e) = index_piece(&env, &deal, &key).await {
        return ctx.trigger(ProviderEvent::PieceStoreErrored(e.msg().to_string()));
    }
    if let Err(e) = env.stores.clean(&key) {
        warn!("storage deal {}: failed to clean up block store: {}", deal.proposal_cid, e);
    }
    ctx.trigger(ProviderEvent::CleanupFinished)
}

async fn index_piece(env: &ProviderDealEnvironment, deal: &MinerDeal, key: &str) -> Result<(), DealError> {
    let proposal = deal.proposal();
    let (deal_id, sector_id) = deal
        .deal_id
        .zip(deal.sector_number)
        .ok_or_else(|| deal_error!(illegal_state; "deal has no on-chain id or sector"))?;
    let tracked = env.stores.get(key)?;
    let piece = prepare_piece(&tracked.store, tracked.root).await?;
    env.pieces.add_deal_for_piece(
        proposal.piece_cid,
        DealInfo {
            deal_id,
            sector_id,
            offset: deal.offset.unwrap_or(PaddedPieceSize(0)),
            length: proposal.piece_size,
        },
    )?;
    env.pieces.add_piece_block_locations(proposal.piece_cid, piece.block_locations())?;
    Ok(())
}

async fn wait_for_deal_completion(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    let Some(deal_id) = deal.deal_id else {
        return ctx.trigger(ProviderEvent::DealCompletionFailed("deal has no on-chain id".to_string()));
    };
    match env.node.on_deal_expired_or_slashed(deal_id).await {
        Ok(DealCompletion::Expired) => ctx.trigger(ProviderEvent::DealExpired),
        Ok(DealCompletion::Slashed(epoch)) => ctx.trigger(ProviderEvent::DealSlashed(epoch)),
        Err(e) => ctx.trigger(ProviderEvent::DealCompletionFailed(e.msg().to_string())),
    }
}

async fn fail_deal(ctx: Ctx, env: Env, deal: MinerDeal) -> Result<(), DealError> {
    release_reserved_funds(&env, &deal).await;
    env.streams.close(&deal.proposal_cid, env.config.close_transfer_timeout).await;
    if let Some(channel) = &deal.transfer_channel_id {
        close_channel_within(env.transfer.as_ref(), channel, env.config.close_transfer_timeout, &deal.proposal_cid)
            .await;
    }
    if let Err(e) = env.stores.clean(&store_key(&deal.proposal_cid)) {
        warn!("storage deal {}: failed to clean up block store: {}", deal.proposal_cid, e);
    }
    warn!("storage deal {} failed: {}", deal.proposal_cid, deal.message);
    ctx.trigger(ProviderEvent::Failed)
}

async fn release_reserved_funds(env: &ProviderDealEnvironment, deal: &MinerDeal) {
    if deal.funds_reserved.is_zero() {
        return;
    }
    if let Err(e) = env.node.release_funds(&deal.proposal().provider, &deal.funds_reserved).await {
        warn!("storage deal {}: failed to release funds: {}", deal.proposal_cid, e);
    }
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::fsm::{Destination, FsmEvent};
    use fil_markets_runtime::network::PeerId;
    use fil_markets_runtime::util::cid::raw_cid;
    use fvm_shared::address::Address;
    use fvm_shared::crypto::signature::Signature;

    use super::*;
    use crate::types::{ClientDealProposal, DataRef, DealProposal};

    fn deal(state: StorageDealStatus) -> MinerDeal {
        let proposal = ClientDealProposal {
            proposal: DealProposal {
                piece_cid: raw_cid(b"piece").unwrap(),
                piece_size: PaddedPieceSize(2048),
                verified_deal: false,
                client: Address::new_id(100),
                provider: Address::new_id(200),
                label: String::new(),
                start_epoch: 100,
                end_epoch: 200,
                storage_price_per_epoch: TokenAmount::from_atto(10),
                provider_collateral: TokenAmount::from_atto(50),
                client_collateral: TokenAmount::zero(),
            },
            client_signature: Signature::new_secp256k1(vec![1; 65]),
        };
        let cid = proposal.cid().unwrap();
        let mut deal =
            MinerDeal::new(proposal, cid, PeerId::new("client"), DataRef::graphsync(raw_cid(b"payload").unwrap()));
        deal.state = state;
        deal
    }

    fn apply(deal: &mut MinerDeal, event: ProviderEvent) -> Option<StorageDealStatus> {
        let table = provider_table();
        let (dest, action) = table.lookup(deal.state, &event)?;
        if let Some(action) = action {
            action(deal, &event).unwrap();
        }
        if let Destination::State(next) = dest {
            deal.state = next;
        }
        Some(deal.state)
    }

    fn channel() -> ChannelId {
        ChannelId { initiator: PeerId::new("client"), responder: PeerId::new("provider"), id: 0 }
    }

    #[test]
    fn table_is_complete() {
        provider_table().validate().unwrap();
        assert!(provider_table().kinds().contains(&ProviderEvent::Restart.kind()));
    }

    #[test]
    fn accepted_deal_walks_to_active() {
        use StorageDealStatus::*;
        let mut d = deal(Unknown);
        let steps = [
            (ProviderEvent::Open, Validating),
            (ProviderEvent::DealDeciding, AcceptWait),
            (ProviderEvent::DataRequested, WaitingForData),
            (ProviderEvent::ResponseSent, WaitingForData),
            (ProviderEvent::DataTransferInitiated(channel()), Transferring),
            (ProviderEvent::DataTransferCompleted, VerifyData),
            (ProviderEvent::VerifiedData, ReserveProviderFunds),
            (ProviderEvent::FundsReserved(TokenAmount::from_atto(50)), Publish),
            (ProviderEvent::DealPublishInitiated(raw_cid(b"publish").unwrap()), Publishing),
            (ProviderEvent::DealPublished(3), Staged),
            (
                ProviderEvent::DealHandedOff(PackingResult {
                    sector_number: 9,
                    offset: PaddedPieceSize(0),
                    size: PaddedPieceSize(2048),
                }),
                AwaitingPreCommit,
            ),
            (ProviderEvent::DealPrecommitted(10), Sealing),
            (ProviderEvent::DealActivated, Finalizing),
            (ProviderEvent::CleanupFinished, Active),
            (ProviderEvent::DealSlashed(150), Slashed),
        ];
        for (event, expected) in steps {
            assert_eq!(apply(&mut d, event.clone()), Some(expected), "after {:?}", event);
        }
        assert_eq!(d.deal_id, Some(3));
        assert_eq!(d.sector_number, Some(10));
        assert_eq!(d.transfer_channel_id, Some(channel()));
        assert!(d.funds_reserved.is_zero());
    }

    #[test]
    fn rejection_is_sent_then_fails() {
        let mut d = deal(StorageDealStatus::Validating);
        apply(&mut d, ProviderEvent::DealRejected("incorrect provider for deal".into()));
        assert_eq!(d.state, StorageDealStatus::Rejecting);
        assert_eq!(d.message, "deal rejected: incorrect provider for deal");
        assert_eq!(apply(&mut d, ProviderEvent::RejectionSent), Some(StorageDealStatus::Failing));
        assert_eq!(apply(&mut d, ProviderEvent::Error("late".into())), Some(StorageDealStatus::Error));
        assert_eq!(d.message, "deal rejected: incorrect provider for deal");
    }

    #[test]
    fn restart_depends_on_state() {
        let mut d = deal(StorageDealStatus::Validating);
        assert_eq!(apply(&mut d, ProviderEvent::Restart), Some(StorageDealStatus::Error));
        assert!(d.message.contains("provider restarted"));

        let mut d = deal(StorageDealStatus::Transferring);
        assert_eq!(apply(&mut d, ProviderEvent::Restart), Some(StorageDealStatus::ProviderTransferAwaitRestart));
        assert_eq!(
            apply(&mut d, ProviderEvent::DataTransferRestarted(channel())),
            Some(StorageDealStatus::Transferring)
        );

        let mut d = deal(StorageDealStatus::Sealing);
        assert_eq!(apply(&mut d, ProviderEvent::Restart), Some(StorageDealStatus::Sealing));
    }

    #[test]
    fn manual_import_skips_transfer() {
        let mut d = deal(StorageDealStatus::WaitingForData);
        assert_eq!(apply(&mut d, ProviderEvent::VerifiedData), Some(StorageDealStatus::ReserveProviderFunds));
    }

    #[test]
    fn transfer_events_map_to_deal_events() {
        let event = |code| TransferEvent { channel: channel(), voucher: vec![], code };
        assert!(matches!(
            transfer_event(&event(TransferEventCode::Open)),
            Some(ProviderEvent::DataTransferInitiated(_))
        ));
        assert!(matches!(
            transfer_event(&event(TransferEventCode::Complete)),
            Some(ProviderEvent::DataTransferCompleted)
        ));
        assert!(transfer_event(&event(TransferEventCode::Progress(10))).is_none());
    }
}
