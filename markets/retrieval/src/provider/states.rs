// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal_events;
use fil_markets_runtime::fsm::{EventTable, FsmContext, FsmDefinition};
use fil_markets_runtime::piecestore::{PieceInfo, PieceStore, PieceStoreError};
use fil_markets_runtime::traversal::{BlockPrefix, Traverser};
use fil_markets_runtime::DealError;
use fvm_shared::econ::TokenAmount;
use log::{debug, info, warn};
use num_traits::Zero;

use super::ProviderDealEnvironment;
use crate::types::{
    Ask, Block, DealPayment, DealResponse, DealStatus, Params, Progress, ProviderDealIdentifier,
    ProviderDealState,
};

deal_events! {
    /// Everything that moves a provider retrieval deal forward.
    pub enum ProviderEvent / ProviderEventKind {
        Open,
        DealNotFound(String),
        DealRejected(String),
        DealAccepted(PieceInfo),
        WriteResponseFailed(String),
        UnsealPaymentRequested,
        BeginUnsealing,
        UnsealComplete,
        UnsealError(String),
        BlocksSent(Progress),
        AllBlocksSent(Progress),
        BlockReadErrored(String),
        PaymentReceived(TokenAmount),
        ReadPaymentErrored(String),
        SaveVoucherFailed(String),
        PartialPaymentReceived(String),
        Complete,
        CleanupComplete,
        Cancel,
        CancelComplete,
        Restart,
        Error(String),
    }
}

type Ctx = FsmContext<ProviderDealState, ProviderEvent>;
type Env = Arc<ProviderDealEnvironment>;

/// Provider statuses that are not final.
pub const PROVIDER_ACTIVE: [DealStatus; 10] = [
    DealStatus::New,
    DealStatus::Accepted,
    DealStatus::Unsealing,
    DealStatus::FundsNeededUnseal,
    DealStatus::Ongoing,
    DealStatus::FundsNeeded,
    DealStatus::FundsNeededLastPayment,
    DealStatus::Finalizing,
    DealStatus::Failing,
    DealStatus::Cancelling,
];

const AWAITING_PAYMENT: [DealStatus; 3] =
    [DealStatus::FundsNeeded, DealStatus::FundsNeededUnseal, DealStatus::FundsNeededLastPayment];

fn record_message(deal: &mut ProviderDealState, event: &ProviderEvent) -> Result<(), DealError> {
    use ProviderEvent::*;
    deal.message = match event {
        DealNotFound(m) | DealRejected(m) | PartialPaymentReceived(m) => m.clone(),
        WriteResponseFailed(m) => format!("writing deal response: {}", m),
        UnsealError(m) => format!("unsealing data: {}", m),
        BlockReadErrored(m) => format!("reading block: {}", m),
        ReadPaymentErrored(m) => format!("reading payment: {}", m),
        SaveVoucherFailed(m) => format!("saving payment voucher: {}", m),
        Cancel => "Cancelled".to_string(),
        Error(_) if !deal.message.is_empty()
            && matches!(deal.status, DealStatus::Failing | DealStatus::Cancelling) =>
        {
            return Ok(())
        }
        Error(m) => m.clone(),
        _ => return Ok(()),
    };
    Ok(())
}

fn apply_progress(deal: &mut ProviderDealState, event: &ProviderEvent) -> Result<(), DealError> {
    if let ProviderEvent::BlocksSent(progress) | ProviderEvent::AllBlocksSent(progress) = event {
        deal.total_sent += progress.bytes;
        deal.traversal = Some(progress.traversal.clone());
    }
    Ok(())
}

fn provider_table() -> EventTable<ProviderDealState, ProviderEvent> {
    use DealStatus::*;
    use ProviderEventKind as K;

    let writing = PROVIDER_ACTIVE.into_iter().filter(|s| !matches!(s, Failing | Cancelling));

    EventTable::new()
        .event(K::Open)
        .from(New)
        .to_no_change()
        .event(K::DealNotFound)
        .from(New)
        .to(DealNotFound)
        .action(record_message)
        .event(K::DealRejected)
        .from(New)
        .to(Rejected)
        .action(record_message)
        .event(K::DealAccepted)
        .from(New)
        .to(Accepted)
        .action(|deal, event| {
            if let ProviderEvent::DealAccepted(piece) = event {
                deal.piece_info = Some(piece.clone());
            }
            Ok(())
        })
        .event(K::WriteResponseFailed)
        .from_many(writing)
        .to(Failing)
        .action(record_message)
        .event(K::UnsealPaymentRequested)
        .from(Accepted)
        .to(FundsNeededUnseal)
        .event(K::BeginUnsealing)
        .from(Accepted)
        .to(Unsealing)
        .event(K::UnsealComplete)
        .from(Unsealing)
        .to(Ongoing)
        .event(K::UnsealError)
        .from(Unsealing)
        .to(Failing)
        .action(record_message)
        .event(K::BlocksSent)
        .from(Ongoing)
        .to(FundsNeeded)
        .action(apply_progress)
        .event(K::AllBlocksSent)
        .from(Ongoing)
        .to(FundsNeededLastPayment)
        .action(apply_progress)
        .event(K::BlockReadErrored)
        .from(Ongoing)
        .to(Failing)
        .action(record_message)
        .event(K::PaymentReceived)
        .from(FundsNeeded)
        .to(Ongoing)
        .from(FundsNeededUnseal)
        .to(Unsealing)
        .from(FundsNeededLastPayment)
        .to(Finalizing)
        .action(|deal, event| {
            let ProviderEvent::PaymentReceived(amount) = event else { return Ok(()) };
            deal.funds_received += amount;
            if deal.status == FundsNeeded {
                deal.bytes_billed = deal.total_sent;
                deal.current_interval += deal.proposal.params.payment_interval_increase;
            }
            Ok(())
        })
        .event(K::ReadPaymentErrored)
        .from_many(AWAITING_PAYMENT)
        .to(Failing)
        .action(record_message)
        .event(K::SaveVoucherFailed)
        .from_many(AWAITING_PAYMENT)
        .to(Failing)
        .action(record_message)
        .event(K::PartialPaymentReceived)
        .from_many(AWAITING_PAYMENT)
        .to(Failing)
        .action(record_message)
        .event(K::Complete)
        .from(Finalizing)
        .to(Completed)
        .event(K::CleanupComplete)
        .from(Failing)
        .to(Errored)
        .event(K::Cancel)
        .from_many(PROVIDER_ACTIVE.into_iter().filter(|s| *s != Cancelling))
        .to(Cancelling)
        .action(record_message)
        .event(K::CancelComplete)
        .from(Cancelling)
        .to(Cancelled)
        .event(K::Restart)
        .from_many(PROVIDER_ACTIVE)
        .to_no_change()
        .event(K::Error)
        .from(Failing)
        .to(Errored)
        .from(Cancelling)
        .to_just_record()
        .from_many(PROVIDER_ACTIVE)
        .to(Failing)
        .action(record_message)
}

/// The provider retrieval deal state machine.
pub fn provider_fsm() -> FsmDefinition<ProviderDealState, ProviderEvent, ProviderDealEnvironment> {
    use DealStatus::*;

    FsmDefinition::new("retrieval-provider", provider_table())
        .on_entry(New, receive_deal)
        .on_entry(Accepted, decide_unsealing)
        .on_entry(Unsealing, unseal_data)
        .on_entry(Ongoing, send_blocks)
        .on_entry(FundsNeeded, request_payment)
        .on_entry(FundsNeededUnseal, request_payment)
        .on_entry(FundsNeededLastPayment, request_payment)
        .on_entry(Finalizing, finalize_deal)
        .on_entry(Failing, fail_deal)
        .on_entry(Cancelling, cancel_deal)
        .finality_states(DealStatus::FINALITY)
        .on_entry_error(|e| ProviderEvent::Error(e.msg().to_string()))
}

/// Finds a piece holding `payload`, restricted to `piece` when given. Returns the last lookup
/// error when no candidate piece could be read.
pub fn piece_info_for_payload(
    pieces: &dyn PieceStore,
    payload: &Cid,
    piece: Option<&Cid>,
) -> Result<PieceInfo, PieceStoreError> {
    let cid_info = pieces.get_cid_info(payload)?;
    let mut last_err = PieceStoreError::NotFound;
    for location in &cid_info.piece_block_locations {
        if matches!(piece, Some(p) if *p != location.piece_cid) {
            continue;
        }
        match pieces.get_piece_info(&location.piece_cid) {
            Ok(info) => return Ok(info),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Checks proposed terms against the provider's ask.
pub fn check_terms(ask: &Ask, params: &Params) -> Result<(), String> {
    if params.price_per_byte < ask.price_per_byte {
        return Err("Price per byte too low".to_string());
    }
    if params.payment_interval > ask.payment_interval {
        return Err("Payment interval too large".to_string());
    }
    if params.payment_interval_increase > ask.payment_interval_increase {
        return Err("Payment interval increase too large".to_string());
    }
    if params.unseal_price < ask.unseal_price {
        return Err("Unseal price too small".to_string());
    }
    Ok(())
}

async fn write_response(
    env: &ProviderDealEnvironment,
    key: &ProviderDealIdentifier,
    response: &DealResponse,
) -> Result<(), DealError> {
    let stream = env.streams.get(key)?;
    let res = stream.write(response).await;
    res
}

/// Sends a final response if the stream is still there, then closes it.
async fn respond_and_close(env: &ProviderDealEnvironment, key: &ProviderDealIdentifier, response: DealResponse) {
    if let Err(e) = write_response(env, key, &response).await {
        debug!("retrieval deal {}: could not send {} response: {}", key, response.status, e);
    }
    env.streams.close(key, env.config.close_transfer_timeout).await;
}

async fn receive_deal(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    let key = deal.identifier();
    let proposal = &deal.proposal;

    let piece = match piece_info_for_payload(
        env.pieces.as_ref(),
        &proposal.payload_cid,
        proposal.params.piece_cid.as_ref(),
    ) {
        Ok(piece) => piece,
        Err(PieceStoreError::NotFound) => {
            let message = format!("no piece found for payload {}", proposal.payload_cid);
            let response = DealResponse::new(DealStatus::DealNotFound, proposal.id).with_message(message.clone());
            respond_and_close(&env, &key, response).await;
            return ctx.trigger(ProviderEvent::DealNotFound(message));
        }
        Err(e) => return reject(ctx, &env, &deal, format!("could not locate piece: {}", e)).await,
    };

    if let Err(reason) = check_terms(&env.ask()?, &proposal.params) {
        return reject(ctx, &env, &deal, reason).await;
    }

    if let Some(decider) = env.decider()? {
        match decider(&deal) {
            Ok((true, _)) => {}
            Ok((false, reason)) => return reject(ctx, &env, &deal, reason).await,
            Err(e) => return reject(ctx, &env, &deal, format!("deal decider: {}", e.msg())).await,
        }
    }

    let response = DealResponse::new(DealStatus::Accepted, proposal.id);
    if let Err(e) = write_response(&env, &key, &response).await {
        return ctx.trigger(ProviderEvent::WriteResponseFailed(e.msg().to_string()));
    }
    info!("accepted retrieval deal {} for {}", key, proposal.payload_cid);
    ctx.trigger(ProviderEvent::DealAccepted(piece))
}

async fn reject(ctx: Ctx, env: &ProviderDealEnvironment, deal: &ProviderDealState, reason: String) -> Result<(), DealError> {
    let key = deal.identifier();
    info!("rejecting retrieval deal {}: {}", key, reason);
    let response = DealResponse::new(DealStatus::Rejected, deal.proposal.id).with_message(reason.clone());
    respond_and_close(env, &key, response).await;
    ctx.trigger(ProviderEvent::DealRejected(reason))
}

async fn decide_unsealing(ctx: Ctx, _env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    if deal.proposal.params.unseal_price.is_positive() {
        ctx.trigger(ProviderEvent::UnsealPaymentRequested)
    } else {
        ctx.trigger(ProviderEvent::BeginUnsealing)
    }
}

async fn unseal_data(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    match env.loader.load(&deal.proposal.payload_cid).await {
        Ok(_) => ctx.trigger(ProviderEvent::UnsealComplete),
        Err(e) => ctx.trigger(ProviderEvent::UnsealError(e.msg().to_string())),
    }
}

async fn send_blocks(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    let (blocks, progress) = match next_blocks(&env, &deal).await {
        Ok(sent) => sent,
        Err(e) => return ctx.trigger(ProviderEvent::BlockReadErrored(e.msg().to_string())),
    };
    let mut response = DealResponse::new(DealStatus::Ongoing, deal.proposal.id);
    response.blocks = blocks;
    if let Err(e) = write_response(&env, &deal.identifier(), &response).await {
        return ctx.trigger(ProviderEvent::WriteResponseFailed(e.msg().to_string()));
    }
    debug!("retrieval deal {}: sent {} bytes", deal.identifier(), progress.bytes);
    if progress.complete {
        ctx.trigger(ProviderEvent::AllBlocksSent(progress))
    } else {
        ctx.trigger(ProviderEvent::BlocksSent(progress))
    }
}

/// Loads the next blocks of the traversal, at least one, until the current payment interval is
/// used up or the traversal completes.
async fn next_blocks(env: &ProviderDealEnvironment, deal: &ProviderDealState) -> Result<(Vec<Block>, Progress), DealError> {
    let selector = deal.proposal.params.selector();
    let mut traverser = match &deal.traversal {
        Some(state) => Traverser::resume(selector, state)?,
        None => {
            let mut traverser = Traverser::new(deal.proposal.payload_cid, selector);
            traverser.start()?;
            traverser
        }
    };

    let mut blocks = Vec::new();
    let mut bytes = 0;
    while let Some(cid) = traverser.current_request() {
        let data = env.loader.load(&cid).await?;
        traverser.advance(&data)?;
        bytes += data.len() as u64;
        blocks.push(Block { prefix: BlockPrefix::of(&cid).to_bytes(), data });
        if deal.total_sent + bytes - deal.bytes_billed >= deal.current_interval {
            break;
        }
    }
    let progress = Progress { bytes, traversal: traverser.snapshot(), complete: traverser.is_complete() };
    Ok((blocks, progress))
}

async fn request_payment(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    let owed = deal.payment_owed();
    if !owed.is_positive() {
        return ctx.trigger(ProviderEvent::PaymentReceived(TokenAmount::zero()));
    }

    let mut response = DealResponse::new(deal.status, deal.proposal.id);
    response.payment_owed = owed.clone();
    let stream = env.streams.get(&deal.identifier())?;
    let exchanged = match stream.write(&response).await {
        Ok(()) => stream
            .read::<DealPayment>()
            .await
            .map_err(|e| ProviderEvent::ReadPaymentErrored(e.msg().to_string())),
        Err(e) => Err(ProviderEvent::WriteResponseFailed(e.msg().to_string())),
    };
    let payment = match exchanged {
        Ok(payment) => payment,
        Err(event) => return ctx.trigger(event),
    };

    let saved = env
        .node
        .save_payment_voucher(&payment.payment_channel, &payment.payment_voucher, &[], &owed)
        .await;
    let received = match saved {
        Ok(received) => received,
        Err(e) => return ctx.trigger(ProviderEvent::SaveVoucherFailed(e.msg().to_string())),
    };
    if received < owed {
        return ctx.trigger(ProviderEvent::PartialPaymentReceived(format!(
            "received partial payment: {} of {} owed",
            received.atto(),
            owed.atto()
        )));
    }
    ctx.trigger(ProviderEvent::PaymentReceived(received))
}

async fn finalize_deal(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    let key = deal.identifier();
    let response = DealResponse::new(DealStatus::Completed, deal.proposal.id);
    if let Err(e) = write_response(&env, &key, &response).await {
        return ctx.trigger(ProviderEvent::WriteResponseFailed(e.msg().to_string()));
    }
    env.streams.close(&key, env.config.close_transfer_timeout).await;
    info!("completed retrieval deal {}: sent {} bytes", key, deal.total_sent);
    ctx.trigger(ProviderEvent::Complete)
}

async fn fail_deal(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    let key = deal.identifier();
    warn!("retrieval deal {} failed: {}", key, deal.message);
    let response = DealResponse::new(DealStatus::Errored, deal.proposal.id).with_message(deal.message.clone());
    respond_and_close(&env, &key, response).await;
    ctx.trigger(ProviderEvent::CleanupComplete)
}

async fn cancel_deal(ctx: Ctx, env: Env, deal: ProviderDealState) -> Result<(), DealError> {
    let key = deal.identifier();
    let response = DealResponse::new(DealStatus::Cancelled, deal.proposal.id).with_message(deal.message.clone());
    respond_and_close(&env, &key, response).await;
    ctx.trigger(ProviderEvent::CancelComplete)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fil_markets_runtime::fsm::Destination;
    use fil_markets_runtime::network::PeerId;
    use fil_markets_runtime::piecestore::{BlockLocation, DealInfo, MemoryPieceStore};
    use fil_markets_runtime::util::cid::raw_cid;
    use fvm_shared::piece::PaddedPieceSize;
    use test_case::test_case;

    use super::*;
    use crate::types::DealProposal;

    fn deal(status: DealStatus) -> ProviderDealState {
        let proposal = DealProposal {
            payload_cid: raw_cid(b"payload").unwrap(),
            id: 3,
            params: Params::new(TokenAmount::from_atto(1000), 10_000, 1000, TokenAmount::zero()),
        };
        let mut deal = ProviderDealState::new(proposal, PeerId::new("client"));
        deal.status = status;
        deal
    }

    fn apply(deal: &mut ProviderDealState, event: ProviderEvent) -> Option<DealStatus> {
        let table = provider_table();
        let (dest, action) = table.lookup(deal.status, &event)?;
        if let Some(action) = action {
            action(deal, &event).unwrap();
        }
        if let Destination::State(next) = dest {
            deal.status = next;
        }
        Some(deal.status)
    }

    #[test]
    fn table_is_complete() {
        provider_table().validate().unwrap();
    }

    #[test]
    fn byte_payments_widen_the_interval() {
        let mut d = deal(DealStatus::FundsNeeded);
        d.total_sent = 10_136;
        apply(&mut d, ProviderEvent::PaymentReceived(TokenAmount::from_atto(10_136_000)));
        assert_eq!(d.status, DealStatus::Ongoing);
        assert_eq!(d.bytes_billed, 10_136);
        assert_eq!(d.current_interval, 11_000);
        assert!(d.payment_owed().is_zero());

        let mut d = deal(DealStatus::FundsNeededUnseal);
        apply(&mut d, ProviderEvent::PaymentReceived(TokenAmount::from_atto(1)));
        assert_eq!(d.status, DealStatus::Unsealing);
        assert_eq!(d.current_interval, 10_000);

        let mut d = deal(DealStatus::FundsNeededLastPayment);
        assert_eq!(apply(&mut d, ProviderEvent::PaymentReceived(TokenAmount::zero())), Some(DealStatus::Finalizing));
    }

    #[test]
    fn failures_end_in_errored() {
        let mut d = deal(DealStatus::FundsNeeded);
        let partial = "received partial payment: 1 of 2 owed".to_string();
        assert_eq!(apply(&mut d, ProviderEvent::PartialPaymentReceived(partial.clone())), Some(DealStatus::Failing));
        assert_eq!(apply(&mut d, ProviderEvent::WriteResponseFailed("closed".into())), None);
        assert_eq!(apply(&mut d, ProviderEvent::Error("late".into())), Some(DealStatus::Errored));
        assert_eq!(d.message, partial);
    }

    #[test_case(Params::new(TokenAmount::from_atto(1), 100, 10, TokenAmount::zero()), Some("Price per byte too low"); "price")]
    #[test_case(Params::new(TokenAmount::from_atto(2), 101, 10, TokenAmount::zero()), Some("Payment interval too large"); "interval")]
    #[test_case(Params::new(TokenAmount::from_atto(2), 100, 11, TokenAmount::zero()), Some("Payment interval increase too large"); "increase")]
    #[test_case(Params::new(TokenAmount::from_atto(2), 100, 10, TokenAmount::from_atto(4)), Some("Unseal price too small"); "unseal")]
    #[test_case(Params::new(TokenAmount::from_atto(3), 50, 10, TokenAmount::from_atto(5)), None; "acceptable")]
    fn terms_are_checked_against_the_ask(params: Params, expected: Option<&str>) {
        let ask = Ask {
            price_per_byte: TokenAmount::from_atto(2),
            unseal_price: TokenAmount::from_atto(5),
            payment_interval: 100,
            payment_interval_increase: 10,
        };
        assert_eq!(check_terms(&ask, &params).err().as_deref(), expected);
    }

    #[test]
    fn piece_lookup_honours_the_requested_piece() {
        let pieces = MemoryPieceStore::new();
        let payload = raw_cid(b"payload").unwrap();
        let first = raw_cid(b"piece one").unwrap();
        let second = raw_cid(b"piece two").unwrap();
        for (i, piece) in [first, second].into_iter().enumerate() {
            let deal = DealInfo {
                deal_id: i as u64,
                sector_id: i as u64,
                offset: PaddedPieceSize(0),
                length: PaddedPieceSize(2048),
            };
            pieces.add_deal_for_piece(piece, deal).unwrap();
            let locations = BTreeMap::from([(payload, BlockLocation { rel_offset: 0, block_size: 7 })]);
            pieces.add_piece_block_locations(piece, locations).unwrap();
        }

        assert_eq!(piece_info_for_payload(&pieces, &payload, None).unwrap().piece_cid, first);
        assert_eq!(piece_info_for_payload(&pieces, &payload, Some(&second)).unwrap().piece_cid, second);
        let other = raw_cid(b"elsewhere").unwrap();
        assert_eq!(piece_info_for_payload(&pieces, &payload, Some(&other)), Err(PieceStoreError::NotFound));

        pieces.fail_piece_info(second);
        assert_eq!(
            piece_info_for_payload(&pieces, &payload, Some(&second)),
            Err(PieceStoreError::Failed("GetPieceInfo failed".to_string()))
        );
    }
}
