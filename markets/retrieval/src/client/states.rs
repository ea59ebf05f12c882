// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal_events;
use fil_markets_runtime::fsm::{EventTable, FsmContext, FsmDefinition};
use fil_markets_runtime::network::{open_with_backoff, RETRIEVAL_DEAL_PROTOCOL};
use fil_markets_runtime::traversal::{BlockPrefix, Traverser};
use fil_markets_runtime::util::AsDealErrors;
use fil_markets_runtime::{deal_error, DealError};
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use log::{debug, warn};
use num_traits::Zero;

use super::ClientDealEnvironment;
use crate::types::{
    Block, ClientDealState, DealPayment, DealResponse, DealStatus, PaymentInfo, Progress,
};

deal_events! {
    /// Everything that moves a client retrieval deal forward.
    pub enum ClientEvent / ClientEventKind {
        Open,
        DealProposed,
        WriteDealProposalErrored(String),
        DealRejected(String),
        DealNotFound(String),
        DealAccepted,
        UnknownResponseReceived(String),
        PaymentChannelErrored(String),
        PaymentChannelCreateInitiated(Cid),
        PaymentChannelReady(Address),
        AllocateLaneErrored(String),
        LaneAllocated(u64),
        BlocksReceived(Progress),
        PaymentRequested(Progress, TokenAmount),
        LastPaymentRequested(Progress, TokenAmount),
        Complete(Progress),
        ConsumeBlockFailed(String),
        ReadDealResponseErrored(String),
        ProviderErrored(String),
        FundsExpended(String),
        BadPaymentRequested(String),
        CreateVoucherFailed(String),
        WriteDealPaymentErrored(String),
        PaymentSent(TokenAmount),
        RecheckFunds,
        FundsAvailable(TokenAmount),
        FundsAvailableLastPayment(TokenAmount),
        FundsStillInsufficient(String),
        Cancel,
        CancelComplete,
        Restart,
        Error(String),
    }
}

type Ctx = FsmContext<ClientDealState, ClientEvent>;
type Env = Arc<ClientDealEnvironment>;

/// Client statuses that are not final.
pub const CLIENT_ACTIVE: [DealStatus; 12] = [
    DealStatus::New,
    DealStatus::WaitForAcceptance,
    DealStatus::Accepted,
    DealStatus::PaymentChannelCreating,
    DealStatus::PaymentChannelAllocatingLane,
    DealStatus::Ongoing,
    DealStatus::FundsNeeded,
    DealStatus::FundsNeededLastPayment,
    DealStatus::CheckFunds,
    DealStatus::InsufficientFunds,
    DealStatus::Failing,
    DealStatus::Cancelling,
];

const PAYING: [DealStatus; 2] = [DealStatus::FundsNeeded, DealStatus::FundsNeededLastPayment];

/// Key of the block store a deal writes received blocks into.
pub fn store_key(id: u64) -> String {
    format!("retrieval-client/{}", id)
}

fn record_message(deal: &mut ClientDealState, event: &ClientEvent) -> Result<(), DealError> {
    use ClientEvent::*;
    deal.message = match event {
        WriteDealProposalErrored(m) => format!("proposing deal: {}", m),
        DealRejected(m) => format!("deal rejected: {}", m),
        DealNotFound(m) => format!("deal not found: {}", m),
        UnknownResponseReceived(m) => format!("unexpected deal response: {}", m),
        PaymentChannelErrored(m) => format!("error from payment channel: {}", m),
        AllocateLaneErrored(m) => format!("allocating payment lane: {}", m),
        ConsumeBlockFailed(m) => format!("consuming block: {}", m),
        ReadDealResponseErrored(m) => format!("reading deal response: {}", m),
        ProviderErrored(m) => format!("provider errored: {}", m),
        CreateVoucherFailed(m) => format!("creating payment voucher: {}", m),
        WriteDealPaymentErrored(m) => format!("writing deal payment: {}", m),
        FundsExpended(m) | BadPaymentRequested(m) | FundsStillInsufficient(m) => m.clone(),
        Cancel => "Retrieval Cancelled".to_string(),
        // Keep the reason a deal started failing or was cancelled.
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

fn apply_progress(deal: &mut ClientDealState, progress: &Progress) {
    deal.total_received += progress.bytes;
    deal.traversal = Some(progress.traversal.clone());
    deal.all_blocks_received = progress.complete;
}

fn unseal_owed(deal: &ClientDealState) -> TokenAmount {
    let owed = &deal.proposal.params.unseal_price - &deal.unseal_funds_paid;
    if owed.is_positive() {
        owed
    } else {
        TokenAmount::zero()
    }
}

fn client_table() -> EventTable<ClientDealState, ClientEvent> {
    use ClientEventKind as K;
    use DealStatus::*;

    EventTable::new()
        .event(K::Open)
        .from(New)
        .to_no_change()
        .event(K::DealProposed)
        .from(New)
        .to(WaitForAcceptance)
        .event(K::WriteDealProposalErrored)
        .from(New)
        .to(Errored)
        .action(record_message)
        .event(K::DealRejected)
        .from(WaitForAcceptance)
        .to(Rejected)
        .action(record_message)
        .event(K::DealNotFound)
        .from(WaitForAcceptance)
        .to(DealNotFound)
        .action(record_message)
        .event(K::DealAccepted)
        .from(WaitForAcceptance)
        .to(Accepted)
        .event(K::UnknownResponseReceived)
        .from_many([WaitForAcceptance, Ongoing])
        .to(Failing)
        .action(record_message)
        .event(K::PaymentChannelErrored)
        .from_many([Accepted, PaymentChannelCreating])
        .to(Failing)
        .action(record_message)
        .event(K::PaymentChannelCreateInitiated)
        .from(Accepted)
        .to(PaymentChannelCreating)
        .action(|deal, event| {
            if let ClientEvent::PaymentChannelCreateInitiated(msg) = event {
                deal.wait_msg_cid = Some(*msg);
            }
            Ok(())
        })
        .event(K::PaymentChannelReady)
        .from_many([Accepted, PaymentChannelCreating])
        .to(PaymentChannelAllocatingLane)
        .action(|deal, event| {
            if let ClientEvent::PaymentChannelReady(pay_ch) = event {
                deal.payment_info = Some(PaymentInfo { pay_ch: *pay_ch, lane: 0 });
                deal.wait_msg_cid = None;
            }
            Ok(())
        })
        .event(K::AllocateLaneErrored)
        .from(PaymentChannelAllocatingLane)
        .to(Failing)
        .action(record_message)
        .event(K::LaneAllocated)
        .from(PaymentChannelAllocatingLane)
        .to(Ongoing)
        .action(|deal, event| {
            if let ClientEvent::LaneAllocated(lane) = event {
                let id = deal.id();
                let info = deal
                    .payment_info
                    .as_mut()
                    .ok_or_else(|| deal_error!(illegal_state; "deal {} has no payment channel", id))?;
                info.lane = *lane;
            }
            Ok(())
        })
        .event(K::BlocksReceived)
        .from(Ongoing)
        .to_no_change()
        .action(|deal, event| {
            if let ClientEvent::BlocksReceived(progress) = event {
                apply_progress(deal, progress);
            }
            Ok(())
        })
        .event(K::PaymentRequested)
        .from(Ongoing)
        .to(FundsNeeded)
        .action(|deal, event| {
            if let ClientEvent::PaymentRequested(progress, amount) = event {
                apply_progress(deal, progress);
                deal.payment_requested = amount.clone();
            }
            Ok(())
        })
        .event(K::LastPaymentRequested)
        .from(Ongoing)
        .to(FundsNeededLastPayment)
        .action(|deal, event| {
            if let ClientEvent::LastPaymentRequested(progress, amount) = event {
                apply_progress(deal, progress);
                deal.payment_requested = amount.clone();
                deal.last_payment_requested = true;
            }
            Ok(())
        })
        .event(K::Complete)
        .from(Ongoing)
        .to(Completed)
        .action(|deal, event| {
            if let ClientEvent::Complete(progress) = event {
                apply_progress(deal, progress);
            }
            Ok(())
        })
        .event(K::ConsumeBlockFailed)
        .from(Ongoing)
        .to(Failing)
        .action(record_message)
        .event(K::ReadDealResponseErrored)
        .from_many([WaitForAcceptance, Ongoing])
        .to(Failing)
        .action(record_message)
        .event(K::ProviderErrored)
        .from_many([WaitForAcceptance, Ongoing])
        .to(Failing)
        .action(record_message)
        .event(K::FundsExpended)
        .from_many(PAYING)
        .to(InsufficientFunds)
        .action(record_message)
        .event(K::BadPaymentRequested)
        .from_many(PAYING)
        .to(Failing)
        .action(record_message)
        .event(K::CreateVoucherFailed)
        .from_many(PAYING)
        .to(Failing)
        .action(record_message)
        .event(K::WriteDealPaymentErrored)
        .from_many(PAYING)
        .to(Failing)
        .action(record_message)
        .event(K::PaymentSent)
        .from_many(PAYING)
        .to(Ongoing)
        .action(|deal, event| {
            let ClientEvent::PaymentSent(amount) = event else { return Ok(()) };
            let owed = unseal_owed(deal);
            let to_unseal = if *amount < owed { amount.clone() } else { owed };
            deal.unseal_funds_paid += &to_unseal;
            deal.funds_spent += amount;
            if *amount > to_unseal {
                deal.bytes_paid_for = deal.total_received;
                deal.current_interval += deal.proposal.params.payment_interval_increase;
            }
            deal.payment_requested = TokenAmount::zero();
            deal.message.clear();
            Ok(())
        })
        .event(K::RecheckFunds)
        .from(InsufficientFunds)
        .to(CheckFunds)
        .event(K::FundsAvailable)
        .from(CheckFunds)
        .to(FundsNeeded)
        .action(top_up)
        .event(K::FundsAvailableLastPayment)
        .from(CheckFunds)
        .to(FundsNeededLastPayment)
        .action(top_up)
        .event(K::FundsStillInsufficient)
        .from(CheckFunds)
        .to(InsufficientFunds)
        .action(record_message)
        .event(K::Cancel)
        .from_many(CLIENT_ACTIVE.into_iter().filter(|s| *s != Cancelling))
        .to(Cancelling)
        .action(record_message)
        .event(K::CancelComplete)
        .from(Cancelling)
        .to(Cancelled)
        .from(Failing)
        .to(Errored)
        .event(K::Restart)
        .from_many(CLIENT_ACTIVE)
        .to_no_change()
        .event(K::Error)
        .from(Failing)
        .to(Errored)
        .from(Cancelling)
        .to_just_record()
        .from_many(CLIENT_ACTIVE)
        .to(Failing)
        .action(record_message)
}

fn top_up(deal: &mut ClientDealState, event: &ClientEvent) -> Result<(), DealError> {
    if let ClientEvent::FundsAvailable(available) | ClientEvent::FundsAvailableLastPayment(available) = event {
        deal.total_funds = &deal.funds_spent + available;
        deal.message.clear();
    }
    Ok(())
}

/// The client retrieval deal state machine.
pub fn client_fsm() -> FsmDefinition<ClientDealState, ClientEvent, ClientDealEnvironment> {
    use DealStatus::*;

    FsmDefinition::new("retrieval-client", client_table())
        .on_entry(New, propose_deal)
        .on_entry(WaitForAcceptance, wait_for_acceptance)
        .on_entry(Accepted, setup_payment_channel)
        .on_entry(PaymentChannelCreating, wait_payment_channel_ready)
        .on_entry(PaymentChannelAllocatingLane, allocate_lane)
        .on_entry(Ongoing, receive_blocks)
        .on_entry(FundsNeeded, send_funds)
        .on_entry(FundsNeededLastPayment, send_funds)
        .on_entry(CheckFunds, check_funds)
        .on_entry(Failing, cancel_deal)
        .on_entry(Cancelling, cancel_deal)
        .finality_states(DealStatus::FINALITY)
        .on_entry_error(|e| ClientEvent::Error(e.msg().to_string()))
}

async fn propose_deal(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let opened = open_with_backoff(
        env.network.as_ref(),
        &deal.sender,
        RETRIEVAL_DEAL_PROTOCOL,
        &env.config.stream_backoff,
    )
    .await;
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => return ctx.trigger(ClientEvent::WriteDealProposalErrored(e.msg().to_string())),
    };
    if let Err(e) = stream.write(&deal.proposal).await {
        return ctx.trigger(ClientEvent::WriteDealProposalErrored(e.msg().to_string()));
    }
    env.streams.insert(deal.id(), stream)?;
    ctx.trigger(ClientEvent::DealProposed)
}

async fn wait_for_acceptance(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let stream = env.streams.get(&deal.id())?;
    let read = stream.read::<DealResponse>().await;
    let response = match read {
        Ok(response) => response,
        Err(e) => return ctx.trigger(ClientEvent::ReadDealResponseErrored(e.msg().to_string())),
    };
    match response.status {
        DealStatus::Accepted => ctx.trigger(ClientEvent::DealAccepted),
        DealStatus::Rejected => {
            env.streams.close(&deal.id(), env.config.close_transfer_timeout).await;
            ctx.trigger(ClientEvent::DealRejected(response.message))
        }
        DealStatus::DealNotFound => {
            env.streams.close(&deal.id(), env.config.close_transfer_timeout).await;
            ctx.trigger(ClientEvent::DealNotFound(response.message))
        }
        other => ctx.trigger(ClientEvent::UnknownResponseReceived(format!(
            "status {} while waiting for acceptance",
            other
        ))),
    }
}

async fn setup_payment_channel(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let res = env
        .node
        .get_or_create_payment_channel(&deal.client_wallet, &deal.miner_wallet, &deal.total_funds)
        .await;
    match res {
        Ok((_, Some(msg))) => ctx.trigger(ClientEvent::PaymentChannelCreateInitiated(msg)),
        Ok((pay_ch, None)) => ctx.trigger(ClientEvent::PaymentChannelReady(pay_ch)),
        Err(e) => ctx.trigger(ClientEvent::PaymentChannelErrored(e.msg().to_string())),
    }
}

async fn wait_payment_channel_ready(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let msg = deal
        .wait_msg_cid
        .ok_or_else(|| deal_error!(illegal_state; "deal {} is not waiting on a payment channel message", deal.id()))?;
    match env.node.wait_for_payment_channel_ready(&msg).await {
        Ok(pay_ch) => ctx.trigger(ClientEvent::PaymentChannelReady(pay_ch)),
        Err(e) => ctx.trigger(ClientEvent::PaymentChannelErrored(e.msg().to_string())),
    }
}

async fn allocate_lane(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let info = payment_info(&deal)?;
    match env.node.allocate_lane(&info.pay_ch).await {
        Ok(lane) => ctx.trigger(ClientEvent::LaneAllocated(lane)),
        Err(e) => ctx.trigger(ClientEvent::AllocateLaneErrored(e.msg().to_string())),
    }
}

async fn receive_blocks(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let stream = env.streams.get(&deal.id())?;
    let read = stream.read::<DealResponse>().await;
    let response = match read {
        Ok(response) => response,
        Err(e) => return ctx.trigger(ClientEvent::ReadDealResponseErrored(e.msg().to_string())),
    };
    let progress = match consume_blocks(&env, &deal, &response.blocks) {
        Ok(progress) => progress,
        Err(e) => return ctx.trigger(ClientEvent::ConsumeBlockFailed(e.msg().to_string())),
    };
    debug!(
        "retrieval deal {}: {} response with {} bytes, {} owed",
        deal.id(),
        response.status,
        progress.bytes,
        response.payment_owed.atto()
    );
    match response.status {
        DealStatus::Ongoing => ctx.trigger(ClientEvent::BlocksReceived(progress)),
        DealStatus::FundsNeeded | DealStatus::FundsNeededUnseal => {
            ctx.trigger(ClientEvent::PaymentRequested(progress, response.payment_owed))
        }
        DealStatus::FundsNeededLastPayment => {
            ctx.trigger(ClientEvent::LastPaymentRequested(progress, response.payment_owed))
        }
        DealStatus::Completed if progress.complete => {
            env.streams.close(&deal.id(), env.config.close_transfer_timeout).await;
            ctx.trigger(ClientEvent::Complete(progress))
        }
        DealStatus::Completed => ctx.trigger(ClientEvent::ProviderErrored(
            "provider completed the deal before all blocks were received".to_string(),
        )),
        DealStatus::Errored | DealStatus::Rejected | DealStatus::DealNotFound | DealStatus::Cancelled => {
            ctx.trigger(ClientEvent::ProviderErrored(response.message))
        }
        other => ctx.trigger(ClientEvent::UnknownResponseReceived(format!(
            "status {} while receiving blocks",
            other
        ))),
    }
}

/// Verifies received blocks against the deal's traversal and stores them.
fn consume_blocks(
    env: &ClientDealEnvironment,
    deal: &ClientDealState,
    blocks: &[Block],
) -> Result<Progress, DealError> {
    let root = deal.proposal.payload_cid;
    let selector = deal.proposal.params.selector();
    let mut traverser = match &deal.traversal {
        Some(state) => Traverser::resume(selector, state)?,
        None => {
            let mut traverser = Traverser::new(root, selector);
            traverser.start()?;
            traverser
        }
    };
    let tracked = env.stores.get_or_create(&store_key(deal.id()), root)?;

    let mut bytes = 0;
    for block in blocks {
        let cid = BlockPrefix::from_bytes(&block.prefix)?.sum(&block.data)?;
        let expected = traverser
            .current_request()
            .ok_or_else(|| deal_error!(illegal_argument; "received block {} after the traversal completed", cid))?;
        if cid != expected {
            return Err(deal_error!(illegal_argument; "received block {} but expected {}", cid, expected));
        }
        traverser.advance(&block.data)?;
        tracked.store.put_keyed(&cid, &block.data).or_illegal_state("storing received block")?;
        bytes += block.data.len() as u64;
    }
    Ok(Progress { bytes, traversal: traverser.snapshot(), complete: traverser.is_complete() })
}

async fn send_funds(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let requested = deal.payment_requested.clone();
    let available = &deal.total_funds - &deal.funds_spent;
    if requested > available {
        return ctx.trigger(ClientEvent::FundsExpended(format!(
            "not enough funds left: expected amt = {}, actual amt = {}",
            requested.atto(),
            available.atto()
        )));
    }

    let params = &deal.proposal.params;
    let owed_for_unseal = unseal_owed(&deal);
    let received = deal.total_received - deal.bytes_paid_for;
    if !deal.last_payment_requested
        && !deal.all_blocks_received
        && owed_for_unseal.is_zero()
        && received < deal.current_interval
    {
        return ctx.trigger(ClientEvent::BadPaymentRequested(
            "not enough bytes received between payment request".to_string(),
        ));
    }
    let due = TokenAmount::from_atto(params.price_per_byte.atto() * received) + &owed_for_unseal;
    if requested > due {
        return ctx.trigger(ClientEvent::BadPaymentRequested(
            "too much money requested for bytes sent".to_string(),
        ));
    }

    let info = payment_info(&deal)?;
    let cumulative = &deal.funds_spent + &requested;
    let voucher = match env.node.create_payment_voucher(&info.pay_ch, &cumulative, info.lane).await {
        Ok(voucher) => voucher,
        Err(e) => return ctx.trigger(ClientEvent::CreateVoucherFailed(e.msg().to_string())),
    };
    let payment = DealPayment { id: deal.id(), payment_channel: info.pay_ch, payment_voucher: voucher };
    let stream = env.streams.get(&deal.id())?;
    let written = stream.write(&payment).await;
    if let Err(e) = written {
        return ctx.trigger(ClientEvent::WriteDealPaymentErrored(e.msg().to_string()));
    }
    ctx.trigger(ClientEvent::PaymentSent(requested))
}

async fn check_funds(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    let info = payment_info(&deal)?;
    let available = match env.node.check_available_funds(&info.pay_ch).await {
        Ok(available) => available,
        Err(e) => {
            return ctx.trigger(ClientEvent::FundsStillInsufficient(format!(
                "checking available funds: {}",
                e.msg()
            )))
        }
    };
    if available < deal.payment_requested {
        return ctx.trigger(ClientEvent::FundsStillInsufficient(format!(
            "not enough funds left: expected amt = {}, actual amt = {}",
            deal.payment_requested.atto(),
            available.atto()
        )));
    }
    if deal.last_payment_requested {
        ctx.trigger(ClientEvent::FundsAvailableLastPayment(available))
    } else {
        ctx.trigger(ClientEvent::FundsAvailable(available))
    }
}

async fn cancel_deal(ctx: Ctx, env: Env, deal: ClientDealState) -> Result<(), DealError> {
    env.streams.close(&deal.id(), env.config.close_transfer_timeout).await;
    if let Err(e) = env.stores.clean(&store_key(deal.id())) {
        warn!("retrieval deal {}: failed to clean up block store: {}", deal.id(), e);
    }
    ctx.trigger(ClientEvent::CancelComplete)
}

fn payment_info(deal: &ClientDealState) -> Result<PaymentInfo, DealError> {
    deal.payment_info
        .clone()
        .ok_or_else(|| deal_error!(illegal_state; "deal {} has no payment channel", deal.id()))
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::fsm::{Destination, FsmEvent};
    use fil_markets_runtime::network::PeerId;
    use fil_markets_runtime::util::cid::raw_cid;
    use fvm_shared::address::Address;

    use super::*;
    use crate::types::{DealProposal, Params};

    fn deal(status: DealStatus) -> ClientDealState {
        let proposal = DealProposal {
            payload_cid: raw_cid(b"payload").unwrap(),
            id: 1,
            params: Params::new(TokenAmount::from_atto(1000), 10_000, 1000, TokenAmount::from_atto(500)),
        };
        let mut deal = ClientDealState::new(
            proposal,
            PeerId::new("provider"),
            TokenAmount::from_atto(20_000_000),
            Address::new_id(100),
            Address::new_id(101),
        );
        deal.status = status;
        deal
    }

    fn apply(deal: &mut ClientDealState, event: ClientEvent) -> Option<DealStatus> {
        let table = client_table();
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
        client_table().validate().unwrap();
        assert!(client_table().kinds().contains(&ClientEvent::Restart.kind()));
    }

    #[test]
    fn unseal_payment_comes_before_byte_payments() {
        let mut d = deal(DealStatus::FundsNeeded);
        d.total_received = 0;
        apply(&mut d, ClientEvent::PaymentSent(TokenAmount::from_atto(500)));
        assert_eq!(d.status, DealStatus::Ongoing);
        assert_eq!(d.unseal_funds_paid, TokenAmount::from_atto(500));
        assert_eq!(d.current_interval, 10_000);
        assert_eq!(d.bytes_paid_for, 0);

        d.status = DealStatus::FundsNeeded;
        d.total_received = 10_136;
        apply(&mut d, ClientEvent::PaymentSent(TokenAmount::from_atto(10_136_000)));
        assert_eq!(d.funds_spent, TokenAmount::from_atto(10_136_500));
        assert_eq!(d.bytes_paid_for, 10_136);
        assert_eq!(d.current_interval, 11_000);
        assert!(d.payment_requested.is_zero());
    }

    #[test]
    fn cancel_and_errors_route_to_sinks() {
        let mut d = deal(DealStatus::Ongoing);
        assert_eq!(apply(&mut d, ClientEvent::Cancel), Some(DealStatus::Cancelling));
        assert_eq!(d.message, "Retrieval Cancelled");
        // Late events from a cancelled deal leave it cancelling.
        assert_eq!(apply(&mut d, ClientEvent::Error("read failed".into())), Some(DealStatus::Cancelling));
        assert_eq!(d.message, "Retrieval Cancelled");
        assert_eq!(apply(&mut d, ClientEvent::CancelComplete), Some(DealStatus::Cancelled));
        assert_eq!(apply(&mut d, ClientEvent::Cancel), None);

        let mut d = deal(DealStatus::FundsNeeded);
        assert_eq!(
            apply(&mut d, ClientEvent::BadPaymentRequested("too much money requested for bytes sent".into())),
            Some(DealStatus::Failing)
        );
        assert_eq!(apply(&mut d, ClientEvent::CancelComplete), Some(DealStatus::Errored));
        assert_eq!(d.message, "too much money requested for bytes sent");
    }

    #[test]
    fn recheck_tops_up_total_funds() {
        let mut d = deal(DealStatus::InsufficientFunds);
        d.funds_spent = TokenAmount::from_atto(1000);
        d.last_payment_requested = true;
        assert_eq!(apply(&mut d, ClientEvent::RecheckFunds), Some(DealStatus::CheckFunds));
        assert_eq!(
            apply(&mut d, ClientEvent::FundsAvailableLastPayment(TokenAmount::from_atto(5000))),
            Some(DealStatus::FundsNeededLastPayment)
        );
        assert_eq!(d.total_funds, TokenAmount::from_atto(6000));
    }
}
