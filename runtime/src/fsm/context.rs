// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, Mutex};

use log::{error, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::fsm::group::Command;
use crate::fsm::{DealRecord, FsmEvent};
use crate::{deal_error, DealError};

/// Converts an error that escaped an entry action into the event that fails the deal.
pub type ErrorEvent<E> = Arc<dyn Fn(DealError) -> E + Send + Sync>;

#[derive(Default)]
struct Dispatch {
    triggered: bool,
    dropped: bool,
    action_done: bool,
}

/// Shared between an entry action's context and the task running the action, so that exactly
/// one follow-up event leaves every entry.
pub(crate) struct Tracker<R: DealRecord, E: FsmEvent> {
    key: R::Key,
    sender: UnboundedSender<Command<R, E>>,
    on_error: Option<ErrorEvent<E>>,
    state: Mutex<Dispatch>,
}

impl<R: DealRecord, E: FsmEvent> Tracker<R, E> {
    pub(crate) fn new(
        key: R::Key,
        sender: UnboundedSender<Command<R, E>>,
        on_error: Option<ErrorEvent<E>>,
    ) -> Arc<Self> {
        Arc::new(Self { key, sender, on_error, state: Mutex::new(Dispatch::default()) })
    }

    fn send(&self, event: E, escalated: bool) -> Result<(), DealError> {
        self.sender
            .send(Command::Send { key: self.key.clone(), event, reply: None, escalated })
            .map_err(|_| deal_error!(illegal_state; "state group for deal {:?} has stopped", self.key))
    }

    fn fail(&self, err: DealError) {
        match &self.on_error {
            Some(on_error) => {
                if let Err(e) = self.send(on_error(err), true) {
                    warn!("could not fail deal {:?}: {}", self.key, e);
                }
            }
            None => error!("deal {:?} is stuck: {}", self.key, err),
        }
    }

    /// Called by the runner once the entry future resolves.
    pub(crate) fn action_finished(&self, result: Result<(), DealError>) {
        let escalate = {
            let Ok(mut st) = self.state.lock() else { return };
            st.action_done = true;
            match result {
                Err(e) if !st.triggered => {
                    st.triggered = true;
                    Some(e)
                }
                Err(e) => {
                    warn!("deal {:?}: entry action failed after dispatching: {}", self.key, e);
                    None
                }
                Ok(()) if st.dropped && !st.triggered => {
                    st.triggered = true;
                    Some(deal_error!(illegal_state; "entry action finished without dispatching an event"))
                }
                Ok(()) => None,
            }
        };
        if let Some(e) = escalate {
            error!("deal {:?}: {}", self.key, e);
            self.fail(e);
        }
    }
}

/// Handle given to an entry action for dispatching its follow-up event.
///
/// Consumed by [`FsmContext::trigger`]. If the context is dropped without triggering and the
/// entry action has already returned, the deal is failed through the definition's error event
/// rather than left in place.
pub struct FsmContext<R: DealRecord, E: FsmEvent> {
    tracker: Arc<Tracker<R, E>>,
}

impl<R: DealRecord, E: FsmEvent> FsmContext<R, E> {
    pub(crate) fn new(tracker: Arc<Tracker<R, E>>) -> Self {
        Self { tracker }
    }

    pub fn key(&self) -> &R::Key {
        &self.tracker.key
    }

    /// Queues `event` for this deal.
    pub fn trigger(self, event: E) -> Result<(), DealError> {
        {
            let mut st = self
                .tracker
                .state
                .lock()
                .map_err(|_| deal_error!(illegal_state; "fsm context lock poisoned"))?;
            if st.triggered {
                warn!("deal {:?}: dropping {:?}, follow-up already dispatched", self.key(), event);
                return Ok(());
            }
            st.triggered = true;
        }
        self.tracker.send(event, false)
    }
}

impl<R: DealRecord, E: FsmEvent> Drop for FsmContext<R, E> {
    fn drop(&mut self) {
        let escalate = match self.tracker.state.lock() {
            Ok(mut st) => {
                st.dropped = true;
                if st.action_done && !st.triggered {
                    st.triggered = true;
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };
        if escalate {
            let e = deal_error!(illegal_state; "event callback dropped without dispatching an event");
            error!("deal {:?}: {}", self.tracker.key, e);
            self.tracker.fail(e);
        }
    }
}
