// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Debug;
use std::sync::Arc;

use crate::fsm::{DealRecord, FsmEvent};
use crate::{deal_error, DealError};

/// Which current states a transition clause applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sources<S> {
    Any,
    Many(Vec<S>),
}

impl<S: PartialEq> Sources<S> {
    fn matches(&self, status: &S) -> bool {
        match self {
            Sources::Any => true,
            Sources::Many(states) => states.contains(status),
        }
    }
}

/// Where a matching clause takes the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination<S> {
    /// Move to the state and run its entry action.
    State(S),
    /// Stay in the current state and run its entry action again.
    NoChange,
    /// Persist the action's changes only. No entry action runs.
    JustRecord,
}

/// Mutates a record with an event's arguments.
pub type Action<R, E> = Arc<dyn Fn(&mut R, &E) -> Result<(), DealError> + Send + Sync>;

struct Rule<R: DealRecord, E: FsmEvent> {
    kind: E::Kind,
    clauses: Vec<(Sources<R::Status>, Destination<R::Status>)>,
    pending: Option<Sources<R::Status>>,
    dangling: bool,
    action: Option<Action<R, E>>,
}

/// Declarative transition table: for each event kind, an ordered list of
/// (source states, destination) clauses and an optional action.
///
/// ```ignore
/// EventTable::new()
///     .event(Kind::Open).from(Status::New).to(Status::Accepted)
///     .event(Kind::Cancel).from_any().to(Status::Cancelling)
///     .action(|deal, _| { deal.message = "cancelled".into(); Ok(()) })
/// ```
///
/// Lookups are first-match-wins over rules in declaration order, then clauses in order.
pub struct EventTable<R: DealRecord, E: FsmEvent> {
    rules: Vec<Rule<R, E>>,
}

impl<R: DealRecord, E: FsmEvent> Default for EventTable<R, E> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<R: DealRecord, E: FsmEvent> EventTable<R, E> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Starts the rule for an event kind.
    pub fn event(mut self, kind: E::Kind) -> Self {
        self.rules.push(Rule {
            kind,
            clauses: Vec::new(),
            pending: None,
            dangling: false,
            action: None,
        });
        self
    }

    pub fn from(self, status: R::Status) -> Self {
        self.with_sources(Sources::Many(vec![status]))
    }

    pub fn from_many(self, statuses: impl IntoIterator<Item = R::Status>) -> Self {
        self.with_sources(Sources::Many(statuses.into_iter().collect()))
    }

    pub fn from_any(self) -> Self {
        self.with_sources(Sources::Any)
    }

    pub fn to(self, status: R::Status) -> Self {
        self.with_destination(Destination::State(status))
    }

    pub fn to_no_change(self) -> Self {
        self.with_destination(Destination::NoChange)
    }

    pub fn to_just_record(self) -> Self {
        self.with_destination(Destination::JustRecord)
    }

    /// Sets the action run, before the status changes, whenever this rule matches.
    pub fn action<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut R, &E) -> Result<(), DealError> + Send + Sync + 'static,
    {
        if let Some(rule) = self.rules.last_mut() {
            rule.action = Some(Arc::new(f));
        }
        self
    }

    fn with_sources(mut self, sources: Sources<R::Status>) -> Self {
        if let Some(rule) = self.rules.last_mut() {
            rule.pending = Some(sources);
        }
        self
    }

    fn with_destination(mut self, dest: Destination<R::Status>) -> Self {
        if let Some(rule) = self.rules.last_mut() {
            if let Some(sources) = rule.pending.take() {
                rule.clauses.push((sources, dest));
            } else {
                rule.dangling = true;
            }
        }
        self
    }

    /// Finds the destination and action for `event` applied in `status`.
    pub fn lookup(
        &self,
        status: R::Status,
        event: &E,
    ) -> Option<(Destination<R::Status>, Option<&Action<R, E>>)> {
        let kind = event.kind();
        self.rules.iter().filter(|r| r.kind == kind).find_map(|rule| {
            rule.clauses
                .iter()
                .find(|(sources, _)| sources.matches(&status))
                .map(|(_, dest)| (*dest, rule.action.as_ref()))
        })
    }

    /// Checks every rule has at least one complete clause.
    pub fn validate(&self) -> Result<(), DealError> {
        let broken: Vec<String> = self
            .rules
            .iter()
            .filter(|r| r.clauses.is_empty() || r.pending.is_some() || r.dangling)
            .map(|r| format!("{:?}", r.kind))
            .collect();
        if !broken.is_empty() {
            return Err(deal_error!(illegal_state;
                "events without a complete from/to clause: {}", broken.join(", ")));
        }
        Ok(())
    }

    /// Every event kind that has a rule.
    pub fn kinds(&self) -> Vec<E::Kind> {
        self.rules.iter().map(|r| r.kind).collect()
    }
}

impl<S: Debug> std::fmt::Display for Destination<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::State(s) => write!(f, "{:?}", s),
            Destination::NoChange => write!(f, "<no change>"),
            Destination::JustRecord => write!(f, "<record only>"),
        }
    }
}
