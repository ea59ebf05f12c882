// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Future;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::blockstore::SharedBlockstore;
use crate::fsm::context::{ErrorEvent, FsmContext, Tracker};
use crate::fsm::table::{Destination, EventTable};
use crate::fsm::{DealRecord, FsmEvent};
use crate::statestore::{Migration, MigrationReport, StateStore};
use crate::util::pubsub::{Subscribers, Unsubscribe};
use crate::{deal_error, DealError, ErrorKind};

type EntryFn<R, E, Env> =
    Arc<dyn Fn(FsmContext<R, E>, Arc<Env>, R) -> BoxFuture<'static, Result<(), DealError>> + Send + Sync>;

/// A state change as seen by subscribers: the event and the record after it was applied.
pub type Notification<R, E> = (E, R);

/// Everything that defines one deal state machine: its transition table, the entry action
/// for each state, and the states a deal never leaves.
pub struct FsmDefinition<R: DealRecord, E: FsmEvent, Env> {
    name: &'static str,
    table: EventTable<R, E>,
    entries: HashMap<R::Status, EntryFn<R, E, Env>>,
    finality: Vec<R::Status>,
    on_error: Option<ErrorEvent<E>>,
}

impl<R: DealRecord, E: FsmEvent, Env: Send + Sync + 'static> FsmDefinition<R, E, Env> {
    pub fn new(name: &'static str, table: EventTable<R, E>) -> Self {
        Self { name, table, entries: HashMap::new(), finality: Vec::new(), on_error: None }
    }

    /// Registers the action run whenever a deal enters `status`.
    pub fn on_entry<F, Fut>(mut self, status: R::Status, f: F) -> Self
    where
        F: Fn(FsmContext<R, E>, Arc<Env>, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DealError>> + Send + 'static,
    {
        self.entries.insert(status, Arc::new(move |ctx, env, deal| Box::pin(f(ctx, env, deal))));
        self
    }

    pub fn finality_states(mut self, states: impl IntoIterator<Item = R::Status>) -> Self {
        self.finality = states.into_iter().collect();
        self
    }

    /// Sets the event dispatched when an entry action returns an error, or finishes without
    /// dispatching anything.
    pub fn on_entry_error<F>(mut self, f: F) -> Self
    where
        F: Fn(DealError) -> E + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn is_final(&self, status: &R::Status) -> bool {
        self.finality.contains(status)
    }
}

pub(crate) enum Command<R: DealRecord, E: FsmEvent> {
    Begin { record: R, reply: oneshot::Sender<Result<(), DealError>> },
    Send { key: R::Key, event: E, reply: Option<oneshot::Sender<Result<(), DealError>>>, escalated: bool },
    Barrier { reply: oneshot::Sender<()> },
    Stop { grace: Duration },
}

/// Runs every deal of one role and market.
///
/// All record mutations go through a single dispatch loop fed by an ordered queue, so events
/// for one deal apply strictly in submission order and a record is never written by two tasks
/// at once. Entry actions run as separate tasks and report back by queueing events.
pub struct StateGroup<R: DealRecord, E: FsmEvent> {
    name: &'static str,
    store: Arc<StateStore<SharedBlockstore, R::Key, R>>,
    sender: mpsc::UnboundedSender<Command<R, E>>,
    stopped: watch::Receiver<bool>,
    finality: Arc<Vec<R::Status>>,
    subscribers: Subscribers<Notification<R, E>>,
}

impl<R: DealRecord, E: FsmEvent> Clone for StateGroup<R, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            store: self.store.clone(),
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
            finality: self.finality.clone(),
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<R: DealRecord, E: FsmEvent> StateGroup<R, E> {
    /// Validates the definition and spawns the dispatch loop on the current tokio runtime.
    pub fn new<Env: Send + Sync + 'static>(
        definition: FsmDefinition<R, E, Env>,
        env: Arc<Env>,
        store: StateStore<SharedBlockstore, R::Key, R>,
    ) -> Result<Self, DealError> {
        definition
            .table
            .validate()
            .map_err(|e| e.wrap(format!("invalid state machine '{}'", definition.name)))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let (stopped_tx, stopped) = watch::channel(false);
        let store = Arc::new(store);
        let subscribers = Subscribers::new();
        let finality = Arc::new(definition.finality.clone());
        let name = definition.name;

        let dispatcher = Dispatcher {
            definition,
            env,
            store: store.clone(),
            sender: sender.clone(),
            subscribers: subscribers.clone(),
            tasks: JoinSet::new(),
            stopping: false,
        };
        tokio::spawn(dispatcher.run(receiver, stopped_tx));

        Ok(Self { name, store, sender, stopped, finality, subscribers })
    }

    /// Starts tracking a new deal. Fails with `AlreadyExists` if the key is taken.
    pub async fn begin(&self, record: R) -> Result<(), DealError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Begin { record, reply })?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Queues an event for a deal. Returns once the event has been applied, with an error if
    /// no transition matched or the action failed; the entry action it triggers may still be
    /// running.
    pub async fn send(&self, key: R::Key, event: E) -> Result<(), DealError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Send { key, event, reply: Some(reply), escalated: false })?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Snapshot of a deal.
    pub fn get(&self, key: &R::Key) -> Result<R, DealError> {
        self.store.get(key)?.ok_or_else(
            || deal_error!(not_found; "no deal {:?} in state group '{}'", key, self.name),
        )
    }

    /// Snapshot of a deal taken after every event queued before the call has been applied.
    pub async fn get_sync(&self, key: &R::Key) -> Result<R, DealError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Barrier { reply })?;
        rx.await.map_err(|_| self.gone())?;
        self.get(key)
    }

    pub fn has(&self, key: &R::Key) -> Result<bool, DealError> {
        self.store.has(key)
    }

    pub fn list(&self) -> Result<Vec<R>, DealError> {
        Ok(self.store.list()?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn is_final(&self, status: &R::Status) -> bool {
        self.finality.contains(status)
    }

    /// Whether the deal has reached a finality state.
    pub fn is_terminated(&self, key: &R::Key) -> Result<bool, DealError> {
        Ok(self.is_final(&self.get(key)?.status()))
    }

    /// Deals not yet in a finality state.
    pub fn active(&self) -> Result<Vec<R>, DealError> {
        Ok(self.list()?.into_iter().filter(|d| !self.is_final(&d.status())).collect())
    }

    pub fn migrate(&self, migrations: &[Migration]) -> Result<MigrationReport, DealError> {
        self.store.migrate(migrations)
    }

    pub fn subscribe<F>(&self, f: F) -> Unsubscribe<Notification<R, E>>
    where
        F: Fn(&Notification<R, E>) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(f)
    }

    /// Stops the dispatch loop. In-flight entry actions get `grace` to finish, and the events
    /// they queue are still applied; anything left after that is aborted.
    pub async fn stop(&self, grace: Duration) -> Result<(), DealError> {
        // A closed queue means the loop is already gone.
        let _ = self.sender.send(Command::Stop { grace });
        let mut stopped = self.stopped.clone();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn submit(&self, cmd: Command<R, E>) -> Result<(), DealError> {
        self.sender.send(cmd).map_err(|_| self.gone())
    }

    fn gone(&self) -> DealError {
        deal_error!(illegal_state; "state group '{}' has stopped", self.name)
    }
}

struct Dispatcher<R: DealRecord, E: FsmEvent, Env> {
    definition: FsmDefinition<R, E, Env>,
    env: Arc<Env>,
    store: Arc<StateStore<SharedBlockstore, R::Key, R>>,
    sender: mpsc::UnboundedSender<Command<R, E>>,
    subscribers: Subscribers<Notification<R, E>>,
    tasks: JoinSet<()>,
    stopping: bool,
}

impl<R: DealRecord, E: FsmEvent, Env: Send + Sync + 'static> Dispatcher<R, E, Env> {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<Command<R, E>>,
        stopped: watch::Sender<bool>,
    ) {
        let mut deadline: Option<tokio::time::Instant> = None;
        loop {
            if self.stopping && self.tasks.is_empty() {
                break;
            }
            let sleep_until = deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                cmd = receiver.recv() => match cmd {
                    Some(Command::Stop { grace }) => {
                        if !self.stopping {
                            info!("stopping state group '{}' with {} running actions", self.definition.name, self.tasks.len());
                            self.stopping = true;
                            deadline = Some(tokio::time::Instant::now() + grace);
                        }
                    }
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!("entry action in state group '{}' panicked: {}", self.definition.name, e);
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    warn!("aborting {} entry actions of state group '{}' after grace period",
                        self.tasks.len(), self.definition.name);
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                }
            }
        }
        // Apply whatever the finished actions queued before shutting down.
        while let Ok(cmd) = receiver.try_recv() {
            if !matches!(cmd, Command::Stop { .. }) {
                self.handle(cmd);
            }
        }
        debug!("state group '{}' stopped", self.definition.name);
        let _ = stopped.send(true);
    }

    fn handle(&mut self, cmd: Command<R, E>) {
        match cmd {
            Command::Begin { record, reply } => {
                let res = self.store.begin(&record.key(), &record);
                if let Err(e) = &res {
                    debug!("state group '{}': begin {:?} failed: {}", self.definition.name, record.key(), e);
                }
                let _ = reply.send(res);
            }
            Command::Send { key, event, reply, escalated } => {
                let res = self.apply(&key, event.clone());
                if let Err(e) = &res {
                    match &reply {
                        Some(_) => warn!(
                            "state group '{}': deal {:?} rejected {:?}: {}",
                            self.definition.name, key, event.kind(), e
                        ),
                        None => error!(
                            "state group '{}': deal {:?} could not apply {:?}: {}",
                            self.definition.name, key, event.kind(), e
                        ),
                    }
                    // An event an entry action dispatched must not vanish silently.
                    if reply.is_none() && !escalated && e.kind() != ErrorKind::NotFound {
                        if let Some(on_error) = &self.definition.on_error {
                            let failure = on_error(e.clone());
                            let _ = self.sender.send(Command::Send {
                                key: key.clone(),
                                event: failure,
                                reply: None,
                                escalated: true,
                            });
                        }
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(res);
                }
            }
            Command::Barrier { reply } => {
                let _ = reply.send(());
            }
            Command::Stop { .. } => {}
        }
    }

    fn apply(&mut self, key: &R::Key, event: E) -> Result<(), DealError> {
        let table = &self.definition.table;
        let (enter, record) = self.store.mutate(key, |record| {
            let status = record.status();
            let (dest, action) = table.lookup(status, &event).ok_or_else(|| {
                deal_error!(illegal_state; "no transition for event {:?} from state {:?}", event.kind(), status)
            })?;
            if let Some(action) = action {
                action(record, &event)?;
            }
            let enter = match dest {
                Destination::State(next) => {
                    record.set_status(next);
                    true
                }
                Destination::NoChange => true,
                Destination::JustRecord => false,
            };
            debug!("deal {:?}: {:?} via {:?} -> {}", key, status, event.kind(), dest);
            Ok((enter, record.clone()))
        })?;

        self.subscribers.publish(&(event, record.clone()));
        if enter {
            self.enter(record);
        }
        Ok(())
    }

    fn enter(&mut self, record: R) {
        if self.stopping {
            return;
        }
        let Some(entry) = self.definition.entries.get(&record.status()).cloned() else {
            return;
        };
        let tracker = Tracker::new(record.key(), self.sender.clone(), self.definition.on_error.clone());
        let ctx = FsmContext::new(tracker.clone());
        let fut = entry(ctx, self.env.clone(), record);
        self.tasks.spawn(async move {
            let res = fut.await;
            tracker.action_finished(res);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fvm_ipld_encoding::tuple::*;
    use num_derive::FromPrimitive;
    use serde_repr::{Deserialize_repr, Serialize_repr};

    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use crate::datastore::{Datastore, MemoryDatastore};
    use crate::deal_events;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, Serialize_repr, Deserialize_repr)]
    #[repr(u8)]
    enum Light {
        Off = 0,
        Warming = 1,
        On = 2,
        Broken = 3,
        Recycled = 4,
    }

    #[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq, Eq)]
    struct Lamp {
        id: u64,
        status: Light,
        watts: u64,
        flips: u64,
        message: String,
    }

    impl DealRecord for Lamp {
        type Key = u64;
        type Status = Light;
        fn key(&self) -> u64 {
            self.id
        }
        fn status(&self) -> Light {
            self.status
        }
        fn set_status(&mut self, status: Light) {
            self.status = status
        }
    }

    deal_events! {
        enum LampEvent / LampEventKind {
            SwitchOn(u64),
            WarmedUp,
            Flicker,
            Note(String),
            Fail(String),
            Recycle,
        }
    }

    #[derive(Default)]
    struct LampEnv {
        warmups: Mutex<u64>,
        fail_warmup: bool,
        silent_warmup: bool,
    }

    async fn warm_up(
        ctx: FsmContext<Lamp, LampEvent>,
        env: Arc<LampEnv>,
        _lamp: Lamp,
    ) -> Result<(), DealError> {
        *env.warmups.lock().unwrap() += 1;
        if env.fail_warmup {
            return Err(DealError::illegal_state("filament missing".into()));
        }
        if env.silent_warmup {
            return Ok(());
        }
        ctx.trigger(LampEvent::WarmedUp)
    }

    fn table() -> EventTable<Lamp, LampEvent> {
        EventTable::new()
            .event(LampEventKind::SwitchOn)
            .from(Light::Off)
            .to(Light::Warming)
            .action(|lamp: &mut Lamp, ev: &LampEvent| {
                if let LampEvent::SwitchOn(w) = ev {
                    lamp.watts = *w;
                }
                lamp.flips += 1;
                Ok(())
            })
            .event(LampEventKind::WarmedUp)
            .from(Light::Warming)
            .to(Light::On)
            .event(LampEventKind::Flicker)
            .from(Light::Warming)
            .to_no_change()
            .from(Light::On)
            .to_just_record()
            .action(|lamp, _| {
                lamp.flips += 1;
                Ok(())
            })
            .event(LampEventKind::Note)
            .from_any()
            .to_just_record()
            .action(|lamp, ev| {
                if let LampEvent::Note(n) = ev {
                    lamp.message = n.clone();
                }
                Ok(())
            })
            .event(LampEventKind::Fail)
            .from_many([Light::Off, Light::Warming, Light::On])
            .to(Light::Broken)
            .action(|lamp, ev| {
                if let LampEvent::Fail(msg) = ev {
                    lamp.message = msg.clone();
                }
                Ok(())
            })
            .event(LampEventKind::Recycle)
            .from(Light::Broken)
            .to(Light::Recycled)
    }

    fn group(env: LampEnv) -> (StateGroup<Lamp, LampEvent>, Arc<LampEnv>) {
        let env = Arc::new(env);
        let bs = SharedBlockstore::new(MemoryBlockstore::new());
        let store = StateStore::open(bs, MemoryDatastore::shared(), "lamps", 1).unwrap();
        let def = FsmDefinition::new("lamps", table())
            .on_entry(Light::Warming, warm_up)
            .finality_states([Light::Broken, Light::Recycled])
            .on_entry_error(|e| LampEvent::Fail(e.msg().to_string()));
        (StateGroup::new(def, env.clone(), store).unwrap(), env)
    }

    fn lamp(id: u64) -> Lamp {
        Lamp { id, status: Light::Off, watts: 0, flips: 0, message: String::new() }
    }

    async fn settle(g: &StateGroup<Lamp, LampEvent>, id: u64, want: Light) -> Lamp {
        for _ in 0..200 {
            let l = g.get_sync(&id).await.unwrap();
            if l.status == want {
                return l;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lamp {} never reached {:?}: {:?}", id, want, g.get(&id).unwrap());
    }

    #[tokio::test]
    async fn entry_action_drives_next_transition() {
        let (g, _) = group(LampEnv::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = g.subscribe(move |(ev, l): &Notification<Lamp, LampEvent>| {
            s.lock().unwrap().push((ev.kind(), l.status))
        });

        g.begin(lamp(1)).await.unwrap();
        g.send(1, LampEvent::SwitchOn(60)).await.unwrap();
        let l = settle(&g, 1, Light::On).await;
        assert_eq!(l.watts, 60);
        assert_eq!(l.flips, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(LampEventKind::SwitchOn, Light::Warming), (LampEventKind::WarmedUp, Light::On)]
        );
    }

    #[tokio::test]
    async fn duplicate_begin_and_unknown_event_are_errors() {
        let (g, _) = group(LampEnv::default());
        g.begin(lamp(1)).await.unwrap();
        assert_eq!(g.begin(lamp(1)).await.unwrap_err().kind(), ErrorKind::AlreadyExists);

        let err = g.send(1, LampEvent::Recycle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(g.get(&1).unwrap().status, Light::Off);
        assert_eq!(g.send(9, LampEvent::Recycle).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn no_change_reruns_entry_but_just_record_does_not() {
        let (g, env) = group(LampEnv { silent_warmup: false, ..Default::default() });
        g.begin(lamp(1)).await.unwrap();
        g.send(1, LampEvent::SwitchOn(40)).await.unwrap();
        settle(&g, 1, Light::On).await;
        assert_eq!(*env.warmups.lock().unwrap(), 1);

        g.send(1, LampEvent::Flicker).await.unwrap();
        g.send(1, LampEvent::Note("hello".into())).await.unwrap();
        let l = g.get_sync(&1).await.unwrap();
        assert_eq!((l.status, l.flips, l.message.as_str()), (Light::On, 2, "hello"));
        assert_eq!(*env.warmups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_entry_action_fails_the_deal() {
        let (g, _) = group(LampEnv { fail_warmup: true, ..Default::default() });
        g.begin(lamp(2)).await.unwrap();
        g.send(2, LampEvent::SwitchOn(10)).await.unwrap();
        let l = settle(&g, 2, Light::Broken).await;
        assert_eq!(l.message, "filament missing");
        assert!(g.is_final(&l.status));
        assert!(g.is_terminated(&2).unwrap());
        assert!(g.active().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_entry_action_is_caught() {
        let (g, _) = group(LampEnv { silent_warmup: true, ..Default::default() });
        g.begin(lamp(3)).await.unwrap();
        g.send(3, LampEvent::SwitchOn(10)).await.unwrap();
        let l = settle(&g, 3, Light::Broken).await;
        assert!(l.message.contains("without dispatching"));
    }

    #[tokio::test]
    async fn records_persist_across_groups() {
        let bs = SharedBlockstore::new(MemoryBlockstore::new());
        let ds: Arc<dyn Datastore> = MemoryDatastore::shared();
        {
            let store = StateStore::open(bs.clone(), ds.clone(), "lamps", 1).unwrap();
            let def = FsmDefinition::new("lamps", table()).on_entry(Light::Warming, warm_up);
            let g = StateGroup::new(def, Arc::new(LampEnv::default()), store).unwrap();
            g.begin(lamp(5)).await.unwrap();
            g.send(5, LampEvent::SwitchOn(25)).await.unwrap();
            settle(&g, 5, Light::On).await;
            g.stop(Duration::from_secs(1)).await.unwrap();
            assert!(g.begin(lamp(6)).await.is_err());
        }
        let store = StateStore::open(bs, ds, "lamps", 1).unwrap();
        let def = FsmDefinition::new("lamps", table());
        let g = StateGroup::new(def, Arc::new(LampEnv::default()), store).unwrap();
        let l = g.get(&5).unwrap();
        assert_eq!((l.status, l.watts), (Light::On, 25));
    }

    #[test]
    fn incomplete_tables_are_rejected() {
        let t: EventTable<Lamp, LampEvent> =
            EventTable::new().event(LampEventKind::WarmedUp).from(Light::Warming);
        assert!(t.validate().is_err());
        let t: EventTable<Lamp, LampEvent> = EventTable::new().event(LampEventKind::Recycle).to(Light::Off);
        assert!(t.validate().is_err());
        assert!(table().validate().is_ok());
    }
}
