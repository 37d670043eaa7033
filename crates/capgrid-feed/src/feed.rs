//! Append-only event feed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use capgrid_state::{Event, EventKind, StateResult, StateStore, epoch_secs};
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 1024;

/// Publishes state transitions. Cloning shares the same channel and counters.
#[derive(Clone)]
pub struct EventFeed {
    state: StateStore,
    tx: broadcast::Sender<Event>,
    counters: Arc<Mutex<BTreeMap<&'static str, u64>>>,
}

impl EventFeed {
    pub fn new(state: StateStore) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state,
            tx,
            counters: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Persist an event and fan it out. Each call yields exactly one entry.
    pub fn emit(&self, kind: EventKind) -> StateResult<Event> {
        self.emit_at(kind, epoch_secs())
    }

    pub fn emit_at(&self, kind: EventKind, at: u64) -> StateResult<Event> {
        let event = self.state.append_event(kind, at)?;
        *self
            .counters
            .lock()
            .expect("counters lock")
            .entry(event.kind.name())
            .or_insert(0) += 1;

        info!(seq = event.seq, event = event.kind.name(), "event emitted");
        if self.tx.send(event.clone()).is_err() {
            debug!(seq = event.seq, "no live subscribers");
        }
        Ok(event)
    }

    /// Replay persisted events with `seq > since`.
    pub fn since(&self, since: u64, limit: usize) -> StateResult<Vec<Event>> {
        self.state.events_since(since, limit)
    }

    pub fn last_seq(&self) -> StateResult<u64> {
        self.state.last_event_seq()
    }

    /// Live stream of events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Events emitted by this process, by kind.
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        self.counters.lock().expect("counters lock").clone()
    }
}
