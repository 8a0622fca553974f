//! Single-level time wheel for many short-lived delayed callbacks
//!
//! The wheel is a ring of fixed-width slots. Each entry lives in exactly one
//! slot together with the number of full revolutions it still has to wait, so
//! insert and remove are O(1) through the key index and a tick only touches
//! the entries of one slot.
//!
//! [`Ring`] is the plain data structure. [`spawn`] wraps it in a tokio task
//! that advances one slot per tick and hands every due payload to a handler;
//! callers talk to that task through a cloneable [`TimeWheelHandle`]. Handlers
//! receive the handle too, so a firing can reschedule itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry<P> {
    rounds: u64,
    payload: P,
}

/// Ring of slots keyed by opaque strings.
pub struct Ring<P> {
    slots: Vec<HashMap<String, Entry<P>>>,
    index: HashMap<String, usize>,
    cursor: usize,
    tick: Duration,
}

impl<P> Ring<P> {
    pub fn new(slots: usize, tick: Duration) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| HashMap::new()).collect(),
            index: HashMap::new(),
            cursor: 0,
            tick,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Number of ticks until an entry with `delay` is due, never less than one.
    pub fn ticks_for(&self, delay: Duration) -> u64 {
        let tick = self.tick.as_nanos().max(1);
        let ticks = delay.as_nanos().div_ceil(tick);
        (ticks as u64).max(1)
    }

    /// Schedule `key`, displacing any pending entry under the same key.
    pub fn insert(&mut self, key: String, payload: P, delay: Duration) {
        self.remove(&key);

        let ticks = self.ticks_for(delay);
        let len = self.slots.len() as u64;
        let rounds = (ticks - 1) / len;
        let slot = ((self.cursor as u64 + ticks % len) % len) as usize;

        self.index.insert(key.clone(), slot);
        self.slots[slot].insert(key, Entry { rounds, payload });
    }

    /// Cancel a pending entry. Returns its payload when one was still pending.
    pub fn remove(&mut self, key: &str) -> Option<P> {
        let slot = self.index.remove(key)?;
        self.slots[slot].remove(key).map(|entry| entry.payload)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Move the cursor one slot forward and return everything due in it.
    pub fn advance(&mut self) -> Vec<(String, P)> {
        self.cursor = (self.cursor + 1) % self.slots.len();

        let slot = std::mem::take(&mut self.slots[self.cursor]);
        let mut due = Vec::new();
        let mut pending = HashMap::with_capacity(slot.len());

        for (key, mut entry) in slot {
            if entry.rounds == 0 {
                self.index.remove(&key);
                due.push((key, entry.payload));
            } else {
                entry.rounds -= 1;
                pending.insert(key, entry);
            }
        }

        self.slots[self.cursor] = pending;
        due
    }
}

enum Command<P> {
    Add {
        key: String,
        payload: P,
        delay: Duration,
    },
    Remove {
        key: String,
    },
}

/// Cloneable handle to a running wheel.
pub struct TimeWheelHandle<P> {
    tx: mpsc::UnboundedSender<Command<P>>,
}

impl<P> Clone for TimeWheelHandle<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> TimeWheelHandle<P> {
    /// Schedule one future firing. Returns false once the wheel has stopped.
    ///
    /// The entry fires no earlier than `delay` after the wheel applies the
    /// command and at most one tick later than that.
    pub fn add(&self, key: impl Into<String>, payload: P, delay: Duration) -> bool {
        self.tx
            .send(Command::Add {
                key: key.into(),
                payload,
                delay,
            })
            .is_ok()
    }

    /// Best-effort cancel; a no-op if the key already fired or was never added.
    pub fn remove(&self, key: impl Into<String>) {
        let _ = self.tx.send(Command::Remove { key: key.into() });
    }
}

/// Callback invoked for every due entry.
pub type Handler<P> = Arc<dyn Fn(&TimeWheelHandle<P>, String, P) + Send + Sync>;

/// Start the wheel loop on the current runtime.
pub fn spawn<P>(
    slots: usize,
    tick: Duration,
    shutdown: CancellationToken,
    handler: Handler<P>,
) -> (TimeWheelHandle<P>, JoinHandle<()>)
where
    P: Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = TimeWheelHandle { tx };
    let loop_handle = handle.clone();

    let task = tokio::spawn(async move {
        let mut ring = Ring::new(slots, tick);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        // the first tick completes immediately
        ticker.tick().await;
        let mut last_tick = Instant::now();

        info!(slots, tick_ms = tick.as_millis() as u64, "time wheel started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = rx.recv() => apply(&mut ring, command, last_tick.elapsed()),
                _ = ticker.tick() => {
                    while let Ok(command) = rx.try_recv() {
                        apply(&mut ring, command, last_tick.elapsed());
                    }
                    let due = ring.advance();
                    last_tick = Instant::now();
                    for (key, payload) in due {
                        handler(&loop_handle, key, payload);
                    }
                }
            }
        }

        debug!(pending = ring.len(), "time wheel stopped");
    });

    (handle, task)
}

/// Slots are counted from the last tick, so time already spent in the
/// current slot is added to the delay.
fn apply<P>(ring: &mut Ring<P>, command: Command<P>, since_tick: Duration) {
    match command {
        Command::Add {
            key,
            payload,
            delay,
        } => ring.insert(key, payload, delay + since_tick),
        Command::Remove { key } => {
            ring.remove(&key);
        }
    }
}
