//! StreamHub: fan one unit's token stream out to many subscribers.
//!
//! Every unit keeps its event history while open, so a subscriber attaching late
//! replays the history and continues with live events under a single lock: no gap,
//! no duplicate. Each subscriber owns a bounded queue; publishing never waits, and a
//! subscriber whose queue is full is detached alone and sees an `overflow` terminal.

use crate::error::StreamError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Live events a subscriber may fall behind before it is dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.subscriber_buffer == 0 {
            return Err("subscriber_buffer must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Terminal status of a unit stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Ok,
    Error(String),
    Cancelled,
    /// Only ever seen by the subscriber that fell behind.
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub unit_id: String,
    pub seq: u64,
    /// Provider attempt that produced `delta`; a change means earlier text was abandoned.
    pub attempt: u32,
    pub delta: String,
    pub terminal: Option<Terminal>,
}

struct SubscriberSlot {
    tx: mpsc::Sender<StreamEvent>,
    overflowed: Arc<AtomicBool>,
}

struct UnitState {
    history: Vec<StreamEvent>,
    subscribers: Vec<SubscriberSlot>,
    next_seq: u64,
    attempt: u32,
    closed: bool,
}

struct UnitStream {
    unit_id: String,
    state: Mutex<UnitState>,
}

impl UnitStream {
    fn attach(&self, state: &mut UnitState, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel((state.history.len() + buffer).max(1));
        for event in &state.history {
            // Capacity covers the whole history.
            let _ = tx.try_send(event.clone());
        }
        let overflowed = Arc::new(AtomicBool::new(false));
        state.subscribers.push(SubscriberSlot {
            tx,
            overflowed: overflowed.clone(),
        });
        Subscription {
            unit_id: self.unit_id.clone(),
            rx,
            overflowed,
            last_seq: 0,
            last_attempt: state.attempt,
            done: false,
        }
    }
}

struct HubInner {
    units: Mutex<HashMap<String, Arc<UnitStream>>>,
    taps: Mutex<Vec<mpsc::UnboundedSender<Subscription>>>,
    buffer: usize,
    dropped: AtomicUsize,
}

/// Cloneable handle to the hub.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

impl StreamHub {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                units: Mutex::new(HashMap::new()),
                taps: Mutex::new(Vec::new()),
                buffer: config.subscriber_buffer,
                dropped: AtomicUsize::new(0),
            }),
        }
    }

    /// Open the stream for `unit_id`. Every active tap is attached before the
    /// publisher is handed out.
    pub fn open(&self, unit_id: &str) -> Result<Publisher, StreamError> {
        let unit = Arc::new(UnitStream {
            unit_id: unit_id.to_string(),
            state: Mutex::new(UnitState {
                history: Vec::new(),
                subscribers: Vec::new(),
                next_seq: 1,
                attempt: 1,
                closed: false,
            }),
        });
        {
            let mut units = self.inner.units.lock();
            if units.contains_key(unit_id) {
                return Err(StreamError::AlreadyOpen(unit_id.to_string()));
            }
            units.insert(unit_id.to_string(), unit.clone());
        }
        {
            let mut taps = self.inner.taps.lock();
            let mut state = unit.state.lock();
            taps.retain(|tap| tap.send(unit.attach(&mut state, self.inner.buffer)).is_ok());
        }
        debug!(unit_id, "Stream opened");
        Ok(Publisher {
            hub: self.inner.clone(),
            unit,
            closed: false,
        })
    }

    pub fn subscribe(&self, unit_id: &str) -> Result<Subscription, StreamError> {
        let unit = self
            .inner
            .units
            .lock()
            .get(unit_id)
            .cloned()
            .ok_or_else(|| StreamError::UnknownUnit(unit_id.to_string()))?;
        let mut state = unit.state.lock();
        if state.closed {
            return Err(StreamError::UnknownUnit(unit_id.to_string()));
        }
        Ok(unit.attach(&mut state, self.inner.buffer))
    }

    /// Receive a subscription for every unit opened from now on.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.taps.lock().push(tx);
        rx
    }

    pub fn is_open(&self, unit_id: &str) -> bool {
        self.inner.units.lock().contains_key(unit_id)
    }

    pub fn open_units(&self) -> Vec<String> {
        let mut units: Vec<String> = self.inner.units.lock().keys().cloned().collect();
        units.sort();
        units
    }

    /// Subscribers dropped for falling behind since the hub was created.
    pub fn dropped_subscribers(&self) -> usize {
        self.inner.dropped.load(Ordering::SeqCst)
    }
}

/// Producer side of one unit stream.
pub struct Publisher {
    hub: Arc<HubInner>,
    unit: Arc<UnitStream>,
    closed: bool,
}

impl Publisher {
    pub fn unit_id(&self) -> &str {
        &self.unit.unit_id
    }

    /// Mark the start of provider attempt `attempt`.
    pub fn begin_attempt(&self, attempt: u32) {
        self.unit.state.lock().attempt = attempt;
    }

    /// Publish one token delta and return its sequence number.
    pub fn publish(&self, delta: impl Into<String>) -> u64 {
        self.deliver(delta.into(), None)
    }

    pub fn close(mut self, terminal: Terminal) {
        self.finish(terminal);
    }

    fn deliver(&self, delta: String, terminal: Option<Terminal>) -> u64 {
        let mut state = self.unit.state.lock();
        let event = StreamEvent {
            unit_id: self.unit.unit_id.clone(),
            seq: state.next_seq,
            attempt: state.attempt,
            delta,
            terminal,
        };
        state.next_seq += 1;

        let hub = &self.hub;
        let unit_id = &self.unit.unit_id;
        state.subscribers.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                slot.overflowed.store(true, Ordering::SeqCst);
                hub.dropped.fetch_add(1, Ordering::SeqCst);
                warn!(unit_id = %unit_id, seq = event.seq, "Subscriber overflowed, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let seq = event.seq;
        state.history.push(event);
        seq
    }

    fn finish(&mut self, terminal: Terminal) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(unit_id = %self.unit.unit_id, terminal = ?terminal, "Stream closed");
        self.deliver(String::new(), Some(terminal));
        {
            let mut state = self.unit.state.lock();
            state.closed = true;
            state.history = Vec::new();
            state.subscribers.clear();
        }
        let mut units = self.hub.units.lock();
        if units
            .get(&self.unit.unit_id)
            .map_or(false, |current| Arc::ptr_eq(current, &self.unit))
        {
            units.remove(&self.unit.unit_id);
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if !self.closed {
            self.finish(Terminal::Error("publisher dropped without closing".to_string()));
        }
    }
}

/// Consumer side of one unit stream.
pub struct Subscription {
    unit_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    overflowed: Arc<AtomicBool>,
    last_seq: u64,
    last_attempt: u32,
    done: bool,
}

impl Subscription {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Next event, or `None` after the terminal event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                self.last_seq = event.seq;
                self.last_attempt = event.attempt;
                if event.terminal.is_some() {
                    self.done = true;
                }
                Some(event)
            }
            None => {
                self.done = true;
                if self.overflowed.load(Ordering::SeqCst) {
                    Some(StreamEvent {
                        unit_id: self.unit_id.clone(),
                        seq: self.last_seq + 1,
                        attempt: self.last_attempt,
                        delta: String::new(),
                        terminal: Some(Terminal::Overflow),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Drain to the terminal event and return the text of the final attempt.
    pub async fn collect_text(mut self) -> (String, Option<Terminal>) {
        let mut text = String::new();
        let mut attempt = 0;
        while let Some(event) = self.next().await {
            if event.attempt != attempt {
                attempt = event.attempt;
                text.clear();
            }
            text.push_str(&event.delta);
            if event.terminal.is_some() {
                return (text, event.terminal);
            }
        }
        (text, None)
    }
}
