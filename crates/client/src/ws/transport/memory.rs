//! In-memory transport and manual timer.
//!
//! The connection never touches the network: the test (or a headless
//! consumer) decides when the socket opens, what the server pushes and when
//! it drops. Frames the manager sends are recorded.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use beacon_shared::Envelope;
use url::Url;

use super::{Timer, TimerHandle, Transport, TransportConnection, TransportLink};
use crate::error::TransportError;

#[derive(Default)]
struct MemoryState {
    urls: Vec<String>,
    current: Option<(u64, TransportLink)>,
    next_connection: u64,
    sent: Vec<String>,
    refuse_connects: u32,
    reject_sends: bool,
    client_closes: usize,
}

/// Scriptable transport. Clones share state, so keep one clone in the test
/// and hand another to the manager.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the manager asked for a connection.
    pub fn connect_attempts(&self) -> usize {
        self.state.borrow().urls.len()
    }

    pub fn last_url(&self) -> Option<String> {
        self.state.borrow().urls.last().cloned()
    }

    /// Whether a socket is currently handed out.
    pub fn has_connection(&self) -> bool {
        self.state.borrow().current.is_some()
    }

    /// How many times the manager closed a socket itself.
    pub fn client_closes(&self) -> usize {
        self.state.borrow().client_closes
    }

    /// Make the next `n` connect calls fail immediately.
    pub fn refuse_next_connects(&self, n: u32) {
        self.state.borrow_mut().refuse_connects = n;
    }

    /// Make `send` fail on the current and later sockets.
    pub fn reject_sends(&self, reject: bool) {
        self.state.borrow_mut().reject_sends = reject;
    }

    /// Complete the pending connection attempt.
    pub fn open(&self) {
        if let Some(link) = self.current_link() {
            link.opened();
        }
    }

    /// Push a raw text frame from the "server".
    pub fn deliver(&self, frame: &str) {
        if let Some(link) = self.current_link() {
            link.frame(frame);
        }
    }

    pub fn deliver_envelope(&self, envelope: &Envelope) {
        if let Ok(frame) = envelope.encode() {
            self.deliver(&frame);
        }
    }

    /// Drop the socket from the "server" side.
    pub fn drop_connection(&self, reason: &str) {
        let link = self.state.borrow_mut().current.take().map(|(_, link)| link);
        if let Some(link) = link {
            link.closed(Some(reason.to_string()));
        }
    }

    /// All frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.state.borrow().sent.clone()
    }

    /// Frames sent since the last call.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Sent frames decoded; frames that fail to decode are skipped.
    pub fn take_sent_envelopes(&self) -> Vec<Envelope> {
        self.take_sent()
            .iter()
            .filter_map(|frame| Envelope::decode(frame).ok())
            .collect()
    }

    fn current_link(&self) -> Option<TransportLink> {
        self.state.borrow().current.as_ref().map(|(_, link)| link.clone())
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        url: &Url,
        link: TransportLink,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let mut state = self.state.borrow_mut();
        state.urls.push(url.to_string());

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let id = state.next_connection;
        state.next_connection += 1;
        state.current = Some((id, link));

        Ok(Box::new(MemoryConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    state: Rc<RefCell<MemoryState>>,
}

impl TransportConnection for MemoryConnection {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.reject_sends {
            return Err(TransportError::Send("rejected".to_string()));
        }
        if !matches!(state.current, Some((id, _)) if id == self.id) {
            return Err(TransportError::Closed);
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(state.current, Some((id, _)) if id == self.id) {
            state.current = None;
        }
        state.client_closes += 1;
    }
}

struct Pending {
    id: u64,
    delay: Duration,
    task: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct ManualTimerState {
    next_id: u64,
    pending: Vec<Pending>,
    scheduled: Vec<Duration>,
}

/// Timer that only fires when told to.
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Rc<RefCell<ManualTimerState>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks scheduled and neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Delay of the next task that would fire.
    pub fn next_delay(&self) -> Option<Duration> {
        self.state.borrow().pending.first().map(|p| p.delay)
    }

    /// Every delay ever scheduled, in order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.state.borrow().scheduled.clone()
    }

    /// Run the oldest pending task. Returns false if there was none.
    pub fn fire_next(&self) -> bool {
        let next = {
            let mut state = self.state.borrow_mut();
            if state.pending.is_empty() {
                None
            } else {
                Some(state.pending.remove(0))
            }
        };
        match next {
            Some(pending) => {
                (pending.task)();
                true
            }
            None => false,
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            state.pending.push(Pending { id, delay, task });
            state.scheduled.push(delay);
            id
        };

        let state = Rc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                state.borrow_mut().pending.retain(|p| p.id != id);
            }
        })
    }
}
