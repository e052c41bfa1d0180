use crate::{BusInfo, CanBus, CanFilter, CanFrame, Result, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    responder: Option<Responder>,
    fail_sends: bool,
    filters: Vec<CanFilter>,
}

struct Shared {
    state: Mutex<MockState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Poisoned)
    }
}

/// In-process loopback bus.
///
/// Every transmitted frame is recorded and offered to an optional responder, whose
/// output is queued for `recv`. A [`MockHandle`] gives tests (or a simulator) access to
/// the same state from another thread.
pub struct MockBus {
    name: String,
    shared: Arc<Shared>,
}

/// Cloneable side door into a [`MockBus`].
///
/// Responders run under the bus lock and must not call back into a handle.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(MockState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Builds a bus whose transmissions are answered by `responder`.
    pub fn with_responder<F>(name: &str, responder: F) -> Self
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        let bus = Self::new(name);
        if let Ok(mut state) = bus.shared.lock() {
            state.responder = Some(Box::new(responder));
        }
        bus
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl MockHandle {
    /// Queue a frame as if it arrived from the wire.
    pub fn inject(&self, frame: CanFrame) {
        if let Ok(mut state) = self.shared.lock() {
            state.inbound.push_back(frame.stamped());
            self.shared.ready.notify_all();
        }
    }

    /// Frames transmitted so far, oldest first.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.shared
            .lock()
            .map(|state| state.sent.clone())
            .unwrap_or_default()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.sent.clear();
        }
    }

    /// Make subsequent `send` calls fail with an I/O error.
    pub fn set_fail_sends(&self, fail: bool) {
        if let Ok(mut state) = self.shared.lock() {
            state.fail_sends = fail;
        }
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        if let Ok(mut state) = self.shared.lock() {
            state.responder = Some(Box::new(responder));
        }
    }

    /// Drop the responder; the bus then swallows transmissions silently.
    pub fn mute(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.responder = None;
        }
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self::new(name))
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.filters = filters.to_vec();
        Ok(())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        let wait = Duration::from_millis(timeout_ms.unwrap_or(0));
        let mut state = self.shared.lock()?;
        loop {
            while let Some(frame) = state.inbound.pop_front() {
                let accepted =
                    state.filters.is_empty() || state.filters.iter().any(|f| f.matches(frame.id));
                if accepted {
                    return Ok(frame);
                }
            }
            if wait.is_zero() {
                return Err(TransportError::Timeout);
            }
            let (guard, res) = self
                .shared
                .ready
                .wait_timeout(state, wait)
                .map_err(|_| TransportError::Poisoned)?;
            state = guard;
            if res.timed_out() && state.inbound.is_empty() {
                return Err(TransportError::Timeout);
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut state = self.shared.lock()?;
        if state.fail_sends {
            return Err(TransportError::Io(format!("{}: transmit refused", self.name)));
        }
        state.sent.push(frame.clone());
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        if !replies.is_empty() {
            state
                .inbound
                .extend(replies.into_iter().map(CanFrame::stamped));
            self.shared.ready.notify_all();
        }
        Ok(())
    }
}
