//! Worker pool that owns every call from enqueue to completion.
//!
//! # Design
//! Calls wait in a FIFO ready queue until promoted. A call is promoted when
//! fewer than `max_requests` calls are running overall and fewer than
//! `max_requests_per_host` are running for its host. Calls for a saturated
//! host are skipped, not blocked behind. Promoted calls run as tokio tasks.
//! When a task ends, its call leaves the running set before the callback
//! fires, and the queue is promoted again.
//!
//! The registries are only touched under one mutex, and the lock is never
//! held across an await or a callback. A call dropped before it completes,
//! such as one still queued when its client shuts down, reports `Canceled`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;

use crate::call::{Call, Callback, Outcome};
use crate::error::FetchError;
use crate::exchange::Exchange;

pub const DEFAULT_MAX_REQUESTS: usize = 64;
pub const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

struct AsyncCall {
    call: Arc<Call>,
    callback: Option<Box<dyn Callback>>,
}

impl AsyncCall {
    fn new(call: Arc<Call>, callback: Box<dyn Callback>) -> Self {
        Self {
            call,
            callback: Some(callback),
        }
    }

    fn complete(mut self, outcome: Outcome) {
        if let Some(callback) = self.callback.take() {
            callback.on_complete(outcome);
        }
    }
}

impl Drop for AsyncCall {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            self.call.cancel();
            callback.on_complete(Err(FetchError::Canceled));
        }
    }
}

struct DispatcherState {
    ready: VecDeque<AsyncCall>,
    running: Vec<Arc<Call>>,
    max_requests: usize,
    max_requests_per_host: usize,
}

impl DispatcherState {
    fn new(max_requests: usize, max_requests_per_host: usize) -> Self {
        Self {
            ready: VecDeque::new(),
            running: Vec::new(),
            max_requests: max_requests.max(1),
            max_requests_per_host: max_requests_per_host.max(1),
        }
    }

    fn running_for_host(&self, host: &str) -> usize {
        self.running
            .iter()
            .filter(|c| c.request().host() == host)
            .count()
    }

    /// Move every call that fits under the limits from `ready` to `running`.
    fn promote(&mut self) -> Vec<AsyncCall> {
        let mut executable = Vec::new();
        let mut i = 0;
        while i < self.ready.len() {
            if self.running.len() >= self.max_requests {
                break;
            }
            let host = self.ready[i].call.request().host();
            if self.running_for_host(host) >= self.max_requests_per_host {
                i += 1;
                continue;
            }
            if let Some(async_call) = self.ready.remove(i) {
                self.running.push(async_call.call.clone());
                executable.push(async_call);
            }
        }
        executable
    }

    fn finish(&mut self, call: &Call) {
        self.running.retain(|c| c.id() != call.id());
    }
}

/// Tracks running and queued calls for one client.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<DispatcherState>>,
    exchange: Arc<Exchange>,
    handle: Handle,
}

impl Dispatcher {
    pub(crate) fn new(
        exchange: Arc<Exchange>,
        handle: Handle,
        max_requests: usize,
        max_requests_per_host: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DispatcherState::new(
                max_requests,
                max_requests_per_host,
            ))),
            exchange,
            handle,
        }
    }

    pub(crate) fn enqueue(&self, call: Arc<Call>, callback: Box<dyn Callback>) {
        tracing::debug!(id = %call.id(), url = %call.request().url(), "call enqueued");
        self.lock().ready.push_back(AsyncCall::new(call, callback));
        self.promote_and_execute();
    }

    fn promote_and_execute(&self) {
        let executable = self.lock().promote();
        for async_call in executable {
            self.spawn(async_call);
        }
    }

    fn spawn(&self, async_call: AsyncCall) {
        let dispatcher = self.clone();
        self.handle.spawn(async move {
            let outcome = dispatcher.exchange.execute(&async_call.call).await;
            dispatcher.finished(&async_call.call);
            async_call.complete(outcome);
        });
    }

    fn finished(&self, call: &Call) {
        self.lock().finish(call);
        self.promote_and_execute();
    }

    /// Snapshot of the calls currently executing.
    pub fn running_calls(&self) -> Vec<Arc<Call>> {
        self.lock().running.clone()
    }

    /// Snapshot of the calls waiting for a slot, in queue order.
    pub fn queued_calls(&self) -> Vec<Arc<Call>> {
        self.lock().ready.iter().map(|a| a.call.clone()).collect()
    }

    /// Running calls followed by queued calls, taken under one lock so no
    /// call is missed while it is being promoted.
    pub fn all_calls(&self) -> Vec<Arc<Call>> {
        let state = self.lock();
        state
            .running
            .iter()
            .cloned()
            .chain(state.ready.iter().map(|a| a.call.clone()))
            .collect()
    }

    pub fn running_calls_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn queued_calls_count(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn max_requests(&self) -> usize {
        self.lock().max_requests
    }

    pub fn max_requests_per_host(&self) -> usize {
        self.lock().max_requests_per_host
    }

    /// Cancel every queued and running call.
    pub fn cancel_all(&self) {
        let state = self.lock();
        for async_call in &state.ready {
            async_call.call.cancel();
        }
        for call in &state.running {
            call.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Dispatcher")
            .field("running", &state.running.len())
            .field("queued", &state.ready.len())
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .finish()
    }
}
