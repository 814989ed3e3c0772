//! A single enqueued request and its completion callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::FetchError;
use crate::http::{HttpRequest, HttpResponse};

/// Outcome delivered to a callback.
pub type Outcome = Result<HttpResponse, FetchError>;

/// Receives the outcome of one request, exactly once.
///
/// Invoked on a dispatcher thread. Any `FnOnce(Outcome) + Send` closure is a
/// callback.
pub trait Callback: Send + 'static {
    fn on_complete(self: Box<Self>, outcome: Outcome);
}

impl<F> Callback for F
where
    F: FnOnce(Outcome) + Send + 'static,
{
    fn on_complete(self: Box<Self>, outcome: Outcome) {
        (*self)(outcome)
    }
}

/// A request owned by the dispatcher, from enqueue until it finishes.
pub struct Call {
    id: Uuid,
    request: HttpRequest,
    canceled: AtomicBool,
    cancel_signal: Notify,
}

impl Call {
    pub(crate) fn new(request: HttpRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            canceled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Request cancellation. A queued call will fail as soon as it is
    /// promoted; a running call abandons its transfer. Repeated calls and
    /// calls after completion are no-ops.
    pub fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, so a task that has not started
            // waiting yet still observes the cancellation.
            self.cancel_signal.notify_one();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub(crate) async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        self.cancel_signal.notified().await;
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("url", &self.request.url().as_str())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
