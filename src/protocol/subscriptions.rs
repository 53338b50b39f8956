//! Subscription Table
//!
//! Per-session map from request id to the handle of a live stream pump.
//!
//! The table is the single place where the fate of a subscription is decided:
//! whoever removes the entry (a client stop, the pump on completion or error,
//! or the session on close) owns the terminal message for that id. Nobody
//! else sends one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use super::error::DuplicateId;
use super::wire::{JsonRpcVersion, RequestId};

struct HandleState {
    cancelled: bool,
    abort: Option<AbortHandle>,
}

struct HandleInner {
    id: RequestId,
    jsonrpc: Option<JsonRpcVersion>,
    state: Mutex<HandleState>,
}

/// Cancelable handle to one running subscription.
///
/// Clones share state. Cancelling is synchronous and idempotent: once
/// [`cancel`](Self::cancel) returns, [`deliver`](Self::deliver) never runs
/// its closure again.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn new(id: RequestId, jsonrpc: Option<JsonRpcVersion>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                jsonrpc,
                state: Mutex::new(HandleState {
                    cancelled: false,
                    abort: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.inner.id
    }

    pub fn jsonrpc(&self) -> Option<JsonRpcVersion> {
        self.inner.jsonrpc
    }

    /// Bind the pump task. Aborts it immediately if already cancelled.
    pub fn attach(&self, abort: AbortHandle) {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            abort.abort();
        } else {
            state.abort = Some(abort);
        }
    }

    /// Stop the pump. Returns `true` only for the call that did the cancelling.
    pub fn cancel(&self) -> bool {
        let abort = {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.abort.take()
        };
        if let Some(abort) = abort {
            abort.abort();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Run `emit` unless cancelled, holding the cancel lock while it runs.
    pub fn deliver(&self, emit: impl FnOnce()) -> bool {
        let state = self.inner.state.lock();
        if state.cancelled {
            return false;
        }
        emit();
        true
    }

    pub fn same_as(&self, other: &SubscriptionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Why [`SubscriptionTable::register`] refused a handle.
///
/// The refused handle is handed back so the caller can stop it.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("{error}")]
    Duplicate {
        #[source]
        error: DuplicateId,
        handle: SubscriptionHandle,
    },

    #[error("Session is closed")]
    Closed { handle: SubscriptionHandle },
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<RequestId, SubscriptionHandle>,
    sealed: bool,
}

/// Live subscriptions of one session, keyed by request id.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<TableInner>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle under its id.
    pub fn register(&self, handle: SubscriptionHandle) -> Result<(), RegisterError> {
        self.register_and(handle, || {})
    }

    /// Insert a handle and run `on_registered` before the table lock is
    /// released, so no concurrent [`stop`](Self::stop) can see the entry
    /// before `on_registered` has finished.
    pub fn register_and(
        &self,
        handle: SubscriptionHandle,
        on_registered: impl FnOnce(),
    ) -> Result<(), RegisterError> {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return Err(RegisterError::Closed { handle });
        }
        if inner.entries.contains_key(handle.id()) {
            return Err(RegisterError::Duplicate {
                error: DuplicateId(handle.id().clone()),
                handle,
            });
        }
        inner.entries.insert(handle.id().clone(), handle);
        on_registered();
        Ok(())
    }

    /// Remove and return the handle for `id`. Unknown ids are a no-op.
    pub fn stop(&self, id: &RequestId) -> Option<SubscriptionHandle> {
        self.inner.lock().entries.remove(id)
    }

    /// Remove the entry for `handle`'s id only if it is still that handle.
    pub fn remove_if_current(&self, handle: &SubscriptionHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get(handle.id()) {
            Some(current) if current.same_as(handle) => {
                inner.entries.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    /// Remove everything and refuse further registrations.
    pub fn drain_all(&self) -> Vec<SubscriptionHandle> {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        inner.entries.drain().map(|(_, handle)| handle).collect()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
