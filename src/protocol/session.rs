//! Connection Session
//!
//! The per-connection state machine. A session owns the resolved context,
//! the subscription table and the outbound queue of one transport
//! connection, and turns decoded calls into gateway invocations.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting --(context ok)------> Open --(transport close)--> Closing --> Closed
//!     |                                                           ^
//!     +--(context error: null-id error, close after grace)--> Closed
//!     +--(transport close)----------------------------------------+
//! ```
//!
//! Frames are decoded as soon as they arrive. Each procedure call runs in its
//! own task and waits for the shared context future before reaching the
//! gateway, so calls of one batch may be answered out of order.
//! `subscription.stop` is handled inline, in frame order.
//!
//! A panic inside a procedure or a subscription stream is caught and answered
//! as `INTERNAL_SERVER_ERROR`. With `close_on_backpressure_limit` set, any
//! send that leaves more than `max_backpressure` frames queued closes the
//! queue and asks the transport to go away.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::broadcast::SessionRegistry;
use super::error::RpcError;
use super::gateway::{Collaborators, ConnectionInfo, ErrorEvent, EventStream, ProcedureCall, ProcedureOutput};
use super::outbound::Outbound;
use super::subscriptions::{RegisterError, SubscriptionHandle, SubscriptionTable};
use super::wire::{
    decode_with_limit, Call, CallEnvelope, JsonRpcVersion, OutboundMessage, ProcedureKind,
    RequestId, ResponseEnvelope,
};
use crate::config::SessionConfig;

type ContextFuture<C> = Shared<BoxFuture<'static, Result<Arc<C>, RpcError>>>;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Context still resolving; calls are accepted and wait for it
    Connecting,
    /// Context resolved
    Open,
    /// Transport gone, subscriptions being drained
    Closing,
    /// Terminal. Reached after `close()` or a failed context resolution
    Closed,
}

/// Per-call data carried into error reports.
struct CallSite<'a> {
    id: &'a RequestId,
    jsonrpc: Option<JsonRpcVersion>,
    kind: ProcedureKind,
    path: &'a str,
    input: Option<&'a Value>,
}

/// One transport connection's protocol state.
pub struct Session<C> {
    id: Uuid,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    context: ContextFuture<C>,
    context_watch: Mutex<Option<AbortHandle>>,
    subscriptions: Arc<SubscriptionTable>,
    outbound: Outbound,
    services: Collaborators<C>,
    config: SessionConfig,
    registry: Arc<SessionRegistry>,
}

impl<C: Send + Sync + 'static> Session<C> {
    /// Create a session, register it for broadcasts and start resolving its context.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        info: ConnectionInfo,
        outbound: Outbound,
        services: Collaborators<C>,
        config: SessionConfig,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let context: ContextFuture<C> = services
            .context
            .resolve(info)
            .map(|result| result.map(Arc::new))
            .boxed()
            .shared();
        let subscriptions = Arc::new(SubscriptionTable::new());
        registry.register(id, outbound.clone(), Arc::clone(&subscriptions));

        let session = Arc::new(Self {
            id,
            state: Mutex::new(SessionState::Connecting),
            closed: AtomicBool::new(false),
            context,
            context_watch: Mutex::new(None),
            subscriptions,
            outbound,
            services,
            config,
            registry,
        });

        let watcher = tokio::spawn(Arc::clone(&session).watch_context());
        *session.context_watch.lock() = Some(watcher.abort_handle());

        info!(session_id = %id, "session_connecting");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolved context, if resolution already succeeded.
    pub fn context(&self) -> Option<Arc<C>> {
        match self.context.peek() {
            Some(Ok(ctx)) => Some(Arc::clone(ctx)),
            _ => None,
        }
    }

    async fn watch_context(self: Arc<Self>) {
        match self.context.clone().await {
            Ok(_) => {
                let mut state = self.state.lock();
                if *state == SessionState::Connecting {
                    *state = SessionState::Open;
                    debug!(session_id = %self.id, "session_open");
                }
            }
            Err(error) => {
                warn!(session_id = %self.id, error = %error, "context_resolution_failed");
                {
                    let mut state = self.state.lock();
                    if *state == SessionState::Connecting {
                        *state = SessionState::Closed;
                    }
                }
                // Out of reach for broadcasts from here on
                self.registry.deregister(&self.id);
                let event = ErrorEvent {
                    error: &error,
                    kind: None,
                    path: None,
                    input: None,
                    ctx: None,
                };
                let shape = self.services.report(&event);
                self.send(&ResponseEnvelope::error(None, None, shape).into());

                tokio::time::sleep(Duration::from_millis(self.config.context_failure_grace_ms)).await;
                if !self.is_closed() {
                    self.outbound.request_close();
                }
            }
        }
    }

    /// Decode one inbound frame and dispatch its calls.
    ///
    /// Frames arriving once the session is `Closed` are dropped.
    pub fn handle_frame(self: &Arc<Self>, raw: &[u8]) {
        if self.is_closed() || self.state() == SessionState::Closed {
            return;
        }

        let calls = match decode_with_limit(raw, self.config.max_batch_size) {
            Ok(calls) => calls,
            Err(decode_error) => {
                debug!(session_id = %self.id, error = %decode_error, "frame_decode_failed");
                let error = RpcError::parse(&decode_error);
                self.report_unattached(&error, None);
                return;
            }
        };

        for decoded in calls {
            match decoded {
                Ok(envelope) => self.dispatch(envelope),
                Err(missing) => {
                    self.report_unattached(&RpcError::missing_id(), missing.jsonrpc);
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: CallEnvelope) {
        let CallEnvelope { id, jsonrpc, call } = envelope;
        match call {
            Call::Stop => self.stop_subscription(&id),
            Call::Procedure { kind, path, input } => {
                let span = info_span!(
                    "rpc_call",
                    session_id = %self.id,
                    request_id = %id,
                    method = %kind,
                    path = %path
                );
                let session = Arc::clone(self);
                tokio::spawn(
                    async move { session.run_procedure(id, jsonrpc, kind, path, input).await }
                        .instrument(span),
                );
            }
        }
    }

    fn stop_subscription(&self, id: &RequestId) {
        match self.subscriptions.stop(id) {
            Some(handle) => {
                handle.cancel();
                debug!(session_id = %self.id, request_id = %id, "subscription_stopped");
                self.send(&ResponseEnvelope::stopped(id.clone(), handle.jsonrpc()).into());
            }
            None => debug!(session_id = %self.id, request_id = %id, "stop_unknown_subscription"),
        }
    }

    async fn run_procedure(
        self: Arc<Self>,
        id: RequestId,
        jsonrpc: Option<JsonRpcVersion>,
        kind: ProcedureKind,
        path: String,
        input: Option<Value>,
    ) {
        let site = CallSite {
            id: &id,
            jsonrpc,
            kind,
            path: &path,
            input: input.as_ref(),
        };

        let ctx = match self.context.clone().await {
            Ok(ctx) => ctx,
            Err(error) => {
                self.report_call_error(&site, &error, None);
                return;
            }
        };

        let input = match input.clone().map(|v| self.services.transformer.deserialize(v)).transpose() {
            Ok(input) => input,
            Err(error) => {
                self.report_call_error(&site, &error, Some(&ctx));
                return;
            }
        };

        let call = ProcedureCall {
            path: path.clone(),
            kind,
            input,
        };
        let gateway_call = async { self.services.gateway.call(Arc::clone(&ctx), call).await };
        let output = match AssertUnwindSafe(gateway_call).catch_unwind().await {
            Ok(output) => output,
            Err(_) => {
                error!(
                    session_id = %self.id,
                    request_id = %id,
                    path = %path,
                    "procedure_panicked"
                );
                Err(RpcError::procedure_panicked(&path))
            }
        };

        match (kind, output) {
            (_, Err(error)) => self.report_call_error(&site, &error, Some(&ctx)),
            (ProcedureKind::Subscription, Ok(ProcedureOutput::Stream(stream))) => {
                self.start_subscription(&site, stream, &ctx);
            }
            (ProcedureKind::Subscription, Ok(ProcedureOutput::Data(_))) => {
                self.report_call_error(&site, &RpcError::not_a_stream(&path), Some(&ctx));
            }
            (_, Ok(ProcedureOutput::Data(value))) => {
                let data = self.services.transformer.serialize(value);
                self.send(&ResponseEnvelope::data(id.clone(), jsonrpc, data).into());
            }
            (_, Ok(ProcedureOutput::Stream(_))) => {
                let error = RpcError::internal(format!("Procedure {path} returned a stream"));
                self.report_call_error(&site, &error, Some(&ctx));
            }
        }
    }

    fn start_subscription(self: &Arc<Self>, site: &CallSite<'_>, stream: EventStream, ctx: &Arc<C>) {
        let handle = SubscriptionHandle::new(site.id.clone(), site.jsonrpc);
        let started: OutboundMessage = ResponseEnvelope::started(site.id.clone(), site.jsonrpc).into();

        match self
            .subscriptions
            .register_and(handle.clone(), || {
                self.send(&started);
            }) {
            Ok(()) => {}
            Err(RegisterError::Duplicate { error, handle }) => {
                handle.cancel();
                drop(stream);
                self.send(&ResponseEnvelope::stopped(site.id.clone(), site.jsonrpc).into());
                self.report_call_error(site, &RpcError::from(error), Some(ctx));
                return;
            }
            Err(RegisterError::Closed { handle }) => {
                handle.cancel();
                return;
            }
        }

        debug!(session_id = %self.id, request_id = %site.id, "subscription_started");
        let pump = Arc::clone(self).pump(
            handle.clone(),
            stream,
            Arc::clone(ctx),
            site.path.to_string(),
            site.input.cloned(),
        );
        let task = tokio::spawn(pump.in_current_span());
        handle.attach(task.abort_handle());
    }

    async fn pump(
        self: Arc<Self>,
        handle: SubscriptionHandle,
        mut stream: EventStream,
        ctx: Arc<C>,
        path: String,
        input: Option<Value>,
    ) {
        let id = handle.id().clone();
        let jsonrpc = handle.jsonrpc();

        loop {
            let item = match AssertUnwindSafe(stream.next()).catch_unwind().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    error!(
                        session_id = %self.id,
                        request_id = %id,
                        path = %path,
                        "subscription_stream_panicked"
                    );
                    Err(RpcError::procedure_panicked(&path))
                }
            };
            match item {
                Ok(value) => {
                    let data = self.services.transformer.serialize(value);
                    let message: OutboundMessage = ResponseEnvelope::data(id.clone(), jsonrpc, data).into();
                    if !handle.deliver(|| {
                        self.send(&message);
                    }) {
                        return;
                    }
                }
                Err(error) => {
                    if self.subscriptions.remove_if_current(&handle) {
                        let site = CallSite {
                            id: &id,
                            jsonrpc,
                            kind: ProcedureKind::Subscription,
                            path: &path,
                            input: input.as_ref(),
                        };
                        self.report_call_error(&site, &error, Some(&ctx));
                    }
                    return;
                }
            }
        }

        if self.subscriptions.remove_if_current(&handle) {
            debug!(session_id = %self.id, request_id = %id, "subscription_completed");
            self.send(&ResponseEnvelope::stopped(id, jsonrpc).into());
        }
    }

    fn report_call_error(&self, site: &CallSite<'_>, error: &RpcError, ctx: Option<&Arc<C>>) {
        debug!(
            session_id = %self.id,
            request_id = %site.id,
            path = site.path,
            code = %error.code,
            error = %error,
            "rpc_call_failed"
        );
        let event = ErrorEvent {
            error,
            kind: Some(site.kind),
            path: Some(site.path),
            input: site.input,
            ctx: ctx.map(|c| c.as_ref()),
        };
        let shape = self.services.report(&event);
        self.send(&ResponseEnvelope::error(Some(site.id.clone()), site.jsonrpc, shape).into());
    }

    /// Errors with no usable request id (parse errors, missing ids).
    fn report_unattached(&self, error: &RpcError, jsonrpc: Option<JsonRpcVersion>) {
        let ctx = self.context();
        let event = ErrorEvent {
            error,
            kind: None,
            path: None,
            input: None,
            ctx: ctx.as_deref(),
        };
        let shape = self.services.report(&event);
        self.send(&ResponseEnvelope::error(None, jsonrpc, shape).into());
    }

    /// Queue a frame, enforcing the backlog limit when
    /// `close_on_backpressure_limit` is set.
    fn send(&self, message: &OutboundMessage) {
        if !self.outbound.send(message) {
            return;
        }
        let limit = self.config.max_backpressure;
        if self.config.close_on_backpressure_limit
            && limit > 0
            && self.outbound.pending() > limit
            && self.outbound.close()
        {
            warn!(
                session_id = %self.id,
                pending = self.outbound.pending(),
                limit,
                "backpressure_limit_close"
            );
            self.outbound.request_close();
        }
    }

    /// Tear the session down. Returns the number of subscriptions cancelled.
    ///
    /// Closes the outbound queue first, so nothing is written afterwards.
    /// Idempotent.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        {
            let mut state = self.state.lock();
            if *state != SessionState::Closed {
                *state = SessionState::Closing;
            }
        }

        self.outbound.close();
        if let Some(watcher) = self.context_watch.lock().take() {
            watcher.abort();
        }

        let handles = self.subscriptions.drain_all();
        let cancelled = handles.iter().filter(|h| h.cancel()).count();
        self.registry.deregister(&self.id);

        *self.state.lock() = SessionState::Closed;
        info!(session_id = %self.id, cancelled, "session_closed");
        cancelled
    }
}
