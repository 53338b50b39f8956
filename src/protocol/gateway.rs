//! Collaborator Interfaces
//!
//! The session engine never runs business logic itself. Everything it needs
//! from the outside world is consumed through the narrow traits in this
//! module:
//!
//! - [`ProcedureGateway`] - runs one procedure call, returning a value or a stream
//! - [`ContextResolver`] - builds the per-connection context once at connect time
//! - [`ErrorFormatter`] - turns an [`RpcError`] into the client-visible [`ErrorShape`]
//! - [`ErrorObserver`] - fire-and-forget hook called for every shaped error
//! - [`DataTransformer`] - codec applied to inbound input and outbound data
//!
//! [`Collaborators`] bundles them for a [`Handler`](super::Handler).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::{json, Map, Value};
use tracing::error;

use super::error::RpcError;
use super::wire::{ErrorShape, ProcedureKind};

// ============================================================================
// Procedure Gateway
// ============================================================================

/// Events produced by a subscription. Dropping the stream unsubscribes.
pub type EventStream = BoxStream<'static, Result<Value, RpcError>>;

/// One procedure invocation handed to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    pub path: String,
    pub kind: ProcedureKind,
    pub input: Option<Value>,
}

/// Result of a procedure: a plain value, or a stream of events.
pub enum ProcedureOutput {
    Data(Value),
    Stream(EventStream),
}

impl std::fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcedureOutput::Data(value) => f.debug_tuple("Data").field(value).finish(),
            ProcedureOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Boundary to the procedure registry.
pub trait ProcedureGateway<C>: Send + Sync + 'static {
    fn call(
        &self,
        ctx: Arc<C>,
        call: ProcedureCall,
    ) -> BoxFuture<'static, Result<ProcedureOutput, RpcError>>;
}

// ============================================================================
// Context Resolution
// ============================================================================

/// What the upgrade request looked like, for context resolution.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Request headers, names lowercased
    pub headers: HashMap<String, String>,
    /// Decoded query string parameters
    pub query: HashMap<String, String>,
    /// Request path (without query string)
    pub url: String,
    /// Peer address of the TCP connection
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// First hop of `x-forwarded-for`, if the connection came through a proxy.
    pub fn forwarded_for(&self) -> Option<&str> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Builds the per-connection context. Called exactly once per session.
pub trait ContextResolver<C>: Send + Sync + 'static {
    fn resolve(&self, info: ConnectionInfo) -> BoxFuture<'static, Result<C, RpcError>>;
}

impl<C, F, Fut> ContextResolver<C> for F
where
    F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, RpcError>> + Send + 'static,
{
    fn resolve(&self, info: ConnectionInfo) -> BoxFuture<'static, Result<C, RpcError>> {
        Box::pin(self(info))
    }
}

// ============================================================================
// Error shaping and observation
// ============================================================================

/// Everything known about an error at the point it is reported.
///
/// `kind` is `None` when the failure is not tied to a procedure call
/// (parse errors, missing ids, context resolution).
pub struct ErrorEvent<'a, C> {
    pub error: &'a RpcError,
    pub kind: Option<ProcedureKind>,
    pub path: Option<&'a str>,
    pub input: Option<&'a Value>,
    pub ctx: Option<&'a C>,
}

impl<C> ErrorEvent<'_, C> {
    /// `"query"`, `"mutation"`, `"subscription"` or `"unknown"`.
    pub fn kind_str(&self) -> &'static str {
        self.kind.map_or("unknown", ProcedureKind::as_str)
    }
}

/// Produces the client-visible error payload.
pub trait ErrorFormatter<C>: Send + Sync + 'static {
    fn format(&self, event: &ErrorEvent<'_, C>) -> ErrorShape;
}

/// `{message, code, data: {code, httpStatus, path?}}`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorFormatter;

impl<C> ErrorFormatter<C> for DefaultErrorFormatter {
    fn format(&self, event: &ErrorEvent<'_, C>) -> ErrorShape {
        let code = event.error.code;
        let mut data = Map::new();
        data.insert("code".to_string(), json!(code.as_str()));
        data.insert("httpStatus".to_string(), json!(code.http_status()));
        if let Some(path) = event.path {
            data.insert("path".to_string(), json!(path));
        }
        ErrorShape {
            message: event.error.message.clone(),
            code: code.json_rpc_code(),
            data: Value::Object(data),
        }
    }
}

/// Hook called for every shaped error. Panics are caught and logged.
pub type ErrorObserver<C> = Arc<dyn Fn(&ErrorEvent<'_, C>) + Send + Sync>;

// ============================================================================
// Data transformer
// ============================================================================

/// Codec applied on both sides of the wire.
pub trait DataTransformer: Send + Sync + 'static {
    /// Outgoing `data` payloads and error `data`.
    fn serialize(&self, value: Value) -> Value;

    /// Incoming `params.input`. A failure answers the call with that error.
    fn deserialize(&self, value: Value) -> Result<Value, RpcError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl DataTransformer for IdentityTransformer {
    fn serialize(&self, value: Value) -> Value {
        value
    }

    fn deserialize(&self, value: Value) -> Result<Value, RpcError> {
        Ok(value)
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// The collaborators a handler hands to every session.
pub struct Collaborators<C> {
    pub gateway: Arc<dyn ProcedureGateway<C>>,
    pub context: Arc<dyn ContextResolver<C>>,
    pub formatter: Arc<dyn ErrorFormatter<C>>,
    pub transformer: Arc<dyn DataTransformer>,
    pub observer: Option<ErrorObserver<C>>,
}

impl<C> Clone for Collaborators<C> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            context: Arc::clone(&self.context),
            formatter: Arc::clone(&self.formatter),
            transformer: Arc::clone(&self.transformer),
            observer: self.observer.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Collaborators<C> {
    /// Gateway and context resolver, with the default formatter and identity transformer.
    pub fn new(gateway: impl ProcedureGateway<C>, context: impl ContextResolver<C>) -> Self {
        Self {
            gateway: Arc::new(gateway),
            context: Arc::new(context),
            formatter: Arc::new(DefaultErrorFormatter),
            transformer: Arc::new(IdentityTransformer),
            observer: None,
        }
    }

    pub fn with_formatter(mut self, formatter: impl ErrorFormatter<C>) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    pub fn with_transformer(mut self, transformer: impl DataTransformer) -> Self {
        self.transformer = Arc::new(transformer);
        self
    }

    pub fn on_error(mut self, observer: impl Fn(&ErrorEvent<'_, C>) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Notify the observer (if any), then shape the error for the wire.
    pub(crate) fn report(&self, event: &ErrorEvent<'_, C>) -> ErrorShape {
        if let Some(observer) = &self.observer {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                error!(
                    kind = event.kind_str(),
                    path = event.path.unwrap_or(""),
                    "error_observer_panicked"
                );
            }
        }
        let mut shape = self.formatter.format(event);
        let data = std::mem::take(&mut shape.data);
        shape.data = self.transformer.serialize(data);
        shape
    }
}
