//! Wire Format Types
//!
//! Envelope types exchanged over the socket and the codec that turns raw
//! frames into call envelopes and response envelopes back into text.
//!
//! Inbound frames are one call object or an array of them (a batch):
//!
//! ```json
//! {"id": 1, "jsonrpc": "2.0", "method": "subscription", "params": {"path": "onMessage", "input": ""}}
//! [{"id": 1, "method": "query", "params": {"path": "a"}}, {"id": 2, "method": "query", "params": {"path": "b"}}]
//! {"id": 1, "method": "subscription.stop"}
//! ```
//!
//! Outbound frames are always a single object:
//!
//! ```json
//! {"id": 1, "jsonrpc": "2.0", "result": {"type": "started"}}
//! {"id": 1, "jsonrpc": "2.0", "result": {"type": "data", "data": {"text": "hi"}}}
//! {"id": 1, "jsonrpc": "2.0", "result": {"type": "stopped"}}
//! {"id": 1, "error": {"message": "...", "code": -32600, "data": {"code": "BAD_REQUEST", "httpStatus": 400}}}
//! {"id": null, "method": "reconnect"}
//! ```

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::error::DecodeError;

// ============================================================================
// Identifiers
// ============================================================================

/// Client-chosen request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// The `jsonrpc` marker. Only `"2.0"` is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsonRpcVersion {
    #[serde(rename = "2.0")]
    V2,
}

// ============================================================================
// Inbound
// ============================================================================

/// Kind of procedure a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureKind::Query => "query",
            ProcedureKind::Mutation => "mutation",
            ProcedureKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a call envelope asks the session to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// Run a procedure.
    Procedure {
        kind: ProcedureKind,
        path: String,
        input: Option<Value>,
    },
    /// Stop the subscription opened under the envelope's id.
    Stop,
}

/// One decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub id: RequestId,
    pub jsonrpc: Option<JsonRpcVersion>,
    pub call: Call,
}

impl CallEnvelope {
    /// The procedure kind, or `None` for `subscription.stop`.
    pub fn kind(&self) -> Option<ProcedureKind> {
        match &self.call {
            Call::Procedure { kind, .. } => Some(*kind),
            Call::Stop => None,
        }
    }
}

/// Well-formed envelope that carried no usable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingId {
    pub jsonrpc: Option<JsonRpcVersion>,
}

/// One element of a decoded frame.
pub type DecodedCall = Result<CallEnvelope, MissingId>;

#[derive(Deserialize)]
enum RawMethod {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

#[derive(Deserialize)]
struct RawParams {
    path: String,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    jsonrpc: Option<JsonRpcVersion>,
    method: RawMethod,
    #[serde(default)]
    params: Option<RawParams>,
}

impl RawEnvelope {
    fn into_decoded(self, index: usize) -> Result<DecodedCall, DecodeError> {
        let call = match self.method {
            RawMethod::SubscriptionStop => Call::Stop,
            method => {
                let params = self.params.ok_or_else(|| DecodeError::InvalidEnvelope {
                    index,
                    reason: "missing `params`".to_string(),
                })?;
                let kind = match method {
                    RawMethod::Query => ProcedureKind::Query,
                    RawMethod::Mutation => ProcedureKind::Mutation,
                    _ => ProcedureKind::Subscription,
                };
                Call::Procedure {
                    kind,
                    path: params.path,
                    input: params.input,
                }
            }
        };

        Ok(match self.id {
            Some(id) => Ok(CallEnvelope {
                id,
                jsonrpc: self.jsonrpc,
                call,
            }),
            None => Err(MissingId {
                jsonrpc: self.jsonrpc,
            }),
        })
    }
}

/// Decode a raw frame into its ordered calls.
pub fn decode(raw: &[u8]) -> Result<Vec<DecodedCall>, DecodeError> {
    decode_with_limit(raw, 0)
}

/// Decode a raw frame, rejecting batches larger than `max_batch` (0 = no limit).
///
/// Any malformed element fails the whole frame.
pub fn decode_with_limit(raw: &[u8], max_batch: usize) -> Result<Vec<DecodedCall>, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    let value: Value = serde_json::from_str(text)?;

    let elements = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return Err(DecodeError::NotAMessage),
    };

    if max_batch > 0 && elements.len() > max_batch {
        return Err(DecodeError::BatchTooLarge {
            size: elements.len(),
            limit: max_batch,
        });
    }

    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            if !element.is_object() {
                return Err(DecodeError::InvalidEnvelope {
                    index,
                    reason: "expected an object".to_string(),
                });
            }
            let raw: RawEnvelope =
                serde_json::from_value(element).map_err(|e| DecodeError::InvalidEnvelope {
                    index,
                    reason: e.to_string(),
                })?;
            raw.into_decoded(index)
        })
        .collect()
}

// ============================================================================
// Outbound
// ============================================================================

/// Client-visible error payload. Opaque to this layer beyond `message`/`code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub message: String,
    pub code: i32,
    #[serde(default)]
    pub data: Value,
}

/// Successful result payload. Closed set: a subscription id sees
/// `Started`, then any number of `Data`, then `Stopped`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    Started,
    Data { data: Value },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    Result(ResultPayload),
    Error(ErrorShape),
}

/// Server answer correlated to a request id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<JsonRpcVersion>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    fn result(id: RequestId, jsonrpc: Option<JsonRpcVersion>, payload: ResultPayload) -> Self {
        Self {
            id: Some(id),
            jsonrpc,
            body: ResponseBody::Result(payload),
        }
    }

    pub fn started(id: RequestId, jsonrpc: Option<JsonRpcVersion>) -> Self {
        Self::result(id, jsonrpc, ResultPayload::Started)
    }

    pub fn stopped(id: RequestId, jsonrpc: Option<JsonRpcVersion>) -> Self {
        Self::result(id, jsonrpc, ResultPayload::Stopped)
    }

    pub fn data(id: RequestId, jsonrpc: Option<JsonRpcVersion>, data: Value) -> Self {
        Self::result(id, jsonrpc, ResultPayload::Data { data })
    }

    pub fn error(id: Option<RequestId>, jsonrpc: Option<JsonRpcVersion>, error: ErrorShape) -> Self {
        Self {
            id,
            jsonrpc,
            body: ResponseBody::Error(error),
        }
    }
}

/// Unsolicited hint that the client should reconnect.
/// Serialized as `{"id": null, "method": "reconnect"}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectNotification;

impl Serialize for ReconnectNotification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ReconnectNotification", 2)?;
        state.serialize_field("id", &Option::<RequestId>::None)?;
        state.serialize_field("method", "reconnect")?;
        state.end()
    }
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Response(ResponseEnvelope),
    Reconnect(ReconnectNotification),
}

impl From<ResponseEnvelope> for OutboundMessage {
    fn from(envelope: ResponseEnvelope) -> Self {
        OutboundMessage::Response(envelope)
    }
}

impl From<ReconnectNotification> for OutboundMessage {
    fn from(notification: ReconnectNotification) -> Self {
        OutboundMessage::Reconnect(notification)
    }
}

/// Serialize one outbound message to its frame text.
pub fn encode(message: &OutboundMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
