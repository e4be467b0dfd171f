//! JSON-RPC 2.0 request bodies and reply envelopes.

use hmyload_core::{LoadError, LoadResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

/// One JSON-RPC request. Ids come from the owning connection's counter.
#[derive(Debug, Clone, Serialize)]
pub struct Body {
    jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl Body {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object returned by the node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcFault {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for RpcFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Outcome of one request, as matched back by id.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Non-null result, still undecoded.
    Value(Box<RawValue>),
    /// `result` was `null` or missing.
    Null,
    Fault(RpcFault),
}

impl Reply {
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    pub fn fault(&self) -> Option<&RpcFault> {
        match self {
            Reply::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Decodes the result. `Null` maps to `None`; a fault becomes [`LoadError::Rpc`].
    pub fn decode<T: DeserializeOwned>(&self, method: &str) -> LoadResult<Option<T>> {
        match self {
            Reply::Value(raw) => serde_json::from_str(raw.get())
                .map(Some)
                .map_err(|e| LoadError::Decode(format!("Bad {method} result: {e}"))),
            Reply::Null => Ok(None),
            Reply::Fault(fault) => Err(fault_error(method, fault)),
        }
    }

    /// Converts into a generic JSON value; `Null` becomes `Value::Null`.
    pub fn into_value(self, method: &str) -> LoadResult<Value> {
        Ok(self.decode(method)?.unwrap_or(Value::Null))
    }
}

pub(crate) fn fault_error(method: &str, fault: &RpcFault) -> LoadError {
    LoadError::Rpc {
        method: method.to_string(),
        code: fault.code,
        message: fault.message.clone(),
    }
}

#[derive(Deserialize)]
struct Envelope<'a> {
    id: Option<u64>,
    #[serde(borrow, default)]
    result: Option<&'a RawValue>,
    #[serde(default)]
    error: Option<RpcFault>,
}

/// Parses one reply frame into its id and outcome.
///
/// Frames without a numeric id cannot be matched to a request and are
/// treated as malformed.
pub fn parse_reply(frame: &str) -> LoadResult<(u64, Reply)> {
    let envelope: Envelope<'_> = serde_json::from_str(frame)
        .map_err(|e| LoadError::Transport(format!("Malformed reply: {e}")))?;
    let id = envelope
        .id
        .ok_or_else(|| LoadError::Transport(format!("Reply without id: {}", preview(frame))))?;

    let reply = match (envelope.error, envelope.result) {
        (Some(fault), _) => Reply::Fault(fault),
        (None, Some(raw)) if raw.get() != "null" => Reply::Value(raw.to_owned()),
        (None, _) => Reply::Null,
    };
    Ok((id, reply))
}

fn preview(frame: &str) -> &str {
    let end = frame
        .char_indices()
        .nth(120)
        .map_or(frame.len(), |(i, _)| i);
    &frame[..end]
}
