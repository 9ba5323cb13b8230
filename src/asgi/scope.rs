//! Request scopes and the per-connection state bag.

use crate::{
    asgi::message::Headers,
    errors::ProtocolError,
    http::{
        query::percent_decode,
        request::RequestHead,
        types::{Method, Version},
    },
};
use serde_json::Value;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

/// Mutable key-value bag shared by every request on one connection.
///
/// The server neither inspects nor migrates the values; requests on a
/// connection run strictly sequentially, so the lock is never contended
/// from handler code.
#[derive(Debug, Clone, Default)]
pub struct State(Arc<Mutex<HashMap<String, Value>>>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0.lock().expect("state lock poisoned").insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().expect("state lock poisoned").get(key).cloned()
    }

    /// A copy of the whole bag, keys sorted for stable output.
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, Value> {
        self.0
            .lock()
            .expect("state lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The immutable description of one call into the application.
#[derive(Debug, Clone)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WebSocketScope),
    Lifespan(LifespanScope),
}

impl Scope {
    /// The `type` discriminator of the wire contract.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::WebSocket(_) => "websocket",
            Self::Lifespan(_) => "lifespan",
        }
    }
}

/// Scope of a single HTTP request.
#[derive(Debug, Clone)]
pub struct HttpScope {
    pub http_version: Version,
    pub method: Method,
    pub scheme: &'static str,
    /// Percent-decoded, UTF-8 validated path.
    pub path: String,
    /// The path bytes exactly as received.
    pub raw_path: Vec<u8>,
    /// Query string bytes, undecoded, without the leading `?`.
    pub query_string: Vec<u8>,
    /// Ordered headers with lowercased names, values byte-preserved.
    pub headers: Headers,
    pub client: Option<SocketAddr>,
    pub server: SocketAddr,
    pub state: State,
}

impl HttpScope {
    /// First header value with the given lowercase name.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Scope of a WebSocket session.
#[derive(Debug, Clone)]
pub struct WebSocketScope {
    pub http_version: Version,
    pub scheme: &'static str,
    pub path: String,
    pub raw_path: Vec<u8>,
    pub query_string: Vec<u8>,
    pub headers: Headers,
    /// Subprotocols offered via `Sec-WebSocket-Protocol`, in order.
    pub subprotocols: Vec<String>,
    pub client: Option<SocketAddr>,
    pub server: SocketAddr,
    pub state: State,
}

/// Scope of the lifespan dialogue; one per server process.
#[derive(Debug, Clone)]
pub struct LifespanScope {
    pub state: State,
}

pub(crate) struct ScopeParts {
    pub(crate) client: Option<SocketAddr>,
    pub(crate) server: SocketAddr,
    pub(crate) state: State,
}

pub(crate) fn build_http(head: &RequestHead, parts: ScopeParts) -> Result<HttpScope, ProtocolError> {
    Ok(HttpScope {
        http_version: head.version,
        method: head.method,
        scheme: "http",
        path: decode_path(&head.path)?,
        raw_path: head.path.clone(),
        query_string: head.query.clone(),
        headers: head.headers.clone(),
        client: parts.client,
        server: parts.server,
        state: parts.state,
    })
}

pub(crate) fn build_websocket(
    head: &RequestHead,
    subprotocols: Vec<String>,
    parts: ScopeParts,
) -> Result<WebSocketScope, ProtocolError> {
    Ok(WebSocketScope {
        http_version: head.version,
        scheme: "ws",
        path: decode_path(&head.path)?,
        raw_path: head.path.clone(),
        query_string: head.query.clone(),
        headers: head.headers.clone(),
        subprotocols,
        client: parts.client,
        server: parts.server,
        state: parts.state,
    })
}

fn decode_path(raw: &[u8]) -> Result<String, ProtocolError> {
    let decoded = percent_decode(raw, false);
    match simdutf8::basic::from_utf8(&decoded) {
        Ok(path) => Ok(path.to_owned()),
        Err(_) => Err(ProtocolError::InvalidUrl),
    }
}
