//! The tagged message sets exchanged with the application.
//!
//! The dynamic message model of the original contract becomes two closed
//! enums here: [`ServerMessage`] travels server → application through
//! `receive`, [`AppMessage`] travels application → server through `send`.
//! Unknown tags are unrepresentable by construction; field constraints are
//! checked at the channel boundary before a message is accepted.

/// Header sequence as carried in scopes and response starts: ordered
/// `(name, value)` byte pairs.
pub type Headers = Vec<(Vec<u8>, Vec<u8>)>;

/// Payload of a WebSocket message, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsData {
    Text(String),
    Binary(Vec<u8>),
}

/// Messages delivered to the application through `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `http.request` — one body chunk; the last carries `more_body: false`.
    HttpRequest { body: Vec<u8>, more_body: bool },
    /// `http.disconnect` — the peer went away mid-request.
    HttpDisconnect,

    /// `websocket.connect` — answer with accept or close.
    WebSocketConnect,
    /// `websocket.receive` — one reassembled message from the peer.
    WebSocketReceive(WsData),
    /// `websocket.disconnect` — the peer closed, with the close code.
    WebSocketDisconnect { code: u16 },

    /// `lifespan.startup`
    LifespanStartup,
    /// `lifespan.shutdown`
    LifespanShutdown,
}

/// Messages accepted from the application through `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    /// `http.response.start` — exactly one per request, before any body.
    ResponseStart {
        status: u16,
        headers: Headers,
        /// Accepted for contract compatibility; trailers are not emitted.
        trailers: bool,
    },
    /// `http.response.body` — zero or more; the last carries
    /// `more_body: false`.
    ResponseBody { body: Vec<u8>, more_body: bool },

    /// `websocket.accept` — completes the opening handshake.
    WebSocketAccept {
        subprotocol: Option<String>,
        headers: Headers,
    },
    /// `websocket.send` — one outgoing message.
    WebSocketSend(WsData),
    /// `websocket.close` — close the session (or reject the handshake
    /// when sent instead of accept).
    WebSocketClose { code: u16, reason: String },

    /// `lifespan.startup.complete`
    StartupComplete,
    /// `lifespan.startup.failed`
    StartupFailed { message: String },
    /// `lifespan.shutdown.complete`
    ShutdownComplete,
    /// `lifespan.shutdown.failed`
    ShutdownFailed { message: String },
}

impl AppMessage {
    /// Field validation applied when the message enters the outbound
    /// queue. Sequencing is enforced later, by the codec driving the
    /// connection, which is the only place that knows the protocol state.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        match self {
            Self::ResponseStart { status, .. } if !(100..=599).contains(status) => {
                Err("response status out of range")
            }
            Self::WebSocketClose { code, .. } if !valid_close_code(*code) => {
                Err("websocket close code out of range")
            }
            _ => Ok(()),
        }
    }

    /// The wire tag, for logging.
    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::ResponseStart { .. } => "http.response.start",
            Self::ResponseBody { .. } => "http.response.body",
            Self::WebSocketAccept { .. } => "websocket.accept",
            Self::WebSocketSend(_) => "websocket.send",
            Self::WebSocketClose { .. } => "websocket.close",
            Self::StartupComplete => "lifespan.startup.complete",
            Self::StartupFailed { .. } => "lifespan.startup.failed",
            Self::ShutdownComplete => "lifespan.shutdown.complete",
            Self::ShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }
}

// RFC 6455 §7.4: 1000-2999 protocol-reserved (minus the never-on-wire
// codes), 3000-4999 registered/private.
#[inline]
const fn valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_range_is_enforced() {
        let ok = AppMessage::ResponseStart {
            status: 204,
            headers: vec![],
            trailers: false,
        };
        assert_eq!(ok.validate(), Ok(()));

        for status in [0, 99, 600, 7000] {
            let bad = AppMessage::ResponseStart {
                status,
                headers: vec![],
                trailers: false,
            };
            assert!(bad.validate().is_err());
        }
    }

    #[test]
    fn close_code_range_is_enforced() {
        for code in [1000, 1001, 1008, 3000, 4999] {
            let msg = AppMessage::WebSocketClose {
                code,
                reason: String::new(),
            };
            assert_eq!(msg.validate(), Ok(()));
        }

        // 1005/1006 are reserved for reporting, never for sending.
        for code in [0, 999, 1005, 1006, 1004, 2999, 5000] {
            let msg = AppMessage::WebSocketClose {
                code,
                reason: String::new(),
            };
            assert!(msg.validate().is_err());
        }
    }

    #[test]
    fn kinds_match_wire_tags() {
        assert_eq!(
            AppMessage::ResponseBody {
                body: vec![],
                more_body: false
            }
            .kind(),
            "http.response.body"
        );
        assert_eq!(AppMessage::StartupComplete.kind(), "lifespan.startup.complete");
    }
}
