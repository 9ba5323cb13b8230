//! RFC 6455 opening handshake.

use crate::{asgi::message::Headers, http::request::RequestHead, http::types::header_has_token};
use base64::engine::{general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Validated upgrade request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub(crate) key: Vec<u8>,
    /// `Sec-WebSocket-Protocol` offers, in order.
    pub(crate) subprotocols: Vec<String>,
}

/// Checks the upgrade headers of a request that carried
/// `Upgrade: websocket`. Failures are answered with a plain `400`.
pub(crate) fn validate(head: &RequestHead) -> Result<Handshake, &'static str> {
    let connection = head.header(b"connection").unwrap_or(b"");
    if !header_has_token(connection, b"upgrade") {
        return Err("`Connection` header does not include 'upgrade'");
    }

    match head.header(b"sec-websocket-version") {
        Some(b"13") => {}
        _ => return Err("`Sec-WebSocket-Version` header is not '13'"),
    }

    let key = match head.header(b"sec-websocket-key") {
        Some(key) if !key.is_empty() => key.to_vec(),
        _ => return Err("`Sec-WebSocket-Key` header missing"),
    };

    let subprotocols = head
        .header(b"sec-websocket-protocol")
        .map(|value| {
            value
                .split(|&b| b == b',')
                .map(crate::http::types::trim_ows)
                .filter(|p| !p.is_empty())
                .filter_map(|p| std::str::from_utf8(p).ok())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    Ok(Handshake { key, subprotocols })
}

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key);
    sha1.update(WS_GUID);
    BASE64.encode(sha1.finalize())
}

/// Serializes the `101 Switching Protocols` response completing the
/// handshake, including any headers the handler attached to its accept.
pub(crate) fn response(
    key: &[u8],
    subprotocol: Option<&str>,
    extra_headers: &Headers,
    buf: &mut Vec<u8>,
) {
    buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.extend_from_slice(b"Upgrade: websocket\r\n");
    buf.extend_from_slice(b"Connection: Upgrade\r\n");
    buf.extend_from_slice(b"Sec-WebSocket-Accept: ");
    buf.extend_from_slice(accept_key(key).as_bytes());
    buf.extend_from_slice(b"\r\n");

    if let Some(protocol) = subprotocol {
        buf.extend_from_slice(b"Sec-WebSocket-Protocol: ");
        buf.extend_from_slice(protocol.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    for (name, value) in extra_headers {
        buf.extend_from_slice(name);
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value);
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_head;
    use crate::limits::HttpLimits;

    fn upgrade_head(extra: &str) -> RequestHead {
        let raw = format!(
            "GET /api/chat/simple HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             {extra}\r\n"
        );
        parse_head(raw.as_bytes(), &HttpLimits::default())
            .unwrap()
            .unwrap()
            .0
    }

    #[test]
    fn rfc_sample_accept_key() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn valid_handshake() {
        let handshake = validate(&upgrade_head("")).unwrap();
        assert_eq!(handshake.key, b"dGhlIHNhbXBsZSBub25jZQ==");
        assert!(handshake.subprotocols.is_empty());
    }

    #[test]
    fn subprotocol_offers_are_collected() {
        let handshake = validate(&upgrade_head("Sec-WebSocket-Protocol: chat, superchat\r\n")).unwrap();
        assert_eq!(handshake.subprotocols, vec!["chat", "superchat"]);
    }

    #[test]
    fn missing_pieces_are_rejected() {
        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive\r\n\r\n";
        let head = parse_head(raw, &HttpLimits::default()).unwrap().unwrap().0;
        assert!(validate(&head).is_err());

        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: x\r\n\r\n";
        let head = parse_head(raw, &HttpLimits::default()).unwrap().unwrap().0;
        assert_eq!(
            validate(&head).unwrap_err(),
            "`Sec-WebSocket-Version` header is not '13'"
        );

        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let head = parse_head(raw, &HttpLimits::default()).unwrap().unwrap().0;
        assert_eq!(validate(&head).unwrap_err(), "`Sec-WebSocket-Key` header missing");
    }

    #[test]
    fn response_bytes() {
        let mut buf = Vec::new();
        response(
            b"dGhlIHNhbXBsZSBub25jZQ==",
            Some("chat"),
            &vec![(b"x-session".to_vec(), b"42".to_vec())],
            &mut buf,
        );
        let text = String::from_utf8(buf).unwrap();

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("x-session: 42\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
