//! HTTP/1.1 response serialization.
//!
//! The encoder turns the handler's `http.response.start` and
//! `http.response.body` messages into wire bytes, adding the server
//! headers and picking the body framing: `Content-Length` when the
//! handler declared one, `Transfer-Encoding: chunked` otherwise.

use crate::{
    asgi::message::Headers,
    errors::ProtocolError,
    http::types::{self, bodyless_status},
};
use std::time::SystemTime;

/// Written before reading the body of a request that carried
/// `Expect: 100-continue`.
pub(crate) const CONTINUE_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq)]
enum EncodeState {
    Pending,
    Streaming,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BodyMode {
    Fixed { declared: usize },
    Chunked,
    /// HEAD requests and 1xx/204/304 statuses: headers only, body bytes
    /// are discarded.
    Suppressed,
}

/// Serializer for one response. Sequencing violations (body before start,
/// a second start, bytes after the final message) are fatal for the
/// connection and surface as [`ProtocolError::InvalidMessage`].
#[derive(Debug)]
pub(crate) struct ResponseEncoder {
    state: EncodeState,
    mode: BodyMode,
    keep_alive: bool,
    head_request: bool,
    status: u16,
    body_sent: usize,
}

impl ResponseEncoder {
    pub(crate) fn new(keep_alive: bool, head_request: bool) -> Self {
        Self {
            state: EncodeState::Pending,
            mode: BodyMode::Chunked,
            keep_alive,
            head_request,
            status: 0,
            body_sent: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn started(&self) -> bool {
        self.state != EncodeState::Pending
    }

    #[inline(always)]
    pub(crate) fn complete(&self) -> bool {
        self.state == EncodeState::Complete
    }

    /// Keep-alive decision after the response headers are resolved.
    #[inline(always)]
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub(crate) fn status(&self) -> u16 {
        self.status
    }

    /// Serializes the status line and headers into `buf`.
    ///
    /// Handler headers are emitted byte-for-byte as received; the server
    /// adds `Server`, `Date` and the connection headers in canonical
    /// casing, and decides the body framing.
    pub(crate) fn encode_start(
        &mut self,
        status: u16,
        headers: &Headers,
        buf: &mut Vec<u8>,
    ) -> Result<(), ProtocolError> {
        if self.started() {
            return Err(ProtocolError::InvalidMessage("second http.response.start"));
        }

        buf.extend_from_slice(b"HTTP/1.1 ");
        write_decimal(status as usize, buf);
        buf.push(b' ');
        buf.extend_from_slice(types::reason_phrase(status).as_bytes());
        buf.extend_from_slice(b"\r\n");

        let mut declared_length = None;
        let mut has_connection = false;
        let mut has_chunked_te = false;

        for (name, value) in headers {
            if name.eq_ignore_ascii_case(b"content-length") {
                declared_length = types::slice_to_usize(value);
            } else if name.eq_ignore_ascii_case(b"connection") {
                has_connection = true;
                if types::header_has_token(value, b"close") {
                    self.keep_alive = false;
                }
            } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                has_chunked_te = types::header_has_token(value, b"chunked");
            }

            buf.extend_from_slice(name);
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"Server: aras\r\n");
        buf.extend_from_slice(b"Date: ");
        buf.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        buf.extend_from_slice(b"\r\n");

        if !has_connection {
            if self.keep_alive {
                buf.extend_from_slice(b"Connection: keep-alive\r\nKeep-Alive: timeout=5\r\n");
            } else {
                buf.extend_from_slice(b"Connection: close\r\n");
            }
        }

        self.mode = if self.head_request || bodyless_status(status) {
            BodyMode::Suppressed
        } else if has_chunked_te {
            BodyMode::Chunked
        } else {
            match declared_length {
                Some(declared) => BodyMode::Fixed { declared },
                None => {
                    buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                    BodyMode::Chunked
                }
            }
        };

        buf.extend_from_slice(b"\r\n");
        self.status = status;
        self.state = EncodeState::Streaming;

        Ok(())
    }

    /// Serializes one body message into `buf`.
    ///
    /// Returns `true` when body bytes were discarded (HEAD or a bodyless
    /// status); the caller logs the discard.
    pub(crate) fn encode_body(
        &mut self,
        body: &[u8],
        more_body: bool,
        buf: &mut Vec<u8>,
    ) -> Result<bool, ProtocolError> {
        match self.state {
            EncodeState::Pending => {
                return Err(ProtocolError::InvalidMessage(
                    "http.response.body before http.response.start",
                ))
            }
            EncodeState::Complete => {
                return Err(ProtocolError::InvalidMessage(
                    "http.response.body after the final message",
                ))
            }
            EncodeState::Streaming => {}
        }

        let mut discarded = false;
        match self.mode {
            BodyMode::Suppressed => discarded = !body.is_empty() && !self.head_request,
            BodyMode::Fixed { declared } => {
                self.body_sent += body.len();
                if self.body_sent > declared {
                    return Err(ProtocolError::InvalidMessage(
                        "body exceeds the declared content-length",
                    ));
                }
                buf.extend_from_slice(body);

                // An under-delivering handler would desync the peer's
                // framing; give up on reuse instead.
                if !more_body && self.body_sent != declared {
                    self.keep_alive = false;
                }
            }
            BodyMode::Chunked => {
                if !body.is_empty() {
                    write_hex(body.len(), buf);
                    buf.extend_from_slice(b"\r\n");
                    buf.extend_from_slice(body);
                    buf.extend_from_slice(b"\r\n");
                }
                if !more_body {
                    buf.extend_from_slice(b"0\r\n\r\n");
                }
            }
        }

        if !more_body {
            self.state = EncodeState::Complete;
        }
        Ok(discarded)
    }
}

#[inline]
fn write_decimal(mut n: usize, buf: &mut Vec<u8>) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();

    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }

    buf.extend_from_slice(&digits[i..]);
}

#[inline]
fn write_hex(mut n: usize, buf: &mut Vec<u8>) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut digits = [0u8; 16];
    let mut i = digits.len();

    loop {
        i -= 1;
        digits[i] = HEX[n % 16];
        n /= 16;
        if n == 0 {
            break;
        }
    }

    buf.extend_from_slice(&digits[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(
        encoder: &mut ResponseEncoder,
        status: u16,
        headers: &[(&[u8], &[u8])],
    ) -> String {
        let headers: Headers = headers
            .iter()
            .map(|(n, v)| (n.to_vec(), v.to_vec()))
            .collect();
        let mut buf = Vec::new();
        encoder.encode_start(status, &headers, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn fixed_length_response() {
        let mut encoder = ResponseEncoder::new(true, false);
        let head = start(
            &mut encoder,
            200,
            &[(&b"content-type"[..], &b"text/plain"[..]), (&b"content-length"[..], &b"5"[..])],
        );

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("content-type: text/plain\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert!(head.contains("Server: aras\r\n"));
        assert!(head.contains("\r\nDate: "));
        assert!(head.contains(" GMT\r\n"));
        assert!(head.contains("Connection: keep-alive\r\nKeep-Alive: timeout=5\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(head.ends_with("\r\n\r\n"));

        let mut buf = Vec::new();
        assert!(!encoder.encode_body(b"hello", false, &mut buf).unwrap());
        assert_eq!(buf, b"hello");
        assert!(encoder.complete());
        assert!(encoder.keep_alive());
    }

    #[test]
    fn undeclared_length_switches_to_chunked() {
        let mut encoder = ResponseEncoder::new(true, false);
        let head = start(&mut encoder, 200, &[(&b"content-type"[..], &b"text/plain"[..])]);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));

        let mut buf = Vec::new();
        encoder.encode_body(b"some fake video bytes", true, &mut buf).unwrap();
        encoder.encode_body(b"", false, &mut buf).unwrap();
        assert_eq!(buf, b"15\r\nsome fake video bytes\r\n0\r\n\r\n");
        assert!(encoder.complete());
    }

    #[test]
    fn no_keep_alive_policy() {
        let mut encoder = ResponseEncoder::new(false, false);
        let head = start(&mut encoder, 200, &[(&b"content-length"[..], &b"0"[..])]);

        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Keep-Alive:"));
    }

    #[test]
    fn handler_connection_close_wins() {
        let mut encoder = ResponseEncoder::new(true, false);
        let head = start(&mut encoder, 200, &[(&b"connection"[..], &b"close"[..]), (&b"content-length"[..], &b"0"[..])]);

        // Emitted once, as the handler wrote it.
        assert_eq!(head.matches("onnection").count(), 1);
        assert!(!encoder.keep_alive());
    }

    #[test]
    fn head_requests_suppress_body_bytes() {
        let mut encoder = ResponseEncoder::new(true, true);
        let head = start(&mut encoder, 200, &[(&b"content-length"[..], &b"11"[..])]);
        assert!(head.contains("content-length: 11\r\n"));

        let mut buf = Vec::new();
        let discarded = encoder.encode_body(b"hello world", false, &mut buf).unwrap();
        assert!(!discarded);
        assert!(buf.is_empty());
        assert!(encoder.complete());
    }

    #[test]
    fn bodyless_statuses_discard_with_warning() {
        for status in [204, 304, 101] {
            let mut encoder = ResponseEncoder::new(true, false);
            let head = start(&mut encoder, status, &[]);
            assert!(!head.contains("Transfer-Encoding"));

            let mut buf = Vec::new();
            assert!(encoder.encode_body(b"sneaky", false, &mut buf).unwrap());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn sequencing_violations_are_fatal() {
        let mut encoder = ResponseEncoder::new(true, false);
        let mut buf = Vec::new();

        assert_eq!(
            encoder.encode_body(b"early", true, &mut buf).unwrap_err(),
            ProtocolError::InvalidMessage("http.response.body before http.response.start")
        );

        encoder.encode_start(200, &Headers::new(), &mut buf).unwrap();
        assert_eq!(
            encoder.encode_start(200, &Headers::new(), &mut buf).unwrap_err(),
            ProtocolError::InvalidMessage("second http.response.start")
        );

        encoder.encode_body(b"", false, &mut buf).unwrap();
        assert_eq!(
            encoder.encode_body(b"late", false, &mut buf).unwrap_err(),
            ProtocolError::InvalidMessage("http.response.body after the final message")
        );
    }

    #[test]
    fn over_and_under_delivery() {
        let mut encoder = ResponseEncoder::new(true, false);
        let mut buf = Vec::new();
        encoder
            .encode_start(200, &vec![(b"content-length".to_vec(), b"4".to_vec())], &mut buf)
            .unwrap();

        let mut encoder_short = ResponseEncoder::new(true, false);
        let mut buf_short = Vec::new();
        encoder_short
            .encode_start(200, &vec![(b"content-length".to_vec(), b"4".to_vec())], &mut buf_short)
            .unwrap();

        assert!(encoder.encode_body(b"12345", false, &mut buf).is_err());

        encoder_short.encode_body(b"12", false, &mut buf_short).unwrap();
        assert!(!encoder_short.keep_alive());
    }

    #[test]
    fn unknown_status_gets_generic_reason() {
        let mut encoder = ResponseEncoder::new(true, false);
        let head = start(&mut encoder, 299, &[(&b"content-length"[..], &b"0"[..])]);
        assert!(head.starts_with("HTTP/1.1 299 Unknown\r\n"));
    }

    #[test]
    fn number_writers() {
        #[rustfmt::skip]
        let cases = [
            (0usize,    "0",    "0"),
            (9,         "9",    "9"),
            (21,        "21",   "15"),
            (255,       "255",  "ff"),
            (4096,      "4096", "1000"),
        ];

        for (n, dec, hex) in cases {
            let mut buf = Vec::new();
            write_decimal(n, &mut buf);
            assert_eq!(buf, dec.as_bytes());

            buf.clear();
            write_hex(n, &mut buf);
            assert_eq!(buf, hex.as_bytes());
        }
    }
}
