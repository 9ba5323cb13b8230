//! Incremental HTTP/1.1 request parsing.
//!
//! The connection accumulates bytes in its read buffer and calls
//! [`parse_head`] until a full head is available; body bytes are then
//! framed by [`BodyFraming`], with chunked transfer decoding handled by
//! the [`ChunkedDecoder`] state machine.

use crate::{
    errors::ProtocolError,
    http::types::{self, header_has_token, trim_ows, Method, Version},
    limits::HttpLimits,
};
use memchr::{memchr, memmem};

/// Parsed request line and headers of one request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) version: Version,
    /// Path bytes exactly as received (before the `?`).
    pub(crate) path: Vec<u8>,
    /// Query bytes without the leading `?`, possibly empty.
    pub(crate) query: Vec<u8>,
    /// All headers in order, names lowercased, values byte-preserved.
    pub(crate) headers: Vec<(Vec<u8>, Vec<u8>)>,

    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) keep_alive: bool,
    pub(crate) expect_continue: bool,
    pub(crate) upgrade_websocket: bool,
}

impl RequestHead {
    #[inline]
    pub(crate) fn framing(&self) -> BodyFraming {
        if self.chunked {
            BodyFraming::Chunked
        } else {
            match self.content_length {
                Some(0) | None => BodyFraming::Empty,
                Some(len) => BodyFraming::Length(len),
            }
        }
    }

    /// First header value with the given lowercase name.
    #[inline]
    pub(crate) fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
}

/// Attempts to parse one request head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the head and
/// the number of bytes consumed (leading empty lines included).
pub(crate) fn parse_head(
    buf: &[u8],
    limits: &HttpLimits,
) -> Result<Option<(RequestHead, usize)>, ProtocolError> {
    // Robustness: ignore empty lines before the request line.
    let mut offset = 0;
    while buf[offset..].starts_with(b"\r\n") {
        offset += 2;
    }
    let buf = &buf[offset..];

    let Some(head_end) = memmem::find(buf, b"\r\n\r\n") else {
        if offset + buf.len() >= limits.max_bytes() {
            return Err(ProtocolError::PayloadTooLarge);
        }
        return Ok(None);
    };

    let mut lines = buf[..head_end].split(|&b| b == b'\r');
    let request_line = lines.next().ok_or(ProtocolError::InvalidRequestLine)?;
    let mut head = parse_request_line(request_line, limits)?;

    for line in lines {
        let line = line.strip_prefix(b"\n").ok_or(ProtocolError::InvalidHeader)?;
        if head.headers.len() == limits.header_count {
            return Err(ProtocolError::TooManyHeaders);
        }
        parse_header_line(line, limits, &mut head)?;
    }

    if head.chunked && head.content_length.is_some() {
        return Err(ProtocolError::ConflictingFraming);
    }
    if head.content_length.unwrap_or(0) > limits.max_bytes() {
        return Err(ProtocolError::PayloadTooLarge);
    }

    Ok(Some((head, offset + head_end + 4)))
}

fn parse_request_line(line: &[u8], limits: &HttpLimits) -> Result<RequestHead, ProtocolError> {
    let mut parts = line.split(|&b| b == b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(ProtocolError::InvalidRequestLine),
    };

    let method = Method::from_bytes(method)?;
    let (version, keep_alive) = Version::from_bytes(version)?;

    if target.is_empty() || target[0] != b'/' || target.len() > limits.url_size {
        return Err(ProtocolError::InvalidUrl);
    }
    let (path, query) = match memchr(b'?', target) {
        Some(q) => (target[..q].to_vec(), target[q + 1..].to_vec()),
        None => (target.to_vec(), Vec::new()),
    };

    Ok(RequestHead {
        method,
        version,
        path,
        query,
        headers: Vec::new(),
        content_length: None,
        chunked: false,
        keep_alive,
        expect_continue: false,
        upgrade_websocket: false,
    })
}

fn parse_header_line(
    line: &[u8],
    limits: &HttpLimits,
    head: &mut RequestHead,
) -> Result<(), ProtocolError> {
    let split = memchr(b':', line).ok_or(ProtocolError::InvalidHeader)?;
    let (raw_name, rest) = line.split_at(split);

    // No whitespace is allowed inside or after the field name.
    if raw_name.is_empty()
        || raw_name.len() > limits.header_name_size
        || raw_name.iter().any(|&b| b == b' ' || b == b'\t')
    {
        return Err(ProtocolError::InvalidHeader);
    }

    let value = trim_ows(&rest[1..]);
    if value.len() > limits.header_value_size {
        return Err(ProtocolError::InvalidHeader);
    }

    let mut name = raw_name.to_vec();
    types::to_lower_case(&mut name);

    match name.as_slice() {
        b"content-length" => {
            let len = types::slice_to_usize(value).ok_or(ProtocolError::InvalidContentLength)?;
            if head.content_length.is_some_and(|prev| prev != len) {
                return Err(ProtocolError::InvalidContentLength);
            }
            head.content_length = Some(len);
        }
        b"transfer-encoding" => {
            // chunked must be the final (and here: only) coding.
            if !header_has_token(value, b"chunked") {
                return Err(ProtocolError::InvalidHeader);
            }
            head.chunked = true;
        }
        b"connection" => {
            if header_has_token(value, b"close") {
                head.keep_alive = false;
            } else if header_has_token(value, b"keep-alive") {
                head.keep_alive = true;
            }
        }
        b"expect" => {
            if value.eq_ignore_ascii_case(b"100-continue") {
                head.expect_continue = true;
            }
        }
        b"upgrade" => {
            if header_has_token(value, b"websocket") {
                head.upgrade_websocket = true;
            }
        }
        _ => {}
    }

    head.headers.push((name, value.to_vec()));
    Ok(())
}

// CHUNKED TRANSFER DECODING

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    Size,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLine,
    EndLf,
    End,
}

// Extensions are skipped, not interpreted; this bounds how much of them
// we are willing to skip over the whole body.
const CHUNK_EXTENSIONS_LIMIT: usize = 16 * 1024;

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Feed it wire bytes as they arrive; decoded body bytes land in `out`.
/// State persists across calls, so a chunk header split over two socket
/// reads is handled transparently. The cap applies to the total decoded
/// bytes.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
    chunk_len: u64,
    size_digits: u8,
    ext_bytes: usize,
    total: usize,
    cap: usize,
}

impl ChunkedDecoder {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            state: ChunkedState::Size,
            chunk_len: 0,
            size_digits: 0,
            ext_bytes: 0,
            total: 0,
            cap,
        }
    }

    /// Consumes bytes from `input`, appending decoded body bytes to `out`.
    /// Returns `(consumed, done)`.
    pub(crate) fn decode(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(usize, bool), ProtocolError> {
        let mut i = 0;

        while i < input.len() && self.state != ChunkedState::End {
            match self.state {
                ChunkedState::Size => match input[i] {
                    b @ (b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F') => {
                        let digit = match b {
                            b'0'..=b'9' => b - b'0',
                            b'a'..=b'f' => b - b'a' + 10,
                            _ => b - b'A' + 10,
                        };
                        self.chunk_len = self
                            .chunk_len
                            .checked_mul(16)
                            .and_then(|n| n.checked_add(u64::from(digit)))
                            .ok_or(ProtocolError::PayloadTooLarge)?;
                        self.size_digits += 1;
                        i += 1;
                    }
                    b';' if self.size_digits > 0 => {
                        self.state = ChunkedState::Extension;
                        i += 1;
                    }
                    b'\r' if self.size_digits > 0 => {
                        self.state = ChunkedState::SizeLf;
                        i += 1;
                    }
                    _ => return Err(ProtocolError::InvalidChunk),
                },
                ChunkedState::Extension => {
                    self.ext_bytes += 1;
                    if self.ext_bytes > CHUNK_EXTENSIONS_LIMIT {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    if input[i] == b'\r' {
                        self.state = ChunkedState::SizeLf;
                    }
                    i += 1;
                }
                ChunkedState::SizeLf => {
                    if input[i] != b'\n' {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    self.state = if self.chunk_len == 0 {
                        ChunkedState::Trailer
                    } else {
                        ChunkedState::Body
                    };
                    i += 1;
                }
                ChunkedState::Body => {
                    let available = input.len() - i;
                    let take = (self.chunk_len as usize).min(available);

                    self.total += take;
                    if self.total > self.cap {
                        return Err(ProtocolError::PayloadTooLarge);
                    }

                    out.extend_from_slice(&input[i..i + take]);
                    self.chunk_len -= take as u64;
                    i += take;
                    if self.chunk_len == 0 {
                        self.state = ChunkedState::BodyCr;
                    }
                }
                ChunkedState::BodyCr => {
                    if input[i] != b'\r' {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    self.state = ChunkedState::BodyLf;
                    i += 1;
                }
                ChunkedState::BodyLf => {
                    if input[i] != b'\n' {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    self.state = ChunkedState::Size;
                    self.size_digits = 0;
                    i += 1;
                }
                ChunkedState::Trailer => {
                    // Trailer fields are consumed and dropped.
                    self.state = if input[i] == b'\r' {
                        ChunkedState::EndLf
                    } else {
                        ChunkedState::TrailerLine
                    };
                    i += 1;
                }
                ChunkedState::TrailerLine => {
                    if input[i] == b'\n' {
                        self.state = ChunkedState::Trailer;
                    }
                    i += 1;
                }
                ChunkedState::EndLf => {
                    if input[i] != b'\n' {
                        return Err(ProtocolError::InvalidChunk);
                    }
                    self.state = ChunkedState::End;
                    i += 1;
                }
                ChunkedState::End => unreachable!(),
            }
        }

        Ok((i, self.state == ChunkedState::End))
    }
}

#[cfg(test)]
mod head_tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Option<(RequestHead, usize)>, ProtocolError> {
        parse_head(raw, &HttpLimits::default())
    }

    fn parse_ok(raw: &[u8]) -> RequestHead {
        parse(raw).unwrap().unwrap().0
    }

    #[test]
    fn parse_valid_requests() {
        #[rustfmt::skip]
        let cases: [(&[u8], Method, Version, &[u8], &[u8], bool); 6] = [
            (b"GET / HTTP/1.1\r\n\r\n",
                Method::Get, Version::Http11, b"/", b"", true),
            (b"GET /api/qwe/name HTTP/1.1\r\n\r\n",
                Method::Get, Version::Http11, b"/api/qwe/name", b"", true),
            (b"POST /test?x=1&y=2 HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                Method::Post, Version::Http11, b"/test", b"x=1&y=2", true),
            (b"DELETE / HTTP/1.0\r\n\r\n",
                Method::Delete, Version::Http10, b"/", b"", false),
            (b"PATCH / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
                Method::Patch, Version::Http10, b"/", b"", true),
            (b"OPTIONS / HTTP/1.1\r\nConnection: close\r\n\r\n",
                Method::Options, Version::Http11, b"/", b"", false),
        ];

        for (raw, method, version, path, query, keep_alive) in cases {
            let (head, consumed) = parse(raw).unwrap().unwrap();

            assert_eq!(head.method, method);
            assert_eq!(head.version, version);
            assert_eq!(head.path, path);
            assert_eq!(head.query, query);
            assert_eq!(head.keep_alive, keep_alive);
            assert_eq!(consumed, raw.len());
        }
    }

    #[test]
    fn parse_invalid_requests() {
        #[rustfmt::skip]
        let cases: [(&[u8], ProtocolError); 10] = [
            (b"GET/ HTTP/1.1\r\n\r\n",                ProtocolError::InvalidRequestLine),
            (b"GET / HTTP/1.1 extra\r\n\r\n",         ProtocolError::InvalidRequestLine),
            (b"PYU / HTTP/1.1\r\n\r\n",               ProtocolError::InvalidMethod),
            (b"GET  HTTP/1.1\r\n\r\n",                ProtocolError::InvalidUrl),
            (b"GET relative HTTP/1.1\r\n\r\n",        ProtocolError::InvalidUrl),
            (b"GET / HTTP/2.0\r\n\r\n",               ProtocolError::UnsupportedVersion),
            (b"GET / HTTP/1.1\r\nNo-Colon value\r\n\r\n",  ProtocolError::InvalidHeader),
            (b"GET / HTTP/1.1\r\n: anonymous\r\n\r\n",     ProtocolError::InvalidHeader),
            (b"GET / HTTP/1.1\r\nBad Name: v\r\n\r\n",     ProtocolError::InvalidHeader),
            (b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n",
                ProtocolError::InvalidContentLength),
        ];

        for (raw, expected) in cases {
            assert_eq!(parse(raw).unwrap_err(), expected, "case: {raw:?}");
        }
    }

    #[test]
    fn incomplete_heads_ask_for_more() {
        for raw in [
            &b""[..],
            b"GET",
            b"GET / HTTP/1.1",
            b"GET / HTTP/1.1\r\n",
            b"GET / HTTP/1.1\r\nHost: x\r\n",
        ] {
            assert_eq!(parse(raw).unwrap(), None);
        }
    }

    #[test]
    fn leading_empty_lines_are_skipped() {
        let raw = b"\r\n\r\nGET /x HTTP/1.1\r\n\r\n";
        let (head, consumed) = parse(raw).unwrap().unwrap();
        assert_eq!(head.path, b"/x");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn headers_preserved_in_order_with_lowercased_names() {
        let head = parse_ok(b"GET / HTTP/1.1\r\nHOST: a\r\nX-Two: b\r\nhost: c\r\n\r\n");

        let names: Vec<&[u8]> = head.headers.iter().map(|(n, _)| n.as_slice()).collect();
        assert_eq!(names, [&b"host"[..], b"x-two", b"host"]);
        assert_eq!(head.header(b"host"), Some(&b"a"[..]));
    }

    #[test]
    fn special_headers() {
        let head = parse_ok(
            b"POST /up HTTP/1.1\r\nContent-Length: 17\r\nExpect: 100-continue\r\n\r\n",
        );
        assert_eq!(head.content_length, Some(17));
        assert!(head.expect_continue);
        assert_eq!(head.framing(), BodyFraming::Length(17));

        let head = parse_ok(b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(head.chunked);
        assert_eq!(head.framing(), BodyFraming::Chunked);

        let head = parse_ok(b"GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\n\r\n");
        assert!(head.upgrade_websocket);
        assert_eq!(head.framing(), BodyFraming::Empty);
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(parse(raw).unwrap_err(), ProtocolError::ConflictingFraming);

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        assert_eq!(parse(raw).unwrap_err(), ProtocolError::InvalidContentLength);

        // Repeated but identical lengths are tolerated.
        let head = parse_ok(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(head.content_length, Some(5));
    }

    #[test]
    fn limits_are_enforced() {
        let limits = HttpLimits {
            max_size_kb: 1,
            url_size: 32,
            header_count: 2,
            header_name_size: 16,
            header_value_size: 16,
            ..HttpLimits::default()
        };

        let long_url = format!("GET /{} HTTP/1.1\r\n\r\n", "u".repeat(32));
        assert_eq!(
            parse_head(long_url.as_bytes(), &limits).unwrap_err(),
            ProtocolError::InvalidUrl
        );

        let many = b"GET / HTTP/1.1\r\na: 1\r\nb: 2\r\nc: 3\r\n\r\n";
        assert_eq!(
            parse_head(many, &limits).unwrap_err(),
            ProtocolError::TooManyHeaders
        );

        let long_value = format!("GET / HTTP/1.1\r\na: {}\r\n\r\n", "v".repeat(17));
        assert_eq!(
            parse_head(long_value.as_bytes(), &limits).unwrap_err(),
            ProtocolError::InvalidHeader
        );

        let big_cl = b"POST / HTTP/1.1\r\nContent-Length: 2048\r\n\r\n";
        assert_eq!(
            parse_head(big_cl, &limits).unwrap_err(),
            ProtocolError::PayloadTooLarge
        );

        // A head that can never complete within the request bound.
        let endless = format!("GET / HTTP/1.1\r\nx: {}", "y".repeat(1100));
        assert_eq!(
            parse_head(endless.as_bytes(), &limits).unwrap_err(),
            ProtocolError::PayloadTooLarge
        );
    }
}

#[cfg(test)]
mod chunked_tests {
    use super::*;

    #[test]
    fn single_buffer() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();

        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (consumed, done) = decoder.decode(wire, &mut out).unwrap();

        assert_eq!(consumed, wire.len());
        assert!(done);
        assert_eq!(out, b"Wikipedia");
    }

    #[test]
    fn split_across_arbitrary_boundaries() {
        let wire = b"4\r\nWiki\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n";

        for split in 1..wire.len() {
            let mut decoder = ChunkedDecoder::new(1024);
            let mut out = Vec::new();

            let (consumed, done) = decoder.decode(&wire[..split], &mut out).unwrap();
            assert_eq!(consumed, split);
            let (_, done2) = decoder.decode(&wire[split..], &mut out).unwrap();

            assert!(done2 || done);
            assert_eq!(out, b"Wiki0123456789abcdef", "split at {split}");
        }
    }

    #[test]
    fn extensions_and_trailers_are_skipped() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut out = Vec::new();

        let wire = b"5;name=value\r\nhello\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let (consumed, done) = decoder.decode(wire, &mut out).unwrap();

        assert_eq!(consumed, wire.len());
        assert!(done);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn malformed_chunks_are_rejected() {
        #[rustfmt::skip]
        let cases: [&[u8]; 4] = [
            b"\r\nhello",        // no size digits
            b"zz\r\n",           // not hex
            b"5\rhello",         // missing LF after size
            b"1\r\na;\r\n",      // bad chunk terminator
        ];

        for wire in cases {
            let mut decoder = ChunkedDecoder::new(1024);
            let mut out = Vec::new();
            assert_eq!(
                decoder.decode(wire, &mut out).unwrap_err(),
                ProtocolError::InvalidChunk,
                "case: {wire:?}"
            );
        }
    }

    #[test]
    fn cap_applies_to_total_decoded_bytes() {
        // Two chunks of 6 against a cap of 10: the second chunk trips it.
        let mut decoder = ChunkedDecoder::new(10);
        let mut out = Vec::new();

        let wire = b"6\r\naaaaaa\r\n6\r\nbbbbbb\r\n0\r\n\r\n";
        assert_eq!(
            decoder.decode(wire, &mut out).unwrap_err(),
            ProtocolError::PayloadTooLarge
        );
    }

    #[test]
    fn empty_body() {
        let mut decoder = ChunkedDecoder::new(16);
        let mut out = Vec::new();

        let (consumed, done) = decoder.decode(b"0\r\n\r\n", &mut out).unwrap();
        assert_eq!(consumed, 5);
        assert!(done);
        assert!(out.is_empty());
    }
}
