use std::{error, fmt, io};

/// Protocol-level failures of a single connection and the faults a handler
/// task can produce. Each kind maps onto one disposition: a canned error
/// response followed by close, or a silent close.
#[derive(Debug)]
pub(crate) enum ProtocolError {
    InvalidRequestLine,
    InvalidMethod,
    InvalidUrl,

    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    ConflictingFraming,
    InvalidChunk,

    PayloadTooLarge,

    /// Headers did not arrive within the slow-header window, or the
    /// keep-alive idle deadline passed. Closed without a response.
    Timeout,
    /// Peer went away mid-request.
    Disconnect,

    /// Handler raised (or finished without a response) before
    /// `http.response.start`.
    HandlerFault,
    /// Handler exceeded the configured wall-clock ceiling.
    HandlerTimeout,
    /// Handler violated the message sequence; the reason is logged and the
    /// connection closed without a response.
    InvalidMessage(&'static str),

    ServiceUnavailable,
    Io(io::Error),
}

macro_rules! http_errors {
    ($($name:ident: $status_line:expr, $len:literal => $body:literal; )*) => {
        /// Canned response bytes for kinds that answer before closing.
        /// Kinds that close silently return `None`.
        pub(crate) const fn as_http(&self) -> Option<&'static [u8]> {
            match self { $(
                Self::$name { .. } => Some(concat!(
                    "HTTP/1.1 ", $status_line, "\r\n",
                    "Connection: close\r\n",
                    "Content-Type: text/plain\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "\r\n",
                    $body
                ).as_bytes()),
            )*
                _ => None,
            }
        }
    };
}

impl ProtocolError {
    http_errors! {
        InvalidRequestLine: "400 Bad Request", "11" => "Bad Request";
        InvalidMethod: "400 Bad Request", "11" => "Bad Request";
        InvalidUrl: "400 Bad Request", "11" => "Bad Request";
        InvalidHeader: "400 Bad Request", "11" => "Bad Request";
        InvalidContentLength: "400 Bad Request", "11" => "Bad Request";
        ConflictingFraming: "400 Bad Request", "11" => "Bad Request";
        InvalidChunk: "400 Bad Request", "11" => "Bad Request";

        UnsupportedVersion: "505 HTTP Version Not Supported", "26"
            => "HTTP Version Not Supported";
        TooManyHeaders: "431 Request Header Fields Too Large", "31"
            => "Request Header Fields Too Large";
        PayloadTooLarge: "413 Payload Too Large", "17" => "Payload Too Large";

        HandlerFault: "500 Internal Server Error", "21" => "Internal Server Error";
        HandlerTimeout: "504 Gateway Timeout", "15" => "Gateway Timeout";
        ServiceUnavailable: "503 Service Unavailable", "19" => "Service Unavailable";
    }
}

impl error::Error for ProtocolError {}
impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMessage(reason) => write!(f, "invalid application message: {reason}"),
            Self::Io(err) => write!(f, "i/o error: {err}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl PartialEq for ProtocolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::InvalidMessage(a), Self::InvalidMessage(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

/// Failure of the server entry point, before any connection is served.
/// The CLI maps these onto its exit codes.
#[derive(Debug)]
pub enum ServeError {
    /// The application rejected `lifespan.startup` (or the dialogue timed
    /// out after being engaged). The listening socket is never bound.
    Lifespan(String),
    /// Binding the listening socket failed.
    Bind(io::Error),
}

impl error::Error for ServeError {}
impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifespan(message) => write!(f, "application startup failed: {message}"),
            Self::Bind(err) => write!(f, "failed to bind listening socket: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The macro hardcodes each content-length; keep them honest.
    #[test]
    fn canned_content_lengths() {
        let responding = [
            ProtocolError::InvalidRequestLine,
            ProtocolError::InvalidMethod,
            ProtocolError::InvalidUrl,
            ProtocolError::InvalidHeader,
            ProtocolError::InvalidContentLength,
            ProtocolError::ConflictingFraming,
            ProtocolError::InvalidChunk,
            ProtocolError::UnsupportedVersion,
            ProtocolError::TooManyHeaders,
            ProtocolError::PayloadTooLarge,
            ProtocolError::HandlerFault,
            ProtocolError::HandlerTimeout,
            ProtocolError::ServiceUnavailable,
        ];

        for error in responding {
            let response = std::str::from_utf8(error.as_http().unwrap()).unwrap();
            let (head, body) = response.split_once("\r\n\r\n").unwrap();

            let declared: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length: "))
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(declared, body.len(), "length mismatch in {error:?}");
        }
    }

    #[test]
    fn silent_kinds_have_no_response() {
        for error in [
            ProtocolError::Timeout,
            ProtocolError::Disconnect,
            ProtocolError::InvalidMessage("body before start"),
            ProtocolError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
        ] {
            assert!(error.as_http().is_none());
        }
    }

    #[test]
    fn handler_fault_body() {
        let response = std::str::from_utf8(ProtocolError::HandlerFault.as_http().unwrap()).unwrap();
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.ends_with("\r\n\r\nInternal Server Error"));
    }
}
