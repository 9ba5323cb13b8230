//! Server configuration limits and timeouts
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Examples
//!
//! ```no_run
//! use aras::{Server, apps::TestApplication};
//! use aras::limits::{ConnLimits, HttpLimits, ServerLimits};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .app(TestApplication)
//!         .server_limits(ServerLimits {
//!             max_concurrency: 512,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             keep_alive_timeout: Duration::from_secs(5),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .http_limits(HttpLimits {
//!             max_size_kb: 64,
//!             ..HttpLimits::default()
//!         })
//!         .build()
//!         .serve("127.0.0.1:8080".parse().unwrap())
//!         .await
//!         .unwrap();
//! }
//! ```

use std::time::Duration;

/// Server-level concurrency, queueing and lifespan behavior.
///
/// # Connection management
///
/// Accepted connections go into a pending queue drained by a fixed pool of
/// worker tasks; each worker serves one connection at a time, so the pool
/// size is the cap on simultaneously executing handler tasks. When the
/// pending queue is full, dedicated responders reply `503` immediately.
/// Beyond `max_connections`, new sockets are refused abortively
/// (`SO_LINGER=0`) without a response.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, i.e. the maximum number of connections
    /// being served simultaneously (default: `128`).
    pub max_concurrency: usize,

    /// Maximum number of accepted connections waiting in the pending
    /// queue (default: `256`). Overflow receives an immediate `503`.
    pub max_pending: usize,

    /// Absolute cap on sockets the server will hold at once, pending and
    /// active combined (default: `1024`). Beyond it, connections are
    /// refused with an abortive close.
    pub max_connections: usize,

    /// Dedicated responders for queue overflow (default: `1`). Set to 0
    /// to silently drop overflow connections instead.
    pub count_503_handlers: usize,

    /// Strategy for worker waiting behavior when the pending queue is
    /// empty (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Wall-clock ceiling for a single handler task (default: none).
    /// On expiry the task is cancelled; if no response has started the
    /// client receives `504`.
    pub handler_timeout: Option<Duration>,

    /// How long to wait for the application's reply to
    /// `lifespan.startup` / `lifespan.shutdown` (default: `30 seconds`).
    pub lifespan_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 128,
            max_pending: 256,
            max_connections: 1024,
            count_503_handlers: 1,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            handler_timeout: None,
            lifespan_timeout: Duration::from_secs(30),

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are pending.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Busy-spin through [`tokio::task::yield_now()`]. Low latency, high
    /// idle CPU; not recommended outside benchmarks.
    Yield,

    /// Park through [`tokio::time::sleep()`] between queue polls.
    Sleep(Duration),
}

/// Connection-level limits and timeouts.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Whether connections are kept open across requests (default: `true`).
    /// When disabled every response carries `Connection: close` and the
    /// socket is closed after the final body byte.
    pub keep_alive: bool,

    /// Idle deadline between requests on a kept-alive connection
    /// (default: `5 seconds`, advertised as `Keep-Alive: timeout=5`).
    pub keep_alive_timeout: Duration,

    /// Once the first byte of a request has arrived, the full head must
    /// follow within this window (default: `10 seconds`). The primary
    /// slow-loris defense.
    pub slow_header_timeout: Duration,

    /// Maximum duration of a single socket write (default: `3 seconds`).
    pub socket_write_timeout: Duration,

    /// Requests served on one connection before it is retired
    /// (default: `1000`).
    pub max_requests_per_connection: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(5),
            slow_header_timeout: Duration::from_secs(10),
            socket_write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 1000,

            _priv: (),
        }
    }
}

/// HTTP parsing limits and the per-request memory bound.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Bound, in KiB, on the buffered bytes of a single request — head
    /// plus decoded body (default: `1_000_000`, i.e. ~1 GiB, matching the
    /// CLI default). Exceeding it yields `413 Payload Too Large`.
    pub max_size_kb: usize,

    /// Maximum request target length in bytes (default: `8192`).
    pub url_size: usize,

    /// Maximum number of headers per request (default: `64`).
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `256`).
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `8192`).
    pub header_value_size: usize,

    /// Capacity of the inbound message queue backing `receive`
    /// (default: `4`). When the handler stops consuming, socket reads
    /// pause once this many body chunks are buffered.
    pub inbound_queue: usize,

    /// Socket read granularity for body streaming (default: `64 KiB`).
    pub body_chunk_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_size_kb: 1_000_000,
            url_size: 8192,
            header_count: 64,
            header_name_size: 256,
            header_value_size: 8192,
            inbound_queue: 4,
            body_chunk_size: 64 * 1024,

            _priv: (),
        }
    }
}

impl HttpLimits {
    /// The request bound in bytes.
    #[inline(always)]
    pub fn max_bytes(&self) -> usize {
        self.max_size_kb.saturating_mul(1024)
    }
}

/// WebSocket session limits.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Cap on a reassembled message, in bytes. `None` (the default) uses
    /// the HTTP request bound. Exceeding it closes with `1009`.
    pub max_message_size: Option<usize>,

    /// How long to wait for the peer's close echo before dropping the
    /// socket (default: `500 ms`).
    pub close_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_message_size: None,
            close_timeout: Duration::from_millis(500),

            _priv: (),
        }
    }
}

/// Everything a connection needs to know, passed by value to workers.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub server: ServerLimits,
    pub conn: ConnLimits,
    pub http: HttpLimits,
    pub ws: WsLimits,
}

impl Limits {
    /// Effective WebSocket message cap.
    #[inline(always)]
    pub(crate) fn ws_message_cap(&self) -> usize {
        self.ws.max_message_size.unwrap_or_else(|| self.http.max_bytes())
    }
}
