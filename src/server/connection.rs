//! Per-connection protocol state: bytes in, bytes out, one request at a
//! time.
//!
//! A connection reads and parses request heads from its buffer, builds
//! the scope, spawns the application task for the request, and then pumps
//! concurrently: inbound body chunks into the `receive` channel (pausing
//! socket reads when the handler stops consuming) and outbound messages
//! from the `send` channel onto the wire. WebSocket upgrades switch the
//! connection into a frame pump for the rest of its life.

use crate::{
    asgi::{
        channel::{channel, ChannelDriver},
        message::{AppMessage, ServerMessage, WsData},
        scope::{self, Scope, ScopeParts, State},
    },
    errors::ProtocolError,
    http::{
        request::{parse_head, BodyFraming, ChunkedDecoder, RequestHead},
        response::{ResponseEncoder, CONTINUE_100},
        types::Method,
    },
    limits::Limits,
    server::server_impl::{AppError, Application, Counters},
    ws::{
        frame::{self, close_code, FrameError, OpCode},
        handshake,
    },
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{ReadHalf, WriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, timeout, Instant},
};
use tracing::{debug, error, warn};

const REJECT_403: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// How long a finished request waits for its application task to unwind
/// before aborting it.
const JOIN_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct Connection<A: Application> {
    app: Arc<A>,
    limits: Limits,
    id: u64,
    counters: Arc<Counters>,
    shutdown: watch::Receiver<bool>,
    /// Unparsed bytes read from the socket.
    buf: Vec<u8>,
    request_count: usize,
}

impl<A: Application> Connection<A> {
    pub(crate) fn new(
        app: Arc<A>,
        limits: Limits,
        id: u64,
        counters: Arc<Counters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            app,
            limits,
            id,
            counters,
            shutdown,
            buf: Vec::with_capacity(8 * 1024),
            request_count: 0,
        }
    }

    /// Serves the connection to completion. Protocol errors are answered
    /// with their canned response where one exists, then the socket is
    /// closed gracefully.
    pub(crate) async fn run(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        self.buf.clear();
        self.request_count = 0;

        let Ok(local) = stream.local_addr() else {
            return;
        };
        let state = State::new();

        match self.serve_conn(&mut stream, peer, local, state).await {
            Ok(()) => {}
            Err(error) => {
                warn!(conn = self.id, req = self.request_count, %error, "connection error");
                if let Some(response) = error.as_http() {
                    let _ = write_all_timed(
                        &mut stream,
                        response,
                        self.limits.conn.socket_write_timeout,
                    )
                    .await;
                }
            }
        }

        // Graceful close: half-close and give the peer a moment to FIN.
        if stream.shutdown().await.is_ok() {
            let mut scratch = [0u8; 256];
            let _ = timeout(Duration::from_millis(100), async {
                while matches!(stream.read(&mut scratch).await, Ok(n) if n > 0) {}
            })
            .await;
        }
    }

    async fn serve_conn(
        &mut self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        state: State,
    ) -> Result<(), ProtocolError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            let Some(head) = self.read_head(stream).await? else {
                return Ok(());
            };
            self.request_count += 1;

            let parts = ScopeParts {
                client: Some(peer),
                server: local,
                state: state.clone(),
            };

            if head.upgrade_websocket {
                return self.serve_websocket(stream, head, parts).await;
            }

            let keep_alive = self.serve_http(stream, head, parts).await?;
            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Reads until one full request head is buffered. `Ok(None)` means the
    /// peer closed cleanly between requests (or the server is draining).
    async fn read_head(
        &mut self,
        stream: &mut TcpStream,
    ) -> Result<Option<RequestHead>, ProtocolError> {
        // Idle wait between requests uses the keep-alive deadline; once
        // the first byte is in, the full head must arrive before the
        // slow-header deadline.
        let mut head_deadline = (!self.buf.is_empty())
            .then(|| Instant::now() + self.limits.conn.slow_header_timeout);

        loop {
            if let Some((head, consumed)) = parse_head(&self.buf, &self.limits.http)? {
                self.buf.drain(..consumed);
                return Ok(Some(head));
            }

            let window = match head_deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ProtocolError::Timeout);
                    }
                    remaining
                }
                None => self.limits.conn.keep_alive_timeout,
            };

            let n = tokio::select! {
                biased;
                read = timeout(window, stream.read_buf(&mut self.buf)) => {
                    read.map_err(|_| ProtocolError::Timeout)??
                }
                _ = self.shutdown.changed(), if head_deadline.is_none() => return Ok(None),
            };

            if n == 0 {
                return if self.buf.is_empty() && head_deadline.is_none() {
                    Ok(None)
                } else {
                    Err(ProtocolError::Disconnect)
                };
            }
            if head_deadline.is_none() {
                head_deadline = Some(Instant::now() + self.limits.conn.slow_header_timeout);
            }
        }
    }

    /// Drives one HTTP request. Returns whether the connection may be
    /// reused.
    async fn serve_http(
        &mut self,
        stream: &mut TcpStream,
        head: RequestHead,
        parts: ScopeParts,
    ) -> Result<bool, ProtocolError> {
        let policy_keep_alive = self.limits.conn.keep_alive
            && head.keep_alive
            && self.request_count < self.limits.conn.max_requests_per_connection;
        let head_request = head.method == Method::Head;
        let expect_continue = head.expect_continue;
        let framing = head.framing();

        let scope = Scope::Http(scope::build_http(&head, parts)?);
        let (driver, receiver, sender) = channel(self.limits.http.inbound_queue);
        let ChannelDriver { tx, mut rx, engaged } = driver;

        let _in_flight = Counters::track_request(&self.counters);
        let task = AppTask::spawn(&self.app, scope, receiver, sender);

        let chunk_size = self.limits.http.body_chunk_size;
        let body_cap = self.limits.http.max_bytes();
        let (mut read_half, mut write_half) = stream.split();
        let mut feed = BodyFeed::new(&mut read_half, &mut self.buf, framing, chunk_size, body_cap);
        let mut writer = ResponseWriter {
            w: &mut write_half,
            encoder: ResponseEncoder::new(policy_keep_alive, head_request),
            out: Vec::with_capacity(1024),
            write_timeout: self.limits.conn.socket_write_timeout,
            conn: self.id,
            req: self.request_count,
        };

        let limited = self.limits.server.handler_timeout.is_some();
        let deadline = Instant::now()
            + self
                .limits
                .server
                .handler_timeout
                .unwrap_or(Duration::from_secs(0));

        // The interim 100 response is written lazily, when the handler
        // first awaits `receive`. A handler that responds without ever
        // reading the body skips it entirely.
        let mut stashed: Option<AppMessage> = None;
        if expect_continue && feed.has_body() {
            tokio::select! {
                biased;
                maybe = rx.recv() => match maybe {
                    Some(msg) => stashed = Some(msg),
                    None => {}
                },
                _ = engaged.wait() => {
                    writer.write_raw(CONTINUE_100).await?;
                }
                _ = sleep_until(deadline), if limited => {}
            }
        }

        let mut outcome = DriveOutcome::AppDone;
        loop {
            if let Some(msg) = stashed.take() {
                if let Err(error) = writer.apply(msg).await {
                    outcome = DriveOutcome::Fatal(error);
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;
                maybe = rx.recv() => match maybe {
                    Some(msg) => stashed = Some(msg),
                    None => break,
                },
                fed = feed.feed(&tx), if !feed.done() => match fed {
                    Ok(()) => {}
                    Err(ProtocolError::Disconnect) => {
                        outcome = DriveOutcome::PeerGone;
                        break;
                    }
                    Err(error) => {
                        outcome = DriveOutcome::Fatal(error);
                        break;
                    }
                },
                _ = sleep_until(deadline), if limited => {
                    outcome = DriveOutcome::TimedOut;
                    break;
                }
            }
        }

        let body_consumed = feed.consumed_all();
        drop(feed);

        match outcome {
            DriveOutcome::AppDone => {
                drop(tx);
                drop(rx);
                let finished = task.join(JOIN_GRACE).await;
                self.finish_http(&mut writer, finished, body_consumed).await
            }
            DriveOutcome::PeerGone => {
                debug!(conn = self.id, req = self.request_count, "peer disconnected mid-request");
                let _ = tx.try_send(ServerMessage::HttpDisconnect);
                task.abort();
                Ok(false)
            }
            DriveOutcome::TimedOut => {
                warn!(conn = self.id, req = self.request_count, "handler timed out");
                task.abort();
                if !writer.encoder.started() {
                    let canned = ProtocolError::HandlerTimeout.as_http();
                    writer.write_raw(canned.unwrap_or_default()).await?;
                }
                Ok(false)
            }
            DriveOutcome::Fatal(error) => {
                warn!(conn = self.id, req = self.request_count, %error, "request failed");
                task.abort();
                if !writer.encoder.started() {
                    if let Some(canned) = error.as_http() {
                        writer.write_raw(canned).await?;
                    }
                }
                Ok(false)
            }
        }
    }

    /// Epilogue after the application side of a request finished.
    async fn finish_http(
        &mut self,
        writer: &mut ResponseWriter<'_, '_>,
        finished: AppOutcome,
        body_consumed: bool,
    ) -> Result<bool, ProtocolError> {
        match finished {
            AppOutcome::Completed => {
                if !writer.encoder.started() {
                    warn!(
                        conn = self.id,
                        req = self.request_count,
                        "handler finished without sending a response"
                    );
                    writer
                        .write_raw(ProtocolError::HandlerFault.as_http().unwrap_or_default())
                        .await?;
                    return Ok(false);
                }
                if !writer.encoder.complete() {
                    warn!(
                        conn = self.id,
                        req = self.request_count,
                        "handler finished mid-response"
                    );
                    return Ok(false);
                }
                Ok(writer.encoder.keep_alive() && body_consumed)
            }
            AppOutcome::Failed(error) => {
                error!(conn = self.id, req = self.request_count, %error, "handler error");
                if !writer.encoder.started() {
                    writer
                        .write_raw(ProtocolError::HandlerFault.as_http().unwrap_or_default())
                        .await?;
                }
                Ok(false)
            }
            AppOutcome::Panicked => {
                error!(conn = self.id, req = self.request_count, "handler panicked");
                if !writer.encoder.started() {
                    writer
                        .write_raw(ProtocolError::HandlerFault.as_http().unwrap_or_default())
                        .await?;
                }
                Ok(false)
            }
            AppOutcome::Unfinished => {
                warn!(
                    conn = self.id,
                    req = self.request_count,
                    "handler kept running after its channels closed"
                );
                Ok(false)
            }
        }
    }

    /// Runs a WebSocket session; the connection never returns to HTTP.
    async fn serve_websocket(
        &mut self,
        stream: &mut TcpStream,
        head: RequestHead,
        parts: ScopeParts,
    ) -> Result<(), ProtocolError> {
        let shake = match handshake::validate(&head) {
            Ok(shake) => shake,
            Err(reason) => {
                warn!(conn = self.id, reason, "websocket handshake rejected");
                return Err(ProtocolError::InvalidHeader);
            }
        };

        let scope = scope::build_websocket(&head, shake.subprotocols.clone(), parts)?;
        let (driver, receiver, sender) = channel(self.limits.http.inbound_queue);
        let ChannelDriver { tx, mut rx, .. } = driver;

        let _in_flight = Counters::track_request(&self.counters);
        let task = AppTask::spawn(&self.app, Scope::WebSocket(scope), receiver, sender);
        let write_timeout = self.limits.conn.socket_write_timeout;

        if tx.send(ServerMessage::WebSocketConnect).await.is_err() {
            task.abort();
            return Err(ProtocolError::HandlerFault);
        }

        // The handler must answer the connect with accept or close.
        match rx.recv().await {
            Some(AppMessage::WebSocketAccept {
                subprotocol,
                headers,
            }) => {
                let mut out = Vec::with_capacity(256);
                handshake::response(&shake.key, subprotocol.as_deref(), &headers, &mut out);
                write_all_timed(stream, &out, write_timeout).await?;
            }
            Some(AppMessage::WebSocketClose { .. }) => {
                write_all_timed(stream, REJECT_403, write_timeout).await?;
                task.abort();
                return Ok(());
            }
            Some(other) => {
                task.abort();
                warn!(conn = self.id, kind = other.kind(), "unexpected answer to websocket.connect");
                return Err(ProtocolError::InvalidMessage(
                    "websocket.connect must be answered with accept or close",
                ));
            }
            None => {
                task.abort();
                return Err(ProtocolError::HandlerFault);
            }
        }

        let result = self.pump_websocket(stream, &tx, &mut rx, &task).await;
        drop(tx);
        drop(rx);
        task.join(JOIN_GRACE).await;
        result
    }

    async fn pump_websocket(
        &mut self,
        stream: &mut TcpStream,
        tx: &mpsc::Sender<ServerMessage>,
        rx: &mut mpsc::Receiver<AppMessage>,
        task: &AppTask,
    ) -> Result<(), ProtocolError> {
        let write_timeout = self.limits.conn.socket_write_timeout;
        let close_timeout = self.limits.ws.close_timeout;
        let cap = self.limits.ws_message_cap();
        let conn = self.id;

        let limited = self.limits.server.handler_timeout.is_some();
        let deadline = Instant::now()
            + self
                .limits
                .server
                .handler_timeout
                .unwrap_or(Duration::from_secs(0));

        let (mut read_half, mut write_half) = stream.split();
        let mut reader = WsReader {
            r: &mut read_half,
            buf: &mut self.buf,
            cap,
            fragment: None,
        };
        let mut shutdown = self.shutdown.clone();
        let mut out = Vec::with_capacity(1024);

        loop {
            out.clear();
            tokio::select! {
                biased;
                maybe = rx.recv() => match maybe {
                    Some(AppMessage::WebSocketSend(data)) => {
                        match &data {
                            WsData::Text(text) => frame::encode(OpCode::Text, text.as_bytes(), true, &mut out),
                            WsData::Binary(bytes) => frame::encode(OpCode::Binary, bytes, true, &mut out),
                        }
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                    }
                    Some(AppMessage::WebSocketClose { code, reason }) => {
                        frame::encode_close(code, &reason, &mut out);
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                        let _ = timeout(close_timeout, reader.drain_until_close()).await;
                        return Ok(());
                    }
                    Some(other) => {
                        warn!(conn, kind = other.kind(), "invalid message on a websocket session");
                        task.abort();
                        return Err(ProtocolError::InvalidMessage(
                            "only websocket.send and websocket.close are valid after accept",
                        ));
                    }
                    None => {
                        // Application finished without closing; close for it.
                        frame::encode_close(close_code::NORMAL, "", &mut out);
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                        let _ = timeout(close_timeout, reader.drain_until_close()).await;
                        return Ok(());
                    }
                },
                event = reader.next_event() => match event {
                    Ok(WsEvent::Message(data)) => {
                        if !deliver(tx, rx, &mut write_half, ServerMessage::WebSocketReceive(data), write_timeout).await? {
                            return Ok(());
                        }
                    }
                    Ok(WsEvent::Ping(payload)) => {
                        frame::encode(OpCode::Pong, &payload, true, &mut out);
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                    }
                    Ok(WsEvent::Pong) => {}
                    Ok(WsEvent::Close(code)) => {
                        let _ = tx.try_send(ServerMessage::WebSocketDisconnect { code });
                        if code == close_code::NO_STATUS {
                            frame::encode(OpCode::Close, b"", true, &mut out);
                        } else {
                            frame::encode_close(code, "", &mut out);
                        }
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                        return Ok(());
                    }
                    Err(WsReadError::Frame(frame_error)) => {
                        let code = frame_error.close_code();
                        debug!(conn, code, "websocket protocol violation");
                        let _ = tx.try_send(ServerMessage::WebSocketDisconnect { code });
                        frame::encode_close(code, "", &mut out);
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                        return Ok(());
                    }
                    Err(WsReadError::Utf8) => {
                        let code = close_code::INVALID_PAYLOAD;
                        let _ = tx.try_send(ServerMessage::WebSocketDisconnect { code });
                        frame::encode_close(code, "", &mut out);
                        write_all_timed(&mut write_half, &out, write_timeout).await?;
                        return Ok(());
                    }
                    Err(WsReadError::Eof) => {
                        let _ = tx.try_send(ServerMessage::WebSocketDisconnect {
                            code: close_code::ABNORMAL,
                        });
                        return Ok(());
                    }
                    Err(WsReadError::Io(err)) => return Err(err.into()),
                },
                _ = shutdown.changed() => {
                    frame::encode_close(1001, "server shutting down", &mut out);
                    write_all_timed(&mut write_half, &out, write_timeout).await?;
                    let _ = tx.try_send(ServerMessage::WebSocketDisconnect { code: 1001 });
                    return Ok(());
                }
                _ = sleep_until(deadline), if limited => {
                    frame::encode_close(1001, "session deadline", &mut out);
                    write_all_timed(&mut write_half, &out, write_timeout).await?;
                    task.abort();
                    return Ok(());
                }
            }
        }
    }
}

/// Delivers one inbound message while still pumping the handler's
/// outbound sends, so neither side can deadlock the other. Returns
/// `false` when the handler closed the session during delivery.
async fn deliver(
    tx: &mpsc::Sender<ServerMessage>,
    rx: &mut mpsc::Receiver<AppMessage>,
    w: &mut WriteHalf<'_>,
    message: ServerMessage,
    write_timeout: Duration,
) -> Result<bool, ProtocolError> {
    let mut pending = Some(message);
    let mut out = Vec::new();

    while let Some(message) = pending.take() {
        tokio::select! {
            permit = tx.reserve() => match permit {
                Ok(permit) => permit.send(message),
                Err(_) => return Ok(true),
            },
            maybe = rx.recv() => match maybe {
                Some(AppMessage::WebSocketSend(data)) => {
                    out.clear();
                    match &data {
                        WsData::Text(text) => frame::encode(OpCode::Text, text.as_bytes(), true, &mut out),
                        WsData::Binary(bytes) => frame::encode(OpCode::Binary, bytes, true, &mut out),
                    }
                    write_all_timed(w, &out, write_timeout).await?;
                    pending = Some(message);
                }
                Some(AppMessage::WebSocketClose { code, reason }) => {
                    out.clear();
                    frame::encode_close(code, &reason, &mut out);
                    write_all_timed(w, &out, write_timeout).await?;
                    return Ok(false);
                }
                Some(other) => {
                    warn!(kind = other.kind(), "invalid message on a websocket session");
                    return Err(ProtocolError::InvalidMessage(
                        "only websocket.send and websocket.close are valid after accept",
                    ));
                }
                None => return Ok(false),
            },
        }
    }

    Ok(true)
}

enum DriveOutcome {
    AppDone,
    PeerGone,
    TimedOut,
    Fatal(ProtocolError),
}

// BODY FEEDING

enum FeedState {
    Empty,
    Length {
        remaining: usize,
    },
    Chunked {
        decoder: ChunkedDecoder,
        /// Decoded-but-undelivered bytes. Lives in the state, not on the
        /// stack, so a cancelled feed loses nothing.
        pending: Vec<u8>,
    },
    Done,
}

/// Streams the request body into the inbound channel. A queue slot is
/// reserved before any socket read, so a handler that stops consuming
/// pauses reads and backpressure reaches the peer's TCP stream.
struct BodyFeed<'a, 'b> {
    r: &'a mut ReadHalf<'b>,
    buf: &'a mut Vec<u8>,
    state: FeedState,
    chunk_size: usize,
    /// Whether the final body chunk has been delivered, i.e. the wire is
    /// clean and the connection may be reused.
    fed_all: bool,
}

impl<'a, 'b> BodyFeed<'a, 'b> {
    fn new(
        r: &'a mut ReadHalf<'b>,
        buf: &'a mut Vec<u8>,
        framing: BodyFraming,
        chunk_size: usize,
        cap: usize,
    ) -> Self {
        let state = match framing {
            BodyFraming::Empty => FeedState::Empty,
            BodyFraming::Length(len) => FeedState::Length { remaining: len },
            // The cap applies to the total decoded bytes.
            BodyFraming::Chunked => FeedState::Chunked {
                decoder: ChunkedDecoder::new(cap),
                pending: Vec::new(),
            },
        };

        Self {
            r,
            buf,
            // An empty body leaves nothing unread on the wire.
            fed_all: matches!(state, FeedState::Empty),
            state,
            chunk_size,
        }
    }

    #[inline]
    fn done(&self) -> bool {
        matches!(self.state, FeedState::Done)
    }

    #[inline]
    fn consumed_all(&self) -> bool {
        self.fed_all
    }

    #[inline]
    fn has_body(&self) -> bool {
        !matches!(self.state, FeedState::Empty | FeedState::Done)
    }

    /// Pushes the next `http.request` message. Cancellation-safe: the
    /// queue slot is reserved first and decoder state only advances
    /// between await points.
    async fn feed(&mut self, tx: &mpsc::Sender<ServerMessage>) -> Result<(), ProtocolError> {
        let Ok(permit) = tx.reserve().await else {
            // Receiver dropped; whatever body is left stays unread and
            // the connection will not be reused.
            self.state = FeedState::Done;
            return Ok(());
        };

        let message = self.next_message().await?;
        if matches!(
            message,
            ServerMessage::HttpRequest {
                more_body: false,
                ..
            }
        ) {
            self.state = FeedState::Done;
            self.fed_all = true;
        }
        permit.send(message);
        Ok(())
    }

    async fn next_message(&mut self) -> Result<ServerMessage, ProtocolError> {
        match &mut self.state {
            FeedState::Empty => {
                self.state = FeedState::Done;
                Ok(ServerMessage::HttpRequest {
                    body: Vec::new(),
                    more_body: false,
                })
            }
            FeedState::Length { remaining } => {
                if self.buf.is_empty() {
                    let n = self.r.read_buf(self.buf).await?;
                    if n == 0 {
                        return Err(ProtocolError::Disconnect);
                    }
                }

                let take = (*remaining).min(self.buf.len()).min(self.chunk_size);
                let body: Vec<u8> = self.buf.drain(..take).collect();
                *remaining -= take;

                Ok(ServerMessage::HttpRequest {
                    body,
                    more_body: *remaining > 0,
                })
            }
            FeedState::Chunked { decoder, pending } => loop {
                if !self.buf.is_empty() {
                    let (consumed, done) = decoder.decode(self.buf, pending)?;
                    self.buf.drain(..consumed);
                    if done {
                        return Ok(ServerMessage::HttpRequest {
                            body: std::mem::take(pending),
                            more_body: false,
                        });
                    }
                }
                if pending.len() >= self.chunk_size || (!pending.is_empty() && self.buf.is_empty())
                {
                    return Ok(ServerMessage::HttpRequest {
                        body: std::mem::take(pending),
                        more_body: true,
                    });
                }

                let n = self.r.read_buf(self.buf).await?;
                if n == 0 {
                    return Err(ProtocolError::Disconnect);
                }
            },
            FeedState::Done => Ok(ServerMessage::HttpRequest {
                body: Vec::new(),
                more_body: false,
            }),
        }
    }
}

// RESPONSE WRITING

struct ResponseWriter<'a, 'b> {
    w: &'a mut WriteHalf<'b>,
    encoder: ResponseEncoder,
    out: Vec<u8>,
    write_timeout: Duration,
    conn: u64,
    req: usize,
}

impl ResponseWriter<'_, '_> {
    async fn apply(&mut self, message: AppMessage) -> Result<(), ProtocolError> {
        self.out.clear();
        match message {
            AppMessage::ResponseStart {
                status, headers, ..
            } => {
                self.encoder.encode_start(status, &headers, &mut self.out)?;
            }
            AppMessage::ResponseBody { body, more_body } => {
                let discarded = self.encoder.encode_body(&body, more_body, &mut self.out)?;
                if discarded {
                    warn!(
                        conn = self.conn,
                        req = self.req,
                        status = self.encoder.status(),
                        "discarding body bytes of a bodyless status"
                    );
                }
            }
            other => {
                warn!(conn = self.conn, req = self.req, kind = other.kind(), "invalid message on an http request");
                return Err(ProtocolError::InvalidMessage(
                    "only http.response.start and http.response.body are valid on an http request",
                ));
            }
        }

        if !self.out.is_empty() {
            write_all_timed(self.w, &self.out, self.write_timeout).await?;
        }
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        write_all_timed(self.w, bytes, self.write_timeout).await
    }
}

async fn write_all_timed<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    bytes: &[u8],
    write_timeout: Duration,
) -> Result<(), ProtocolError> {
    tokio::select! {
        biased;
        result = w.write_all(bytes) => result.map_err(ProtocolError::from),
        _ = sleep(write_timeout) => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write timeout",
        ))),
    }
}

// WEBSOCKET READING

enum WsEvent {
    Message(WsData),
    Ping(Vec<u8>),
    Pong,
    Close(u16),
}

enum WsReadError {
    Frame(FrameError),
    Utf8,
    Eof,
    Io(io::Error),
}

struct WsReader<'a, 'b> {
    r: &'a mut ReadHalf<'b>,
    buf: &'a mut Vec<u8>,
    cap: usize,
    fragment: Option<(OpCode, Vec<u8>)>,
}

impl WsReader<'_, '_> {
    /// Reads frames until one deliverable event is assembled. Fragmented
    /// messages are joined up to the message cap.
    async fn next_event(&mut self) -> Result<WsEvent, WsReadError> {
        loop {
            while let Some((frame, consumed)) =
                frame::parse(self.buf, self.cap).map_err(WsReadError::Frame)?
            {
                self.buf.drain(..consumed);

                match frame.opcode {
                    OpCode::Ping => return Ok(WsEvent::Ping(frame.payload)),
                    OpCode::Pong => return Ok(WsEvent::Pong),
                    OpCode::Close => {
                        let code = frame::parse_close_code(&frame.payload)
                            .map_err(WsReadError::Frame)?;
                        return Ok(WsEvent::Close(code));
                    }
                    OpCode::Text | OpCode::Binary => {
                        if self.fragment.is_some() {
                            return Err(WsReadError::Frame(FrameError::Protocol(
                                "data frame interleaved in a fragmented message",
                            )));
                        }
                        if frame.fin {
                            return finish_message(frame.opcode, frame.payload);
                        }
                        self.fragment = Some((frame.opcode, frame.payload));
                    }
                    OpCode::Continuation => {
                        let Some((opcode, mut assembled)) = self.fragment.take() else {
                            return Err(WsReadError::Frame(FrameError::Protocol(
                                "continuation without a started message",
                            )));
                        };
                        assembled.extend_from_slice(&frame.payload);
                        if assembled.len() > self.cap {
                            return Err(WsReadError::Frame(FrameError::TooBig));
                        }
                        if frame.fin {
                            return finish_message(opcode, assembled);
                        }
                        self.fragment = Some((opcode, assembled));
                    }
                }
            }

            match self.r.read_buf(self.buf).await {
                Ok(0) => return Err(WsReadError::Eof),
                Ok(_) => {}
                Err(err) => return Err(WsReadError::Io(err)),
            }
        }
    }

    /// Consumes frames until the peer's close echo (or EOF).
    async fn drain_until_close(&mut self) {
        loop {
            match self.next_event().await {
                Ok(WsEvent::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn finish_message(opcode: OpCode, payload: Vec<u8>) -> Result<WsEvent, WsReadError> {
    match opcode {
        OpCode::Text => match simdutf8::basic::from_utf8(&payload) {
            Ok(text) => Ok(WsEvent::Message(WsData::Text(text.to_owned()))),
            Err(_) => Err(WsReadError::Utf8),
        },
        _ => Ok(WsEvent::Message(WsData::Binary(payload))),
    }
}

// APPLICATION TASKS

enum AppOutcome {
    Completed,
    Failed(AppError),
    Panicked,
    Unfinished,
}

/// One spawned application task. Aborted on drop, so every early return
/// of the drive tears the handler down with it.
struct AppTask {
    handle: JoinHandle<Result<(), AppError>>,
}

impl AppTask {
    fn spawn<A: Application>(
        app: &Arc<A>,
        scope: Scope,
        receiver: crate::asgi::channel::Receiver,
        sender: crate::asgi::channel::Sender,
    ) -> Self {
        let app = app.clone();
        let handle = tokio::spawn(async move { app.call(scope, receiver, sender).await });
        Self { handle }
    }

    fn abort(&self) {
        self.handle.abort();
    }

    async fn join(mut self, grace: Duration) -> AppOutcome {
        match timeout(grace, &mut self.handle).await {
            Err(_) => {
                self.handle.abort();
                AppOutcome::Unfinished
            }
            Ok(Ok(Ok(()))) => AppOutcome::Completed,
            Ok(Ok(Err(error))) => AppOutcome::Failed(error),
            Ok(Err(join_error)) if join_error.is_panic() => AppOutcome::Panicked,
            Ok(Err(_)) => AppOutcome::Unfinished,
        }
    }
}

impl Drop for AppTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
