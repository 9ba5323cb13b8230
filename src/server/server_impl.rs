use crate::{
    asgi::{
        channel::{Receiver, Sender},
        scope::Scope,
    },
    errors::{ProtocolError, ServeError},
    limits::{Limits, WaitStrategy},
    server::{connection::Connection, lifespan},
};
use crossbeam::queue::SegQueue;
use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    task::yield_now,
    time::sleep,
};
use tracing::{debug, info, warn};

/// Error type applications report back to the server. A returned error
/// before `http.response.start` yields a `500`; after it, the connection
/// is closed.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// The application contract: one asynchronous callable taking the scope
/// and the two channel endpoints. The server supplies all three.
///
/// # Examples
///
/// ```
/// use aras::{AppError, Application, AppMessage, Receiver, Scope, Sender, ServerMessage};
///
/// struct HelloApp;
///
/// impl Application for HelloApp {
///     async fn call(
///         &self,
///         scope: Scope,
///         mut receive: Receiver,
///         send: Sender,
///     ) -> Result<(), AppError> {
///         match scope {
///             Scope::Http(_) => {
///                 // Drain the request body.
///                 while let ServerMessage::HttpRequest { more_body: true, .. } =
///                     receive.next().await?
///                 {}
///
///                 send.send(AppMessage::ResponseStart {
///                     status: 200,
///                     headers: vec![(b"content-length".to_vec(), b"5".to_vec())],
///                     trailers: false,
///                 })
///                 .await?;
///                 send.send(AppMessage::ResponseBody {
///                     body: b"hello".to_vec(),
///                     more_body: false,
///                 })
///                 .await?;
///             }
///             Scope::Lifespan(_) => loop {
///                 match receive.next().await? {
///                     ServerMessage::LifespanStartup => {
///                         send.send(AppMessage::StartupComplete).await?
///                     }
///                     ServerMessage::LifespanShutdown => {
///                         send.send(AppMessage::ShutdownComplete).await?;
///                         return Ok(());
///                     }
///                     _ => return Ok(()),
///                 }
///             },
///             Scope::WebSocket(_) => {}
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Global admission counters. All updates go through RAII guards so the
/// numbers stay honest on every exit path.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    live_connections: AtomicUsize,
    in_flight: AtomicUsize,
    next_connection_id: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track_connection(counters: &Arc<Self>) -> CounterGuard {
        counters.live_connections.fetch_add(1, Ordering::SeqCst);
        CounterGuard {
            counters: counters.clone(),
            connection: true,
        }
    }

    pub(crate) fn track_request(counters: &Arc<Self>) -> CounterGuard {
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        CounterGuard {
            counters: counters.clone(),
            connection: false,
        }
    }
}

pub(crate) struct CounterGuard {
    counters: Arc<Counters>,
    connection: bool,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        let counter = if self.connection {
            &self.counters.live_connections
        } else {
            &self.counters.in_flight
        };
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

/// The server: an application plus its limits.
///
/// # Examples
///
/// ```no_run
/// use aras::{apps::TestApplication, Server};
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .app(TestApplication)
///         .build()
///         .serve("127.0.0.1:8080".parse().unwrap())
///         .await
///         .unwrap();
/// }
/// ```
pub struct Server<A: Application> {
    app: Arc<A>,
    limits: Limits,
}

impl<A: Application> Server<A> {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder<A> {
        ServerBuilder {
            app: None,
            limits: Limits::default(),
        }
    }

    /// Runs the lifespan startup dialogue, binds, serves until a shutdown
    /// signal (SIGINT/SIGTERM) arrives, then runs the shutdown dialogue.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), ServeError> {
        self.prepare(addr).await?.run().await;
        Ok(())
    }

    /// First half of [`serve`](Self::serve): the startup dialogue and the
    /// bind. On success the returned server is listening but not yet
    /// accepting; on failure the port is never bound.
    pub async fn prepare(self, addr: SocketAddr) -> Result<RunningServer<A>, ServeError> {
        let lifespan = lifespan::startup(&self.app, &self.limits).await?;
        info!("Application startup complete");

        let listener = TcpListener::bind(addr).await.map_err(ServeError::Bind)?;
        let local = listener.local_addr().map_err(ServeError::Bind)?;
        info!(addr = %local, "listening");

        Ok(RunningServer {
            app: self.app,
            limits: self.limits,
            listener,
            lifespan,
        })
    }
}

/// A server that has completed startup and holds its listening socket.
pub struct RunningServer<A: Application> {
    app: Arc<A>,
    limits: Limits,
    listener: TcpListener,
    lifespan: lifespan::LifespanHandle,
}

impl<A: Application> RunningServer<A> {
    /// The bound address, useful when serving on port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections until SIGINT/SIGTERM, then drains.
    pub async fn run(self) {
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stream_queue: TcpQueue = Arc::new(SegQueue::new());
        let error_queue: TcpQueue = Arc::new(SegQueue::new());

        for _ in 0..self.limits.server.max_concurrency {
            spawn_worker(&stream_queue, &self.app, &self.limits, &counters, &shutdown_rx);
        }
        if self.limits.server.count_503_handlers == 0 {
            spawn_quiet_alarmist(&error_queue, &self.limits, &shutdown_rx);
        } else {
            for _ in 0..self.limits.server.count_503_handlers {
                spawn_alarmist(&error_queue, &self.limits, &shutdown_rx);
            }
        }

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let Ok((stream, addr)) = accepted else {
                        continue;
                    };
                    self.admit(stream, addr, &counters, &stream_queue, &error_queue);
                }
                _ = &mut shutdown => break,
            }
        }

        info!("shutting down");
        drop(self.listener);
        let _ = shutdown_tx.send(true);

        lifespan::shutdown(self.lifespan, &self.limits).await;
        drain(&counters, Duration::from_secs(5)).await;
    }

    /// Admission: refuse abortively over the absolute cap, queue up to
    /// the pending bound, 503 beyond it.
    fn admit(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        counters: &Arc<Counters>,
        stream_queue: &TcpQueue,
        error_queue: &TcpQueue,
    ) {
        let held = counters.live_connections() + stream_queue.len() + error_queue.len();
        if held >= self.limits.server.max_connections {
            debug!(%addr, "refusing connection over the connection cap");
            refuse(stream);
        } else if stream_queue.len() < self.limits.server.max_pending {
            stream_queue.push((stream, addr));
        } else {
            error_queue.push((stream, addr));
        }
    }
}

/// Abortive close: RST instead of FIN, nothing buffered, nothing sent.
fn refuse(stream: TcpStream) {
    let sock = socket2::SockRef::from(&stream);
    let _ = sock.set_linger(Some(Duration::from_secs(0)));
    drop(stream);
}

fn spawn_worker<A: Application>(
    queue: &TcpQueue,
    app: &Arc<A>,
    limits: &Limits,
    counters: &Arc<Counters>,
    shutdown: &watch::Receiver<bool>,
) {
    let queue = queue.clone();
    let app = app.clone();
    let limits = limits.clone();
    let counters = counters.clone();
    let mut shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let Some((stream, addr)) =
                get_stream(&queue, &limits.server.wait_strategy, &mut shutdown).await
            else {
                break;
            };

            let _live = Counters::track_connection(&counters);
            let id = counters.next_connection_id();
            let mut conn =
                Connection::new(app.clone(), limits.clone(), id, counters.clone(), shutdown.clone());
            conn.run(stream, addr).await;
        }
    });
}

fn spawn_alarmist(queue: &TcpQueue, limits: &Limits, shutdown: &watch::Receiver<bool>) {
    let queue = queue.clone();
    let limits = limits.clone();
    let mut shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let Some((mut stream, addr)) =
                get_stream(&queue, &limits.server.wait_strategy, &mut shutdown).await
            else {
                break;
            };

            warn!(%addr, "pending queue full, replying 503");
            let response = ProtocolError::ServiceUnavailable.as_http().unwrap_or_default();
            let _ = tokio::time::timeout(
                limits.conn.socket_write_timeout,
                stream.write_all(response),
            )
            .await;
        }
    });
}

fn spawn_quiet_alarmist(queue: &TcpQueue, limits: &Limits, shutdown: &watch::Receiver<bool>) {
    let queue = queue.clone();
    let limits = limits.clone();
    let mut shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let Some((stream, _)) =
                get_stream(&queue, &limits.server.wait_strategy, &mut shutdown).await
            else {
                break;
            };

            drop(stream);
        }
    });
}

async fn get_stream(
    queue: &TcpQueue,
    wait: &WaitStrategy,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        if let Some(value) = queue.pop() {
            return Some(value);
        }
        if *shutdown.borrow() {
            return None;
        }

        match wait {
            WaitStrategy::Yield => yield_now().await,
            WaitStrategy::Sleep(time) => sleep(*time).await,
        }
    }
}

async fn drain(counters: &Arc<Counters>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while counters.in_flight() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(in_flight = counters.in_flight(), "drain deadline reached");
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<A: Application> {
    app: Option<Arc<A>>,
    limits: Limits,
}

impl<A: Application> ServerBuilder<A> {
    /// Sets the application that will receive every scope.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn app(mut self, app: A) -> Self {
        self.app = Some(Arc::new(app));
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: crate::limits::ServerLimits) -> Self {
        self.limits.server = limits;
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: crate::limits::ConnLimits) -> Self {
        self.limits.conn = limits;
        self
    }

    #[inline(always)]
    pub fn http_limits(mut self, limits: crate::limits::HttpLimits) -> Self {
        self.limits.http = limits;
        self
    }

    #[inline(always)]
    pub fn ws_limits(mut self, limits: crate::limits::WsLimits) -> Self {
        self.limits.ws = limits;
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Panics
    ///
    /// Panics when the `app` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<A> {
        Server {
            app: self.app.expect("The `app` method must be called to create"),
            limits: self.limits,
        }
    }
}

/// One-call entry point: build a server around `app` and serve `addr`.
pub async fn serve<A: Application>(app: A, addr: SocketAddr, limits: Limits) -> Result<(), ServeError> {
    let server = Server {
        app: Arc::new(app),
        limits,
    };
    server.serve(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_balance_through_guards() {
        let counters = Arc::new(Counters::default());

        {
            let _live = Counters::track_connection(&counters);
            let _req = Counters::track_request(&counters);
            assert_eq!(counters.live_connections(), 1);
            assert_eq!(counters.in_flight(), 1);
        }

        assert_eq!(counters.live_connections(), 0);
        assert_eq!(counters.in_flight(), 0);

        assert_eq!(counters.next_connection_id(), 0);
        assert_eq!(counters.next_connection_id(), 1);
    }

    #[tokio::test]
    async fn get_stream_returns_none_on_shutdown() {
        let queue: TcpQueue = Arc::new(SegQueue::new());
        let (tx, mut rx) = watch::channel(false);

        tx.send(true).unwrap();
        let result = get_stream(&queue, &WaitStrategy::Sleep(Duration::from_micros(10)), &mut rx).await;
        assert!(result.is_none());
    }
}
