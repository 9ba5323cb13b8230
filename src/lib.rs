//! aras - asynchronous HTTP/1.1 and WebSocket server with an ASGI-style
//! application contract
//!
//! A single-process, multi-connection server that parses requests with
//! bounded buffers, materializes a per-request scope plus a `receive`/
//! `send` channel pair, and invokes a user-supplied asynchronous
//! [`Application`] cooperatively scheduled on the runtime.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, streamed bodies, chunked
//!   transfer encoding, `Expect: 100-continue`
//! - **HTTP/1.0**: basic support for legacy clients
//! - **WebSocket**: RFC 6455 with fragmentation, automatic pong and the
//!   close protocol
//! - **Lifespan**: one startup/shutdown dialogue around the server's life
//!
//! # Quick Start
//!
//! ```no_run
//! use aras::{apps::TestApplication, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .app(TestApplication)
//!         .build()
//!         .serve("127.0.0.1:8080".parse().unwrap())
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! Implement [`Application`] for your own handler; every HTTP request and
//! WebSocket session becomes one `call` with its own scope and channels.
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub mod types;
}
pub(crate) mod ws {
    pub(crate) mod frame;
    pub(crate) mod handshake;
}
pub(crate) mod asgi {
    pub mod channel;
    pub mod message;
    pub mod scope;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod lifespan;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod apps;
pub mod limits;

pub use crate::{
    asgi::{
        channel::{Disconnected, Receiver, SendError, Sender},
        message::{AppMessage, Headers, ServerMessage, WsData},
        scope::{HttpScope, LifespanScope, Scope, State, WebSocketScope},
    },
    errors::ServeError,
    http::query,
    http::types::{Method, Version},
    server::server_impl::{serve, AppError, Application, RunningServer, Server, ServerBuilder},
};
