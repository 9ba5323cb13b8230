//! The bounded message channels behind `receive` and `send`.
//!
//! Every in-flight request owns one [`Receiver`]/[`Sender`] pair handed to
//! the application and one [`ChannelDriver`] kept by the connection. The
//! inbound queue is small, so a handler that stops consuming pauses socket
//! reads; the outbound queue has capacity 1, so `send` suspends until the
//! codec has drained the previous message. Dropping the driver resolves
//! both endpoints with [`Disconnected`].

use crate::asgi::message::{AppMessage, ServerMessage};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Notify};

/// The connection to the server side of the channel pair is gone: the
/// request finished, errored, or the peer disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl std::fmt::Display for Disconnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection disconnected")
    }
}

impl std::error::Error for Disconnected {}

/// Rejection of a `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The message failed validation and was not accepted.
    Invalid(&'static str),
    /// The server side is gone.
    Disconnected,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "invalid message: {reason}"),
            Self::Disconnected => f.write_str("connection disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

/// The `receive` endpoint handed to the application.
pub struct Receiver {
    rx: mpsc::Receiver<ServerMessage>,
    engaged: Arc<Engagement>,
}

impl Receiver {
    /// Returns the next inbound message in order, suspending until one is
    /// available. Fails once the connection is marked disconnected.
    pub async fn next(&mut self) -> Result<ServerMessage, Disconnected> {
        self.engaged.mark();
        self.rx.recv().await.ok_or(Disconnected)
    }
}

/// The `send` endpoint handed to the application.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<AppMessage>,
}

impl Sender {
    /// Validates `message` and places it on the outbound queue, suspending
    /// until the codec has drained the prior message. Returning `Ok` means
    /// accepted, not yet written to the wire.
    pub async fn send(&self, message: AppMessage) -> Result<(), SendError> {
        message.validate().map_err(SendError::Invalid)?;
        self.tx
            .send(message)
            .await
            .map_err(|_| SendError::Disconnected)
    }
}

/// Tracks whether the application ever called `receive`, and wakes a
/// waiter the first time it does. Drives the lazy `100 Continue` and the
/// unsupported-lifespan detection.
#[derive(Debug)]
pub(crate) struct Engagement {
    flag: AtomicBool,
    notify: Notify,
}

impl Engagement {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    #[inline]
    fn mark(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    #[inline]
    pub(crate) fn engaged(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `receive` has been called at least once.
    pub(crate) async fn wait(&self) {
        // notified() must be armed before the flag check to avoid a lost
        // wakeup between the check and the await.
        let notified = self.notify.notified();
        if self.engaged() {
            return;
        }
        notified.await;
    }
}

/// Server-side ends of one channel pair.
pub(crate) struct ChannelDriver {
    pub(crate) tx: mpsc::Sender<ServerMessage>,
    pub(crate) rx: mpsc::Receiver<AppMessage>,
    pub(crate) engaged: Arc<Engagement>,
}

/// Builds one channel pair. `inbound_capacity` bounds the server → app
/// queue; the app → server queue always has capacity 1.
pub(crate) fn channel(inbound_capacity: usize) -> (ChannelDriver, Receiver, Sender) {
    let (server_tx, app_rx) = mpsc::channel(inbound_capacity.max(1));
    let (app_tx, server_rx) = mpsc::channel(1);
    let engaged = Engagement::new();

    (
        ChannelDriver {
            tx: server_tx,
            rx: server_rx,
            engaged: engaged.clone(),
        },
        Receiver {
            rx: app_rx,
            engaged,
        },
        Sender { tx: app_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asgi::message::Headers;

    #[tokio::test]
    async fn messages_flow_in_order() {
        let (mut driver, mut receiver, sender) = channel(4);

        driver
            .tx
            .send(ServerMessage::HttpRequest {
                body: b"one".to_vec(),
                more_body: true,
            })
            .await
            .unwrap();
        driver
            .tx
            .send(ServerMessage::HttpRequest {
                body: b"two".to_vec(),
                more_body: false,
            })
            .await
            .unwrap();

        assert_eq!(
            receiver.next().await,
            Ok(ServerMessage::HttpRequest {
                body: b"one".to_vec(),
                more_body: true
            })
        );
        assert_eq!(
            receiver.next().await,
            Ok(ServerMessage::HttpRequest {
                body: b"two".to_vec(),
                more_body: false
            })
        );

        sender
            .send(AppMessage::ResponseStart {
                status: 200,
                headers: Headers::new(),
                trailers: false,
            })
            .await
            .unwrap();
        assert!(matches!(
            driver.rx.recv().await,
            Some(AppMessage::ResponseStart { status: 200, .. })
        ));
    }

    #[tokio::test]
    async fn dropping_the_driver_disconnects_both_endpoints() {
        let (driver, mut receiver, sender) = channel(1);
        drop(driver);

        assert_eq!(receiver.next().await, Err(Disconnected));
        assert_eq!(
            sender
                .send(AppMessage::ResponseBody {
                    body: vec![],
                    more_body: false
                })
                .await,
            Err(SendError::Disconnected)
        );
    }

    #[tokio::test]
    async fn invalid_messages_are_rejected_without_queueing() {
        let (mut driver, _receiver, sender) = channel(1);

        let result = sender
            .send(AppMessage::ResponseStart {
                status: 42,
                headers: Headers::new(),
                trailers: false,
            })
            .await;
        assert_eq!(result, Err(SendError::Invalid("response status out of range")));

        drop(sender);
        assert!(driver.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn first_receive_is_observable() {
        let (driver, mut receiver, _sender) = channel(1);
        assert!(!driver.engaged.engaged());

        let engaged = driver.engaged.clone();
        let waiter = tokio::spawn(async move { engaged.wait().await });

        driver.tx.send(ServerMessage::HttpDisconnect).await.unwrap();
        receiver.next().await.unwrap();

        waiter.await.unwrap();
        assert!(driver.engaged.engaged());
    }

    #[tokio::test]
    async fn outbound_queue_applies_backpressure() {
        let (_driver, _receiver, sender) = channel(1);

        sender
            .send(AppMessage::ResponseBody {
                body: vec![],
                more_body: true,
            })
            .await
            .unwrap();

        // Second send cannot complete until the driver drains the first.
        let pending = sender.send(AppMessage::ResponseBody {
            body: vec![],
            more_body: false,
        });
        tokio::pin!(pending);
        let raced = tokio::time::timeout(std::time::Duration::from_millis(20), &mut pending).await;
        assert!(raced.is_err());
    }
}
