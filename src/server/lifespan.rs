//! The startup/shutdown dialogue with the application.
//!
//! One application invocation with the `lifespan` scope lives for the
//! whole server process. Applications that never consume the startup
//! message are tolerated: after the grace window the server degrades to
//! "lifespan unsupported" and proceeds.

use crate::{
    asgi::{
        channel::{channel, ChannelDriver, Engagement},
        message::{AppMessage, ServerMessage},
        scope::{LifespanScope, Scope, State},
    },
    errors::ServeError,
    limits::Limits,
    server::server_impl::{AppError, Application},
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct LifespanHandle {
    tx: mpsc::Sender<ServerMessage>,
    rx: mpsc::Receiver<AppMessage>,
    engaged: Arc<Engagement>,
    task: JoinHandle<Result<(), AppError>>,
    /// The application never consumed `lifespan.startup`; skip shutdown.
    unsupported: bool,
}

/// Runs the startup dialogue. On `Ok` the server may bind and listen; on
/// `Err` it must exit without ever binding.
pub(crate) async fn startup<A: Application>(
    app: &Arc<A>,
    limits: &Limits,
) -> Result<LifespanHandle, ServeError> {
    let (driver, receiver, sender) = channel(1);
    let ChannelDriver { tx, mut rx, engaged } = driver;

    let scope = Scope::Lifespan(LifespanScope { state: State::new() });
    let app = app.clone();
    let task = tokio::spawn(async move { app.call(scope, receiver, sender).await });

    if tx.send(ServerMessage::LifespanStartup).await.is_err() {
        // The application returned before even taking its receiver.
        debug!("lifespan unsupported: application exited immediately");
        return Ok(LifespanHandle {
            tx,
            rx,
            engaged,
            task,
            unsupported: true,
        });
    }

    match timeout(limits.server.lifespan_timeout, rx.recv()).await {
        Ok(Some(AppMessage::StartupComplete)) => Ok(LifespanHandle {
            tx,
            rx,
            engaged,
            task,
            unsupported: false,
        }),
        Ok(Some(AppMessage::StartupFailed { message })) => {
            task.abort();
            Err(ServeError::Lifespan(message))
        }
        Ok(Some(other)) => {
            task.abort();
            Err(ServeError::Lifespan(format!(
                "unexpected lifespan message '{}'",
                other.kind()
            )))
        }
        Ok(None) => {
            // The application finished without replying. An error is a
            // startup failure; a clean return means lifespan is simply
            // not implemented.
            match task.await {
                Ok(Err(error)) => Err(ServeError::Lifespan(error.to_string())),
                Err(join_error) if join_error.is_panic() => {
                    Err(ServeError::Lifespan("application panicked during startup".into()))
                }
                _ => {
                    debug!("lifespan unsupported: application exited without replying");
                    Ok(LifespanHandle {
                        tx,
                        rx,
                        engaged,
                        task: tokio::spawn(async { Ok::<(), AppError>(()) }),
                        unsupported: true,
                    })
                }
            }
        }
        Err(_) => {
            // Timed out. An application that consumed the message owes us
            // an answer; one that never looked gets the benefit of the
            // doubt.
            if engaged.engaged() {
                task.abort();
                Err(ServeError::Lifespan(
                    "timed out waiting for lifespan.startup.complete".into(),
                ))
            } else {
                info!("application does not support lifespan, continuing without it");
                Ok(LifespanHandle {
                    tx,
                    rx,
                    engaged,
                    task,
                    unsupported: true,
                })
            }
        }
    }
}

/// Runs the shutdown dialogue. Silence is treated as success.
pub(crate) async fn shutdown(handle: LifespanHandle, limits: &Limits) {
    let LifespanHandle {
        tx,
        mut rx,
        task,
        unsupported,
        ..
    } = handle;

    if unsupported {
        task.abort();
        return;
    }

    if tx.send(ServerMessage::LifespanShutdown).await.is_err() {
        debug!("lifespan task already finished before shutdown");
        task.abort();
        return;
    }

    match timeout(limits.server.lifespan_timeout, rx.recv()).await {
        Ok(Some(AppMessage::ShutdownComplete)) => {
            info!("Application shutdown complete");
        }
        Ok(Some(AppMessage::ShutdownFailed { message })) => {
            warn!(message, "application shutdown failed");
        }
        Ok(Some(other)) => {
            warn!(kind = other.kind(), "unexpected lifespan message during shutdown");
        }
        Ok(None) | Err(_) => {
            debug!("no reply to lifespan.shutdown, treating silence as success");
        }
    }

    task.abort();
    let _ = task.await;
}
