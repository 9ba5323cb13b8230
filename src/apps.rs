//! Bundled applications.
//!
//! [`TestApplication`] is the application the integration suite runs
//! against; it exercises every part of the contract (body streaming,
//! connection state, chunked responses, WebSocket echo, lifespan).
//! [`LifespanFailureApplication`] refuses to start, for exercising the
//! startup-failure path. The CLI resolves its `module:attribute`
//! argument against [`load`].

use crate::{
    asgi::{
        channel::{Receiver, Sender},
        message::{AppMessage, Headers, ServerMessage, WsData},
        scope::{HttpScope, Scope},
    },
    http::query,
    server::server_impl::{AppError, Application},
};
use serde_json::{json, Value};
use std::time::Duration;

/// The application served by `aras serve testapp:app`.
pub struct TestApplication;

impl Application for TestApplication {
    async fn call(
        &self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
    ) -> Result<(), AppError> {
        match scope {
            Scope::Http(scope) => handle_http(scope, receive, send).await,
            Scope::WebSocket(_) => handle_chat(receive, send).await,
            Scope::Lifespan(_) => handle_lifespan(receive, send).await,
        }
    }
}

/// Replies `lifespan.startup.failed` to every startup; served by
/// `aras serve failing_lifespan:app`.
pub struct LifespanFailureApplication;

impl Application for LifespanFailureApplication {
    async fn call(
        &self,
        scope: Scope,
        mut receive: Receiver,
        send: Sender,
    ) -> Result<(), AppError> {
        match scope {
            Scope::Lifespan(_) => {
                receive.next().await?;
                send.send(AppMessage::StartupFailed {
                    message: "oops".into(),
                })
                .await?;
                Ok(())
            }
            other => Err(format!("scope type '{}' not supported", other.kind()).into()),
        }
    }
}

/// Applications the CLI can serve, by `module:attribute` name.
pub enum LoadedApp {
    Test(TestApplication),
    FailingLifespan(LifespanFailureApplication),
}

/// Resolves an application spec against the bundled registry.
pub fn load(spec: &str) -> Option<LoadedApp> {
    match spec {
        "testapp:app" => Some(LoadedApp::Test(TestApplication)),
        "failing_lifespan:app" => Some(LoadedApp::FailingLifespan(LifespanFailureApplication)),
        _ => None,
    }
}

async fn handle_lifespan(mut receive: Receiver, send: Sender) -> Result<(), AppError> {
    loop {
        match receive.next().await? {
            ServerMessage::LifespanStartup => send.send(AppMessage::StartupComplete).await?,
            ServerMessage::LifespanShutdown => {
                send.send(AppMessage::ShutdownComplete).await?;
                return Ok(());
            }
            other => return Err(format!("unexpected lifespan message: {other:?}").into()),
        }
    }
}

async fn handle_http(
    scope: HttpScope,
    mut receive: Receiver,
    send: Sender,
) -> Result<(), AppError> {
    let body = read_body(&mut receive).await?;

    match (scope.method.as_str(), scope.path.as_str()) {
        ("GET", "/") => respond(&send, 200, "text/plain", b"", Headers::new()).await,

        ("GET", "/health_check") => {
            let payload = serde_json::to_vec(&json!({"message": "looking good!"}))?;
            respond(&send, 200, "application/json", &payload, Headers::new()).await
        }

        ("GET", "/api/basic/echo_text") => {
            match query::value(&scope.query_string, b"data") {
                Some(data) => respond(&send, 200, "text/plain", &data, Headers::new()).await,
                None => respond(&send, 422, "text/plain", b"field required: data", Headers::new()).await,
            }
        }

        ("POST", "/api/basic/echo_json") => {
            // Validate, then echo the bytes exactly as received.
            if serde_json::from_slice::<Value>(&body).is_err() {
                return respond(&send, 422, "text/plain", b"invalid json", Headers::new()).await;
            }
            respond(&send, 200, "application/json", &body, Headers::new()).await
        }

        ("GET", "/api/basic/more_headers") => {
            let extra = vec![(b"the".to_vec(), b"header".to_vec())];
            respond(&send, 200, "text/plain", b"", extra).await
        }

        ("GET", "/api/basic/error") => Err("This is an error".into()),

        ("PATCH", "/api/basic/state") => {
            let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&body) else {
                return respond(&send, 422, "text/plain", b"expected a json object", Headers::new())
                    .await;
            };
            for (key, value) in map {
                scope.state.insert(key, value);
            }
            respond(&send, 204, "text/plain", b"", Headers::new()).await
        }

        ("GET", "/api/basic/state") => {
            let dump = serde_json::to_vec(&scope.state.snapshot())?;
            respond(&send, 200, "application/json", &dump, Headers::new()).await
        }

        ("GET", "/api/basic/long_task") => {
            tokio::time::sleep(Duration::from_secs(20)).await;
            let payload = serde_json::to_vec(&json!({"task": "done"}))?;
            respond(&send, 200, "application/json", &payload, Headers::new()).await
        }

        ("POST", "/api/stream/large_data") => {
            respond(&send, 200, "text/plain", &body, Headers::new()).await
        }

        ("GET", "/api/stream" | "/api/stream/") => stream_video(&send).await,

        _ => respond(&send, 404, "text/plain", b"Not Found", Headers::new()).await,
    }
}

/// Streams ten chunks without declaring a length, so the server frames
/// the response with chunked transfer encoding.
async fn stream_video(send: &Sender) -> Result<(), AppError> {
    send.send(AppMessage::ResponseStart {
        status: 200,
        headers: vec![(b"content-type".to_vec(), b"application/octet-stream".to_vec())],
        trailers: false,
    })
    .await?;

    for _ in 0..10 {
        send.send(AppMessage::ResponseBody {
            body: b"some fake video bytes".to_vec(),
            more_body: true,
        })
        .await?;
    }
    send.send(AppMessage::ResponseBody {
        body: Vec::new(),
        more_body: false,
    })
    .await?;

    Ok(())
}

async fn handle_chat(mut receive: Receiver, send: Sender) -> Result<(), AppError> {
    match receive.next().await? {
        ServerMessage::WebSocketConnect => {
            send.send(AppMessage::WebSocketAccept {
                subprotocol: None,
                headers: Headers::new(),
            })
            .await?;
        }
        other => return Err(format!("expected websocket.connect, got {other:?}").into()),
    }

    loop {
        match receive.next().await {
            Ok(ServerMessage::WebSocketReceive(WsData::Text(text))) => {
                send.send(AppMessage::WebSocketSend(WsData::Text(format!(
                    "Message text was: {text}"
                ))))
                .await?;
            }
            Ok(ServerMessage::WebSocketReceive(WsData::Binary(bytes))) => {
                send.send(AppMessage::WebSocketSend(WsData::Binary(bytes))).await?;
            }
            Ok(ServerMessage::WebSocketDisconnect { .. }) | Err(_) => return Ok(()),
            Ok(other) => return Err(format!("unexpected websocket message: {other:?}").into()),
        }
    }
}

async fn read_body(receive: &mut Receiver) -> Result<Vec<u8>, AppError> {
    let mut body = Vec::new();

    loop {
        match receive.next().await? {
            ServerMessage::HttpRequest {
                body: chunk,
                more_body,
            } => {
                body.extend_from_slice(&chunk);
                if !more_body {
                    break;
                }
            }
            ServerMessage::HttpDisconnect => break,
            other => return Err(format!("unexpected http message: {other:?}").into()),
        }
    }

    Ok(body)
}

async fn respond(
    send: &Sender,
    status: u16,
    content_type: &str,
    body: &[u8],
    mut extra_headers: Headers,
) -> Result<(), AppError> {
    let mut headers: Headers = vec![
        (b"content-type".to_vec(), content_type.as_bytes().to_vec()),
        (
            b"content-length".to_vec(),
            body.len().to_string().into_bytes(),
        ),
    ];
    headers.append(&mut extra_headers);

    send.send(AppMessage::ResponseStart {
        status,
        headers,
        trailers: false,
    })
    .await?;
    send.send(AppMessage::ResponseBody {
        body: body.to_vec(),
        more_body: false,
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_bundled_apps() {
        assert!(matches!(load("testapp:app"), Some(LoadedApp::Test(_))));
        assert!(matches!(
            load("failing_lifespan:app"),
            Some(LoadedApp::FailingLifespan(_))
        ));
        assert!(load("unknown:app").is_none());
        assert!(load("testapp").is_none());
    }
}
