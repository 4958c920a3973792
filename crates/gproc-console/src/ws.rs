//! Websocket transport and tokio timers behind the connection seams.
//!
//! Each link runs in its own task and reports back over one event channel,
//! tagged with the generation it was opened for. Reconnect timers report on
//! the same channel, so the pump sees every event in arrival order.

use futures_util::StreamExt;
use gproc_sync::{
    BearerToken, ConnectRequest, Scheduler, TimerHandle, TimerToken, Transport, TransportHandle,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened(u64),
    Frame(u64, String),
    Closed(u64, String),
    ReconnectDue(TimerToken),
}

pub struct WsTransport {
    url: Url,
    events: mpsc::Sender<LinkEvent>,
}

impl WsTransport {
    pub fn new(url: Url, events: mpsc::Sender<LinkEvent>) -> Self {
        Self { url, events }
    }
}

impl Transport for WsTransport {
    type Handle = WsHandle;

    fn open(&mut self, request: &ConnectRequest) -> WsHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_link(
            self.url.clone(),
            request.clone(),
            self.events.clone(),
            close_rx,
        ));
        WsHandle {
            close: Some(close_tx),
            task,
        }
    }
}

/// Dropping the handle closes the link as well.
pub struct WsHandle {
    close: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TransportHandle for WsHandle {
    fn close(&mut self) {
        match self.close.take() {
            Some(close) => {
                if close.send(()).is_err() {
                    self.task.abort();
                }
            }
            None => self.task.abort(),
        }
    }
}

async fn run_link(
    url: Url,
    request: ConnectRequest,
    events: mpsc::Sender<LinkEvent>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let generation = request.generation;
    let handshake = match handshake_request(&url, &request.token) {
        Ok(handshake) => handshake,
        Err(reason) => {
            let _ = events.send(LinkEvent::Closed(generation, reason)).await;
            return;
        }
    };

    let connect = tokio::select! {
        _ = &mut close_rx => return,
        result = tokio_tungstenite::connect_async(handshake) => result,
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            let _ = events
                .send(LinkEvent::Closed(generation, format!("connect: {err}")))
                .await;
            return;
        }
    };
    if events.send(LinkEvent::Opened(generation)).await.is_err() {
        let _ = ws.close(None).await;
        return;
    }

    let reason = loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = ws.close(None).await;
                debug!(event = "ws_link_closed_locally", generation);
                return;
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if events.send(LinkEvent::Frame(generation, text)).await.is_err() {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|frame| format!("closed by server: {}", frame.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break err.to_string(),
                None => break "stream ended".to_string(),
            }
        }
    };
    let _ = events.send(LinkEvent::Closed(generation, reason)).await;
}

/// The upgrade request, carrying the session's bearer token.
pub fn handshake_request(url: &Url, token: &BearerToken) -> Result<Request, String> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| format!("handshake: {err}"))?;
    let value = HeaderValue::from_str(&token.authorization_header())
        .map_err(|err| format!("authorization header: {err}"))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

pub struct TokioScheduler {
    events: mpsc::Sender<LinkEvent>,
}

impl TokioScheduler {
    pub fn new(events: mpsc::Sender<LinkEvent>) -> Self {
        Self { events }
    }
}

impl Scheduler for TokioScheduler {
    type Timer = TokioTimer;

    fn schedule_reconnect(&mut self, token: TimerToken, delay: Duration) -> TokioTimer {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LinkEvent::ReconnectDue(token)).await;
        });
        TokioTimer { task }
    }
}

pub struct TokioTimer {
    task: JoinHandle<()>,
}

impl TimerHandle for TokioTimer {
    fn cancel(&mut self) {
        self.task.abort();
    }
}
