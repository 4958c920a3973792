#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use gproc_console::SyncClient;
use gproc_sync::{BearerToken, ChannelBuffers, ConnectionState, Session, User};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

/// Loopback websocket backend. With `frames`, the first connection gets them
/// and is then closed by the server. Every other connection stays open until
/// the client leaves.
pub struct Backend {
    pub addr: SocketAddr,
    pub handshakes: mpsc::UnboundedReceiver<Option<String>>,
    task: JoinHandle<()>,
}

impl Backend {
    pub async fn start(frames: Vec<String>) -> Self {
        Self::spawn(Some(frames)).await
    }

    pub async fn steady() -> Self {
        Self::spawn(None).await
    }

    async fn spawn(first: Option<Vec<String>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, handshakes) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut first = first;
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let callback = move |request: &Request, response: Response| {
                    let auth = request
                        .headers()
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    let _ = tx.send(auth);
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                if let Some(frames) = first.take() {
                    for frame in &frames {
                        let _ = ws.send(Message::Text(frame.clone())).await;
                    }
                    let _ = ws.close(None).await;
                    while let Some(Ok(_)) = ws.next().await {}
                } else {
                    tokio::spawn(async move { while let Some(Ok(_)) = ws.next().await {} });
                }
            }
        });
        Self {
            addr,
            handshakes,
            task,
        }
    }

    pub fn ws_url(&self) -> Url {
        Url::parse(&format!("ws://{}/api/v1/ws", self.addr)).expect("ws url")
    }

    pub async fn next_handshake(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.handshakes.recv())
            .await
            .expect("handshake in time")
            .expect("backend running")
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn session(token: &str) -> Session {
    Session::new(
        BearerToken::new(token).expect("token"),
        User {
            id: "u1".to_string(),
            username: "ops".to_string(),
            email: String::new(),
            roles: Default::default(),
            permissions: Default::default(),
            enabled: true,
            mfa_enabled: false,
        },
    )
}

pub async fn wait_for_state(client: &SyncClient, expected: ConnectionState) {
    let mut state = client.watch_state();
    tokio::time::timeout(WAIT, state.wait_for(|current| *current == expected))
        .await
        .expect("state reached in time")
        .expect("state channel open");
}

pub async fn wait_for_buffers(client: &SyncClient, done: impl Fn(&ChannelBuffers) -> bool) {
    tokio::time::timeout(WAIT, async {
        while !client.with_buffers(|buffers| done(buffers)).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("buffers filled in time");
}
