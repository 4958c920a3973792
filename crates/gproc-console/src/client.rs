use crate::config::Config;
use crate::session_store::SessionStore;
use crate::ws::{LinkEvent, TokioScheduler, WsTransport, EVENT_CHANNEL_CAPACITY};
use gproc_sync::{
    BackoffPolicy, BufferLimits, ChannelBuffers, ConnectionManager, ConnectionState, DemuxStats,
    Dispatch, Session,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no authenticated session")]
    NotAuthenticated,
}

type Manager = ConnectionManager<WsTransport, TokioScheduler>;

/// Runtime side of the live stream: owns the connection manager and the
/// task that feeds it link and timer events.
pub struct SyncClient {
    manager: Arc<Mutex<Manager>>,
    state: Arc<watch::Sender<ConnectionState>>,
    updates: Arc<watch::Sender<u64>>,
    pump: JoinHandle<()>,
}

impl SyncClient {
    pub fn start(config: &Config) -> Self {
        Self::with_settings(config.ws_url.clone(), config.backoff, config.limits)
    }

    pub fn with_settings(ws_url: Url, backoff: BackoffPolicy, limits: BufferLimits) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = WsTransport::new(ws_url, events_tx.clone());
        let scheduler = TokioScheduler::new(events_tx);
        let manager = Arc::new(Mutex::new(ConnectionManager::new(
            transport, scheduler, backoff, limits,
        )));
        let (state, _) = watch::channel(ConnectionState::Idle);
        let state = Arc::new(state);
        let (updates, _) = watch::channel(0u64);
        let updates = Arc::new(updates);
        let pump = tokio::spawn(pump_events(
            manager.clone(),
            state.clone(),
            updates.clone(),
            events_rx,
        ));
        Self {
            manager,
            state,
            updates,
            pump,
        }
    }

    pub async fn connect(&self, session: &Session) {
        let mut manager = self.manager.lock().await;
        manager.connect(session);
        publish_state(&self.state, manager.state());
    }

    /// Connects with whatever session the store currently holds.
    pub async fn connect_from(&self, store: &SessionStore) -> Result<(), ConnectError> {
        let session = store.snapshot().ok_or(ConnectError::NotAuthenticated)?;
        self.connect(&session).await;
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut manager = self.manager.lock().await;
        manager.disconnect();
        publish_state(&self.state, manager.state());
        self.updates.send_modify(|revision| *revision += 1);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Bumped whenever buffered data changes.
    pub fn watch_updates(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    pub async fn with_buffers<R>(&self, read: impl FnOnce(&ChannelBuffers) -> R) -> R {
        let manager = self.manager.lock().await;
        read(manager.buffers())
    }

    pub async fn demux_stats(&self) -> DemuxStats {
        self.manager.lock().await.demux_stats()
    }

    pub async fn subscribe_logs(&self, process_id: &str) -> bool {
        self.manager.lock().await.subscribe_logs(process_id)
    }

    pub async fn unsubscribe_logs(&self, process_id: &str) -> bool {
        let removed = self.manager.lock().await.unsubscribe_logs(process_id);
        self.updates.send_modify(|revision| *revision += 1);
        removed
    }

    pub async fn log_subscriptions(&self) -> Vec<String> {
        let manager = self.manager.lock().await;
        manager.log_subscriptions().map(str::to_string).collect()
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> usize {
        let removed = self.manager.lock().await.acknowledge_alert(alert_id);
        if removed > 0 {
            self.updates.send_modify(|revision| *revision += 1);
        }
        removed
    }

    /// Disconnects and stops the event pump.
    pub async fn shutdown(self) {
        self.disconnect().await;
        self.pump.abort();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(
    manager: Arc<Mutex<Manager>>,
    state: Arc<watch::Sender<ConnectionState>>,
    updates: Arc<watch::Sender<u64>>,
    mut events: mpsc::Receiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut guard = manager.lock().await;
        match event {
            LinkEvent::Opened(generation) => guard.on_open(generation),
            LinkEvent::Frame(generation, raw) => {
                if let Dispatch::Routed(_) = guard.on_frame(generation, &raw) {
                    updates.send_modify(|revision| *revision += 1);
                }
            }
            LinkEvent::Closed(generation, reason) => guard.on_closed(generation, &reason),
            LinkEvent::ReconnectDue(token) => guard.on_reconnect_due(token),
        }
        publish_state(&state, guard.state());
    }
}

fn publish_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}
