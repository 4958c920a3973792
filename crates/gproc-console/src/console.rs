use crate::client::SyncClient;
use crate::config::Config;
use crate::gateway::{ActionGateway, AuthError};
use crate::health::HealthMonitor;
use crate::session_store::{SessionStatus, SessionStore};
use crate::token_store::{TokenStore, TokenStoreError};
use gproc_sync::{evaluate_route, Credentials, RouteDecision, Session};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Wires the session, the action gateway and the live stream together.
///
/// The stream follows the session: it connects after login or resume, and
/// it is torn down on logout and whenever a 401 expires the session.
pub struct Console {
    config: Config,
    session: Arc<SessionStore>,
    gateway: ActionGateway,
    sync: Arc<SyncClient>,
    expiry_watch: JoinHandle<()>,
}

impl Console {
    pub fn new(config: Config) -> Self {
        let session = Arc::new(SessionStore::new(TokenStore::new(config.token_path())));
        let gateway = ActionGateway::new(&config, session.clone());
        let sync = Arc::new(SyncClient::start(&config));
        let expiry_watch = tokio::spawn(disconnect_on_expiry(
            session.watch_status(),
            sync.clone(),
        ));
        Self {
            config,
            session,
            gateway,
            sync,
            expiry_watch,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn gateway(&self) -> &ActionGateway {
        &self.gateway
    }

    pub fn sync(&self) -> &SyncClient {
        &self.sync
    }

    /// Restores a persisted session and connects. `false` when there was
    /// nothing to restore or the backend rejected it.
    pub async fn resume(&self) -> Result<bool, TokenStoreError> {
        let had_session = self.session.is_authenticated();
        match self.session.resume(&self.gateway).await? {
            Some(session) => {
                self.restart_stream(had_session, &session).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Signs in and connects. A login over an existing session tears the
    /// stream down first.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let had_session = self.session.is_authenticated();
        let session = self.session.login(&self.gateway, credentials).await?;
        self.restart_stream(had_session, &session).await;
        Ok(session)
    }

    async fn restart_stream(&self, had_session: bool, session: &Session) {
        if had_session {
            self.sync.disconnect().await;
        }
        self.sync.connect(session).await;
    }

    pub async fn logout(&self) -> Result<(), TokenStoreError> {
        let result = self.session.logout();
        self.sync.disconnect().await;
        info!(event = "logout");
        result
    }

    pub fn can_visit(&self, path: &str) -> RouteDecision {
        evaluate_route(path, self.session.snapshot().as_ref())
    }

    pub fn spawn_health_monitor(&self) -> HealthMonitor {
        HealthMonitor::spawn(self.gateway.clone(), self.config.health_interval)
    }

    pub async fn shutdown(self) {
        self.expiry_watch.abort();
        self.sync.disconnect().await;
    }
}

async fn disconnect_on_expiry(mut status: watch::Receiver<SessionStatus>, sync: Arc<SyncClient>) {
    while status.changed().await.is_ok() {
        let expired = *status.borrow_and_update() == SessionStatus::Expired;
        if expired {
            sync.disconnect().await;
        }
    }
}
