use crate::gateway::{ActionGateway, AuthError};
use crate::token_store::{TokenStore, TokenStoreError};
use gproc_sync::{BearerToken, Credentials, PermissionClaim, Session};
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Supplies credentials to outbound requests, one lookup per request.
pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Option<BearerToken>;

    /// Called for any 401 on an authenticated request, with the token that
    /// request carried.
    fn on_unauthorized(&self, token: &BearerToken);

    fn permits(&self, claim: &PermissionClaim) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    SignedOut,
    SignedIn { user_id: String },
    /// Cleared by a 401; the operator has to authenticate again.
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignedOut => "signed_out",
            Self::SignedIn { .. } => "signed_in",
            Self::Expired => "expired",
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn { .. })
    }
}

/// Owns the current [`Session`]. Token and user are written together under
/// one lock, so readers see either both or neither.
pub struct SessionStore {
    session: RwLock<Option<Session>>,
    tokens: TokenStore,
    status: watch::Sender<SessionStatus>,
}

impl SessionStore {
    pub fn new(tokens: TokenStore) -> Self {
        let (status, _) = watch::channel(SessionStatus::SignedOut);
        Self {
            session: RwLock::new(None),
            tokens,
            status,
        }
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn has_permission(&self, resource: &str, action: &str, scope: &str) -> bool {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        gproc_sync::has_permission(session.as_ref(), resource, action, scope)
    }

    /// Installs `session` and persists its token. Persist failures are
    /// logged, not returned.
    pub fn establish(&self, session: Session) {
        let user_id = session.user().id.clone();
        let mut current = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = self.tokens.save(session.token()) {
            warn!(event = "token_persist_failed", error = %err);
        }
        *current = Some(session);
        drop(current);
        self.status.send_replace(SessionStatus::SignedIn {
            user_id: user_id.clone(),
        });
        info!(event = "session_established", user_id = %user_id);
    }

    pub async fn login(
        &self,
        gateway: &ActionGateway,
        credentials: &Credentials,
    ) -> Result<Session, AuthError> {
        let response = gateway.login(credentials).await?;
        let session = response
            .into_session()
            .ok_or_else(|| AuthError::Server {
                status: 200,
                message: "login response carried no token".to_string(),
            })?;
        self.establish(session.clone());
        Ok(session)
    }

    /// Rebuilds the session from the persisted token. Any failure clears the
    /// token and leaves the store signed out.
    pub async fn resume(
        &self,
        gateway: &ActionGateway,
    ) -> Result<Option<Session>, TokenStoreError> {
        let Some(token) = self.tokens.load()? else {
            return Ok(None);
        };
        match gateway.current_user(&token).await {
            Ok(user) => {
                let session = Session::new(token, user);
                self.establish(session.clone());
                Ok(Some(session))
            }
            Err(err) => {
                warn!(event = "session_resume_failed", error = %err);
                self.tokens.clear()?;
                Ok(None)
            }
        }
    }

    /// Clears the session. The live connection must be torn down afterwards.
    pub fn logout(&self) -> Result<(), TokenStoreError> {
        self.clear(SessionStatus::SignedOut);
        self.status.send_if_modified(|status| {
            let changed = *status != SessionStatus::SignedOut;
            *status = SessionStatus::SignedOut;
            changed
        });
        self.tokens.clear()
    }

    /// The 401 path: same teardown as logout, reported as `Expired`. Only
    /// the session that owns `token` is cleared; a late 401 from an earlier
    /// session leaves the current one alone.
    pub fn invalidate(&self, token: &BearerToken) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        match session.as_ref() {
            Some(current) if current.token() == token => {}
            Some(_) => {
                debug!(event = "stale_unauthorized_ignored");
                return;
            }
            None => return,
        }
        *session = None;
        if let Err(err) = self.tokens.clear() {
            warn!(event = "token_clear_failed", error = %err);
        }
        drop(session);
        self.status.send_replace(SessionStatus::Expired);
        warn!(event = "session_expired");
    }

    fn clear(&self, status: SessionStatus) -> bool {
        let previous = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            self.status.send_replace(status);
        }
        previous.is_some()
    }
}

impl CredentialSource for SessionStore {
    fn bearer_token(&self) -> Option<BearerToken> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.token().clone())
    }

    fn on_unauthorized(&self, token: &BearerToken) {
        self.invalidate(token);
    }

    fn permits(&self, claim: &PermissionClaim) -> bool {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        gproc_sync::satisfies(session.as_ref(), claim)
    }
}
