//! REST actions against the backend. Every request takes its bearer token
//! from the [`CredentialSource`] at send time, and every 401 goes back to it.

use crate::config::Config;
use crate::session_store::CredentialSource;
use gproc_sync::{BearerToken, Credentials, LoginResponse, PermissionClaim, User};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const API_PREFIX: [&str; 2] = ["api", "v1"];
const LOGIN_FAILED: &str = "Login failed";
const REGISTRATION_FAILED: &str = "Registration failed";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("multi-factor code required")]
    MfaRequired,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("session expired")]
    Unauthorized,
    #[error("request failed with {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("missing permission {0}")]
    NotPermitted(PermissionClaim),
    #[error("cannot build endpoint from {0}")]
    InvalidEndpoint(String),
}

impl ActionError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(StatusCode::UNAUTHORIZED.as_u16()),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Thin typed wrappers over one request path.
#[derive(Clone)]
pub struct ActionGateway {
    http: reqwest::Client,
    base: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl ActionGateway {
    pub fn new(config: &Config, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::with_timeout(config.backend_url.clone(), config.request_timeout, credentials)
    }

    pub fn with_timeout(
        base: Url,
        timeout: Duration,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!(
                    event = "http_client_fallback",
                    error = %err,
                    timeout_ms = timeout.as_millis() as u64
                );
                reqwest::Client::new()
            });
        Self {
            http,
            base,
            credentials,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    // --- auth ---

    pub async fn login(&self, credentials: &Credentials) -> Result<LoginResponse, AuthError> {
        let url = self.endpoint(&["auth", "login"]).map_err(auth_transport)?;
        let response = self
            .http
            .post(url)
            .json(credentials)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(auth_failure(response, LOGIN_FAILED).await);
        }
        response
            .json::<LoginResponse>()
            .await
            .map_err(|err| AuthError::Server {
                status: StatusCode::OK.as_u16(),
                message: err.to_string(),
            })
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<(), AuthError> {
        let url = self.endpoint(&["auth", "register"]).map_err(auth_transport)?;
        let body = json!({ "username": username, "password": password, "email": email });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(auth_failure(response, REGISTRATION_FAILED).await);
        }
        Ok(())
    }

    /// `GET /auth/me` with an explicit token, used before any session exists.
    pub async fn current_user(&self, token: &BearerToken) -> Result<User, ActionError> {
        let url = self.endpoint(&["auth", "me"])?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token.authorization_header())
            .send()
            .await
            .map_err(|err| ActionError::Transport(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ActionError::Unauthorized);
        }
        if !status.is_success() {
            let message = failure_message(response, "Request failed").await;
            return Err(ActionError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| ActionError::Decode(err.to_string()))?;
        // Some backends wrap the user as `{"user": {...}}`.
        let user = match body.get("user") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => body,
        };
        serde_json::from_value(user).map_err(|err| ActionError::Decode(err.to_string()))
    }

    pub async fn health(&self) -> Result<Value, ActionError> {
        let url = self.endpoint(&["health"])?;
        self.execute(Method::GET, url, None).await
    }

    // --- processes ---

    pub async fn list_processes(&self) -> Result<Value, ActionError> {
        self.guarded(claim("process", "read"), Method::GET, &["processes"], None)
            .await
    }

    pub async fn start_process(&self, process_id: &str) -> Result<Value, ActionError> {
        self.process_action(process_id, "start").await
    }

    pub async fn stop_process(&self, process_id: &str) -> Result<Value, ActionError> {
        self.process_action(process_id, "stop").await
    }

    pub async fn restart_process(&self, process_id: &str) -> Result<Value, ActionError> {
        self.process_action(process_id, "restart").await
    }

    pub async fn create_process(&self, process: &Value) -> Result<Value, ActionError> {
        self.guarded(
            claim("process", "create"),
            Method::POST,
            &["processes"],
            Some(process),
        )
        .await
    }

    pub async fn delete_process(&self, process_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("process", "delete"),
            Method::DELETE,
            &["processes", process_id],
            None,
        )
        .await
    }

    pub async fn process_logs(&self, process_id: &str, lines: usize) -> Result<Value, ActionError> {
        self.authorize(&claim("process", "read"))?;
        let mut url = self.endpoint(&["processes", process_id, "logs"])?;
        url.query_pairs_mut()
            .append_pair("lines", &lines.to_string());
        self.execute(Method::GET, url, None).await
    }

    async fn process_action(&self, process_id: &str, action: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("process", action),
            Method::POST,
            &["processes", process_id, action],
            None,
        )
        .await
    }

    // --- cluster ---

    pub async fn cluster_nodes(&self) -> Result<Value, ActionError> {
        self.guarded(claim("cluster", "read"), Method::GET, &["cluster", "nodes"], None)
            .await
    }

    pub async fn cluster_status(&self) -> Result<Value, ActionError> {
        self.guarded(claim("cluster", "read"), Method::GET, &["cluster", "status"], None)
            .await
    }

    pub async fn promote_node(&self, node_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("cluster", "promote"),
            Method::POST,
            &["cluster", "nodes", node_id, "promote"],
            None,
        )
        .await
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("cluster", "remove"),
            Method::DELETE,
            &["cluster", "nodes", node_id],
            None,
        )
        .await
    }

    // --- deployments ---

    pub async fn list_deployments(&self) -> Result<Value, ActionError> {
        self.guarded(claim("deployment", "read"), Method::GET, &["deployments"], None)
            .await
    }

    pub async fn create_deployment(&self, deployment: &Value) -> Result<Value, ActionError> {
        self.guarded(
            claim("deployment", "create"),
            Method::POST,
            &["deployments"],
            Some(deployment),
        )
        .await
    }

    pub async fn rollback_deployment(&self, deployment_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("deployment", "rollback"),
            Method::POST,
            &["deployments", deployment_id, "rollback"],
            None,
        )
        .await
    }

    // --- scheduler ---

    pub async fn list_tasks(&self) -> Result<Value, ActionError> {
        self.guarded(
            claim("scheduler", "read"),
            Method::GET,
            &["scheduler", "tasks"],
            None,
        )
        .await
    }

    pub async fn create_task(&self, task: &Value) -> Result<Value, ActionError> {
        self.guarded(
            claim("scheduler", "create"),
            Method::POST,
            &["scheduler", "tasks"],
            Some(task),
        )
        .await
    }

    pub async fn update_task(&self, task_id: &str, task: &Value) -> Result<Value, ActionError> {
        self.guarded(
            claim("scheduler", "update"),
            Method::PUT,
            &["scheduler", "tasks", task_id],
            Some(task),
        )
        .await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("scheduler", "delete"),
            Method::DELETE,
            &["scheduler", "tasks", task_id],
            None,
        )
        .await
    }

    pub async fn run_task(&self, task_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("scheduler", "run"),
            Method::POST,
            &["scheduler", "tasks", task_id, "run"],
            None,
        )
        .await
    }

    // --- monitoring ---

    pub async fn metrics(&self) -> Result<Value, ActionError> {
        self.guarded(claim("metrics", "read"), Method::GET, &["metrics"], None)
            .await
    }

    pub async fn list_alerts(&self) -> Result<Value, ActionError> {
        self.guarded(claim("alert", "read"), Method::GET, &["alerts"], None)
            .await
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> Result<Value, ActionError> {
        self.guarded(
            claim("alert", "acknowledge"),
            Method::POST,
            &["alerts", alert_id, "acknowledge"],
            None,
        )
        .await
    }

    // --- security ---

    pub async fn list_users(&self) -> Result<Value, ActionError> {
        self.guarded(claim("user", "read"), Method::GET, &["users"], None)
            .await
    }

    pub async fn list_roles(&self) -> Result<Value, ActionError> {
        self.guarded(claim("role", "read"), Method::GET, &["roles"], None)
            .await
    }

    pub async fn audit_log(&self, limit: usize) -> Result<Value, ActionError> {
        self.authorize(&claim("audit", "read"))?;
        let mut url = self.endpoint(&["audit"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        self.execute(Method::GET, url, None).await
    }

    pub async fn sso_config(&self) -> Result<Value, ActionError> {
        self.guarded(claim("sso", "read"), Method::GET, &["sso", "config"], None)
            .await
    }

    // --- request path ---

    pub fn authorize(&self, claim: &PermissionClaim) -> Result<(), ActionError> {
        if self.credentials.permits(claim) {
            Ok(())
        } else {
            debug!(event = "action_not_permitted", claim = %claim);
            Err(ActionError::NotPermitted(claim.clone()))
        }
    }

    async fn guarded(
        &self,
        claim: PermissionClaim,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<Value, ActionError> {
        self.authorize(&claim)?;
        let url = self.endpoint(segments)?;
        self.execute(method, url, body).await
    }

    /// Sends one request. A 401 invalidates the session that issued the
    /// token before the error is returned; it is never retried.
    pub async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, ActionError> {
        let path = url.path().to_string();
        let mut request = self.http.request(method.clone(), url);
        let sent_token = self.credentials.bearer_token();
        if let Some(token) = &sent_token {
            request = request.header(reqwest::header::AUTHORIZATION, token.authorization_header());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| {
            warn!(event = "action_failed", method = %method, path = %path, error = %err);
            ActionError::Transport(err.to_string())
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!(event = "session_expired", method = %method, path = %path);
            if let Some(token) = &sent_token {
                self.credentials.on_unauthorized(token);
            }
            return Err(ActionError::Unauthorized);
        }
        if !status.is_success() {
            let message = failure_message(response, "Request failed").await;
            warn!(
                event = "action_failed",
                method = %method,
                path = %path,
                status = status.as_u16(),
                message = %message
            );
            return Err(ActionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ActionError::Transport(err.to_string()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| ActionError::Decode(err.to_string()))
    }

    /// `/api/v1/<segments...>` on the backend origin. Segments are
    /// percent-encoded, so ids cannot escape their path position.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ActionError> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| ActionError::InvalidEndpoint(self.base.to_string()))?
            .clear()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }
}

fn claim(resource: &str, action: &str) -> PermissionClaim {
    PermissionClaim::new(resource, action)
}

fn auth_transport(err: ActionError) -> AuthError {
    AuthError::Transport(err.to_string())
}

async fn auth_failure(response: reqwest::Response, fallback: &str) -> AuthError {
    let status = response.status();
    if status == StatusCode::PRECONDITION_REQUIRED {
        return AuthError::MfaRequired;
    }
    let message = failure_message(response, fallback).await;
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AuthError::InvalidCredentials(message)
        }
        _ => AuthError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

/// The server's `message` field, or `fallback` when the body has none.
async fn failure_message(response: reqwest::Response, fallback: &str) -> String {
    let body = response.text().await.unwrap_or_default();
    message_from_body(&body).unwrap_or_else(|| fallback.to_string())
}

fn message_from_body(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|message| !message.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Anonymous;

    impl CredentialSource for Anonymous {
        fn bearer_token(&self) -> Option<BearerToken> {
            None
        }

        fn on_unauthorized(&self, _token: &BearerToken) {}

        fn permits(&self, _claim: &PermissionClaim) -> bool {
            false
        }
    }

    fn gateway(base: &str) -> ActionGateway {
        ActionGateway::with_timeout(
            Url::parse(base).expect("url"),
            Duration::from_secs(1),
            Arc::new(Anonymous),
        )
    }

    #[test]
    fn endpoints_live_under_api_v1_on_the_origin() {
        let gateway = gateway("http://localhost:8080/ui/?tab=1");
        let url = gateway
            .endpoint(&["processes", "web 1/../x", "start"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/v1/processes/web%201%2F..%2Fx/start"
        );
    }

    #[test]
    fn failure_message_prefers_server_text() {
        assert_eq!(
            message_from_body(r#"{"message":"no such process"}"#).as_deref(),
            Some("no such process")
        );
        assert_eq!(
            message_from_body(r#"{"error":"bad input"}"#).as_deref(),
            Some("bad input")
        );
        assert_eq!(message_from_body(r#"{"message":"  "}"#), None);
        assert_eq!(message_from_body("<html>"), None);
    }

    #[tokio::test]
    async fn permission_check_happens_before_any_request() {
        // Nothing listens on this port; reaching the network would be a transport error.
        let gateway = gateway("http://127.0.0.1:9");
        let err = gateway.stop_process("api").await.expect_err("denied");
        assert!(matches!(err, ActionError::NotPermitted(ref claim) if claim.action == "stop"));
    }
}
