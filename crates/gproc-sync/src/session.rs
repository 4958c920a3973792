use crate::guard::{PermissionClaim, ADMIN_ROLE, WILDCARD_SCOPE};
use crate::wire::deserialize_id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "mfaEnabled")]
    pub mfa_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_ROLE)
    }

    /// Admins satisfy every claim; everyone else needs the exact
    /// `resource:action:scope` string or its `resource:action:*` form.
    pub fn satisfies(&self, claim: &PermissionClaim) -> bool {
        if self.is_admin() {
            return true;
        }
        self.permissions.contains(&claim.permission_string())
            || self
                .permissions
                .contains(&claim.with_scope(WILDCARD_SCOPE).permission_string())
    }
}

/// An authenticated session: a token always travels with its user.
///
/// Signed-out is modelled as the absence of a `Session`, so a token without a
/// matching user cannot be observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    token: BearerToken,
    user: User,
}

impl Session {
    pub fn new(token: BearerToken, user: User) -> Self {
        Self { token, user }
    }

    pub fn token(&self) -> &BearerToken {
        &self.token
    }

    pub fn user(&self) -> &User {
        &self.user
    }
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_code: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mfa_code: None,
        }
    }

    pub fn with_mfa_code(mut self, code: impl Into<String>) -> Self {
        self.mfa_code = Some(code.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("mfa_code", &self.mfa_code.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Body of a successful `POST /api/v1/auth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

impl LoginResponse {
    pub fn into_session(self) -> Option<Session> {
        let token = BearerToken::new(self.token)?;
        Some(Session::new(token, self.user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_parses_backend_shape() {
        let user: User = serde_json::from_str(
            r#"{
                "id": 17,
                "username": "ops",
                "email": "ops@example.com",
                "roles": ["operator"],
                "permissions": ["process:read:*", "process:stop:prod"],
                "enabled": true,
                "mfaEnabled": true,
                "lastSeen": "2026-01-01T00:00:00Z"
            }"#,
        )
        .expect("parse user");
        assert_eq!(user.id, "17");
        assert!(user.mfa_enabled);
        assert!(user.permissions.contains("process:stop:prod"));
        assert!(!user.is_admin());
    }

    #[test]
    fn login_response_without_token_yields_no_session() {
        let response: LoginResponse =
            serde_json::from_str(r#"{"token":"  ","user":{"id":"u1"}}"#).expect("parse");
        assert!(response.into_session().is_none());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let token = BearerToken::new("abc").expect("token");
        assert_eq!(format!("{token:?}"), "BearerToken(***)");
        let creds = Credentials::new("ops", "hunter2").with_mfa_code("123456");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("123456"));
    }

    #[test]
    fn credentials_omit_absent_mfa_code() {
        let value = serde_json::to_value(Credentials::new("ops", "pw")).expect("json");
        assert_eq!(value, serde_json::json!({"username": "ops", "password": "pw"}));
    }
}
