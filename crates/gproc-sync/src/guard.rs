use crate::session::Session;
use std::fmt;

pub const ADMIN_ROLE: &str = "admin";
pub const WILDCARD_SCOPE: &str = "*";

/// A `(resource, action, scope)` permission requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionClaim {
    pub resource: String,
    pub action: String,
    pub scope: String,
}

impl PermissionClaim {
    /// A claim with the wildcard scope.
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: WILDCARD_SCOPE.to_string(),
        }
    }

    pub fn with_scope(&self, scope: impl Into<String>) -> Self {
        Self {
            resource: self.resource.clone(),
            action: self.action.clone(),
            scope: scope.into(),
        }
    }

    /// Parses `resource:action` or `resource:action:scope`.
    pub fn parse(input: &str) -> Option<Self> {
        let mut parts = input.trim().splitn(3, ':');
        let resource = parts.next().filter(|part| !part.is_empty())?;
        let action = parts.next().filter(|part| !part.is_empty())?;
        let scope = parts
            .next()
            .filter(|part| !part.is_empty())
            .unwrap_or(WILDCARD_SCOPE);
        Some(Self {
            resource: resource.to_string(),
            action: action.to_string(),
            scope: scope.to_string(),
        })
    }

    pub fn permission_string(&self) -> String {
        format!("{}:{}:{}", self.resource, self.action, self.scope)
    }
}

impl fmt::Display for PermissionClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.permission_string())
    }
}

/// Pure permission check used for both route access and UI action gating.
pub fn has_permission(
    session: Option<&Session>,
    resource: &str,
    action: &str,
    scope: &str,
) -> bool {
    let claim = PermissionClaim {
        resource: resource.to_string(),
        action: action.to_string(),
        scope: scope.to_string(),
    };
    satisfies(session, &claim)
}

pub fn satisfies(session: Option<&Session>, claim: &PermissionClaim) -> bool {
    match session {
        Some(session) => session.user().satisfies(claim),
        None => false,
    }
}
