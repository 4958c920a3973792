use crate::guard::{satisfies, PermissionClaim};
use crate::session::Session;

pub const LANDING_PATH: &str = "/";
pub const LOGIN_PATH: &str = "/login";
pub const DASHBOARD_PATH: &str = "/dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRule {
    pub path: &'static str,
    pub name: &'static str,
    pub requires_auth: bool,
    /// Two-part `resource:action` permission, checked at wildcard scope.
    pub permission: Option<&'static str>,
}

const fn open(path: &'static str, name: &'static str) -> RouteRule {
    RouteRule {
        path,
        name,
        requires_auth: false,
        permission: None,
    }
}

const fn authed(
    path: &'static str,
    name: &'static str,
    permission: Option<&'static str>,
) -> RouteRule {
    RouteRule {
        path,
        name,
        requires_auth: true,
        permission,
    }
}

pub const ROUTES: &[RouteRule] = &[
    open("/", "Landing"),
    open("/login", "Login"),
    authed("/dashboard", "Dashboard", None),
    authed("/processes", "ProcessManagement", Some("process:read")),
    authed("/cluster", "ClusterManagement", Some("cluster:read")),
    authed("/monitoring", "Monitoring", Some("metrics:read")),
    authed("/deployments", "Deployments", Some("deployment:read")),
    authed("/scheduler", "Scheduler", Some("scheduler:read")),
    authed("/security", "Security", Some("user:read")),
    authed("/logs", "LogsViewer", Some("process:read")),
    authed("/settings", "Settings", None),
    authed("/probes", "LanguageProbes", Some("process:read")),
    authed("/templates", "Templates", Some("template:read")),
    authed("/audit", "AuditLogs", Some("audit:read")),
    authed("/backup", "BackupRestore", Some("backup:read")),
    authed("/secrets", "SecretsManagement", Some("secrets:read")),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    RedirectToLogin,
    RedirectToLanding,
    RedirectToDashboard,
}

impl RouteDecision {
    pub fn target(self) -> Option<&'static str> {
        match self {
            RouteDecision::Allow => None,
            RouteDecision::RedirectToLogin => Some(LOGIN_PATH),
            RouteDecision::RedirectToLanding => Some(LANDING_PATH),
            RouteDecision::RedirectToDashboard => Some(DASHBOARD_PATH),
        }
    }
}

pub fn find_route(path: &str) -> Option<&'static RouteRule> {
    let normalized = normalize_path(path);
    ROUTES.iter().find(|rule| rule.path == normalized)
}

pub fn evaluate_route(path: &str, session: Option<&Session>) -> RouteDecision {
    let normalized = normalize_path(path);
    if normalized == LANDING_PATH && session.is_some() {
        return RouteDecision::RedirectToDashboard;
    }
    let Some(rule) = find_route(normalized) else {
        return RouteDecision::Allow;
    };
    if rule.requires_auth && session.is_none() {
        return RouteDecision::RedirectToLogin;
    }
    if let Some(permission) = rule.permission {
        let permitted = PermissionClaim::parse(permission)
            .map(|claim| satisfies(session, &claim))
            .unwrap_or(false);
        if !permitted {
            return RouteDecision::RedirectToLanding;
        }
    }
    RouteDecision::Allow
}

fn normalize_path(path: &str) -> &str {
    let without_query = path.split(['?', '#']).next().unwrap_or(path);
    let trimmed = without_query.trim_end_matches('/');
    if trimmed.is_empty() {
        LANDING_PATH
    } else {
        trimmed
    }
}
