// 🧭 Routes - page table and navigation guard
//
// Guest pages are for signed-out users only; protected pages need a
// session, some of them the accountant role. Unknown paths go to `/`.

use crate::auth::{Role, Session};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Guest,
    Authenticated,
    Role(Role),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteDef {
    pub name: &'static str,
    pub pattern: &'static str,
    pub access: Access,
}

pub const DASHBOARD_PATH: &str = "/";
pub const LOGIN_PATH: &str = "/login";

pub const ROUTES: &[RouteDef] = &[
    RouteDef { name: "login", pattern: "/login", access: Access::Guest },
    RouteDef { name: "signup", pattern: "/signup", access: Access::Guest },
    RouteDef { name: "invite-accept", pattern: "/invite/:token", access: Access::Guest },
    RouteDef { name: "dashboard", pattern: "/", access: Access::Authenticated },
    RouteDef { name: "files", pattern: "/files", access: Access::Authenticated },
    RouteDef { name: "records", pattern: "/records", access: Access::Authenticated },
    RouteDef { name: "file-records", pattern: "/records/:fileId", access: Access::Authenticated },
    RouteDef { name: "clients", pattern: "/clients", access: Access::Role(Role::Accountant) },
    RouteDef { name: "merge-jobs", pattern: "/merge", access: Access::Role(Role::Accountant) },
    RouteDef { name: "merge-result", pattern: "/merge/:jobId", access: Access::Role(Role::Accountant) },
    RouteDef { name: "profile", pattern: "/profile", access: Access::Authenticated },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMatch {
    pub route: RouteDef,
    pub params: BTreeMap<String, String>,
}

/// Match the path part of `full_path` against the table
pub fn match_route(full_path: &str) -> Option<RouteMatch> {
    let path = full_path.split(['?', '#']).next().unwrap_or("");
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    let segments: Vec<&str> = path.split('/').skip(1).collect();

    ROUTES.iter().find_map(|route| {
        let pattern: Vec<&str> = route.pattern.split('/').skip(1).collect();
        if pattern.len() != segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (expected, actual) in pattern.iter().zip(&segments) {
            if let Some(name) = expected.strip_prefix(':') {
                if actual.is_empty() {
                    return None;
                }
                let value = urlencoding::decode(actual)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| actual.to_string());
                params.insert(name.to_string(), value);
            } else if expected != actual {
                return None;
            }
        }

        Some(RouteMatch {
            route: *route,
            params,
        })
    })
}

// ============================================================================
// GUARD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuardDecision {
    Allow,
    /// Signed-out user on a protected page; `redirect` is where to return after login
    RedirectToLogin { redirect: String },
    RedirectToDashboard,
}

impl GuardDecision {
    /// Target path of a redirect, including the login query
    pub fn location(&self) -> Option<String> {
        match self {
            GuardDecision::Allow => None,
            GuardDecision::RedirectToLogin { redirect } => Some(format!(
                "{}?redirect={}",
                LOGIN_PATH,
                urlencoding::encode(redirect)
            )),
            GuardDecision::RedirectToDashboard => Some(DASHBOARD_PATH.to_string()),
        }
    }
}

/// Decide what happens when navigating to `full_path`
pub fn guard(full_path: &str, session: Option<&Session>) -> GuardDecision {
    let Some(found) = match_route(full_path) else {
        return GuardDecision::RedirectToDashboard;
    };

    match (found.route.access, session) {
        (Access::Guest, Some(_)) => GuardDecision::RedirectToDashboard,
        (Access::Guest, None) => GuardDecision::Allow,
        (_, None) => GuardDecision::RedirectToLogin {
            redirect: full_path.to_string(),
        },
        (Access::Role(role), Some(session)) if session.role() != role => {
            GuardDecision::RedirectToDashboard
        }
        _ => GuardDecision::Allow,
    }
}
