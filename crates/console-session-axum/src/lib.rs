//! axum glue for console login sessions.
//!
//! Routers using these extractors must be wrapped in
//! [`tower_cookies::CookieManagerLayer`].

mod error;
mod extractor;
mod routes;

use std::sync::Arc;

use console_session::{RefreshCoordinator, SessionService};

pub use self::error::{RequestError, RequestResult};
pub use self::extractor::{AuthenticatedSession, OptionalSession};
pub use self::routes::{SessionInfo, auth_router};

const LOG_TARGET: &str = "console::session::axum";

/// What the extractors need from the application state.
///
/// Make it reachable with `FromRef` from the router's state.
#[derive(Clone)]
pub struct AuthState {
    coordinator: Arc<RefreshCoordinator>,
    login_path: Arc<str>,
}

impl AuthState {
    pub fn new(coordinator: Arc<RefreshCoordinator>, login_path: impl Into<Arc<str>>) -> Self {
        Self {
            coordinator,
            login_path: login_path.into(),
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn login_path(&self) -> &Arc<str> {
        &self.login_path
    }
}

impl From<&SessionService> for AuthState {
    fn from(service: &SessionService) -> Self {
        Self::new(service.coordinator().clone(), service.login_path().clone())
    }
}
