use axum::extract::{FromRef, State};
use axum::response::Redirect;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use time::OffsetDateTime;
use tower_cookies::Cookies;
use tracing::debug;

use crate::error::{RequestResult, SessionSnafu};
use crate::extractor::AuthenticatedSession;
use crate::{AuthState, LOG_TARGET};

/// Public view of the caller's session. Never contains tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

pub fn auth_router<S>() -> Router<S>
where
    AuthState: FromRef<S>,
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/auth/session", get(session_info))
        .route("/auth/logout", post(logout))
}

async fn session_info(AuthenticatedSession(session): AuthenticatedSession) -> Json<SessionInfo> {
    Json(SessionInfo {
        user_id: session.user_id().to_owned(),
        username: session.username().to_owned(),
        email: session.email().to_owned(),
        expires_at: session.expires_at(),
    })
}

async fn logout(State(auth): State<AuthState>, cookies: Cookies) -> RequestResult<Redirect> {
    auth.coordinator()
        .store()
        .delete_session(&cookies)
        .await
        .context(SessionSnafu {
            login_path: auth.login_path().clone(),
            redirect: None::<String>,
        })?;
    debug!(target: LOG_TARGET, "Logged out");
    Ok(Redirect::to(auth.login_path()))
}
