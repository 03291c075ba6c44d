use async_trait::async_trait;
use tower_cookies::Cookies;

use crate::error::SessionResult;
use crate::login_state::LoginState;
use crate::token::{IdTokenVerifier, TokenResponse};

/// Name of the cookie carrying the current refresh token, shared by all
/// backends.
pub const REFRESH_TOKEN_COOKIE: &str = "console-refresh-token";

/// Session lifecycle shared by the in-memory and the filesystem backends.
///
/// Every operation reads the request cookies and queues response cookies on
/// the same [`Cookies`] jar, so `CookieManagerLayer` must wrap the router.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Start a session from a freshly exchanged token response.
    async fn add_session(
        &self,
        cookies: &Cookies,
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> SessionResult<LoginState>;

    /// The session the request's cookies resolve to, if any.
    async fn get_session(&self, cookies: &Cookies) -> SessionResult<Option<LoginState>>;

    /// Move the request's session onto a refreshed token response, or start a
    /// new session if there is none to continue.
    async fn update_tokens(
        &self,
        cookies: &Cookies,
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> SessionResult<LoginState>;

    /// Clear the session cookies and forget the server-side state.
    async fn delete_session(&self, cookies: &Cookies) -> SessionResult<()>;

    fn get_cookie_refresh_token(&self, cookies: &Cookies) -> Option<String>;

    fn update_cookie_refresh_token(&self, cookies: &Cookies, refresh_token: &str);

    /// Drop expired server-side state. Returns the number of removed sessions.
    async fn prune(&self) -> SessionResult<usize>;
}
