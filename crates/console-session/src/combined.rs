//! In-memory backend: the cookie names a session, the index holds it.

use std::sync::Arc;

use async_trait::async_trait;
use tower_cookies::Cookies;
use tower_cookies::cookie::SameSite;
use tracing::{debug, info, warn};

use crate::codec::{CookieCodec, CookieSettings};
use crate::error::SessionResult;
use crate::index::SessionIndex;
use crate::login_state::LoginState;
use crate::store::{REFRESH_TOKEN_COOKIE, SessionStore};
use crate::token::{IdTokenVerifier, TokenResponse, VerifiedToken};
use crate::{Key, fingerprint};

const LOG_TARGET: &str = "console::session::combined";

pub const SESSION_TOKEN_COOKIE: &str = "console-session-token";

pub struct CombinedSessionStore {
    index: Arc<SessionIndex>,
    codec: CookieCodec,
}

impl CombinedSessionStore {
    pub fn new(index: Arc<SessionIndex>, key: Key, settings: CookieSettings) -> Self {
        Self {
            index,
            codec: CookieCodec::new(key, settings, SameSite::Lax),
        }
    }

    pub fn index(&self) -> &Arc<SessionIndex> {
        &self.index
    }

    fn cookie_tokens(&self, cookies: &Cookies) -> (Option<String>, Option<String>) {
        (
            self.codec.read(cookies, SESSION_TOKEN_COOKIE),
            self.codec.read(cookies, REFRESH_TOKEN_COOKIE),
        )
    }

    fn write_cookies(&self, cookies: &Cookies, state: &LoginState) {
        self.codec.write(
            cookies,
            SESSION_TOKEN_COOKIE,
            state.session_token().to_owned(),
        );
        match state.refresh_token() {
            Some(refresh_token) => {
                self.codec
                    .write(cookies, REFRESH_TOKEN_COOKIE, refresh_token.to_owned());
            }
            None => self.codec.clear(cookies, REFRESH_TOKEN_COOKIE),
        }
    }

    fn add_verified(
        &self,
        verified: &VerifiedToken,
        previous_refresh_token: Option<&str>,
    ) -> SessionResult<LoginState> {
        let state = LoginState::from_verified(verified);
        self.index
            .add_session_with_previous(state.clone(), previous_refresh_token)?;
        Ok(state)
    }
}

#[async_trait]
impl SessionStore for CombinedSessionStore {
    async fn add_session(
        &self,
        cookies: &Cookies,
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> SessionResult<LoginState> {
        let verified = VerifiedToken::verify(verifier, token).await?;
        let state = self.add_verified(&verified, None)?;
        self.write_cookies(cookies, &state);
        info!(
            target: LOG_TARGET,
            user_id = %state.user_id(),
            session = %fingerprint(state.session_token()),
            "Session created"
        );
        Ok(state)
    }

    async fn get_session(&self, cookies: &Cookies) -> SessionResult<Option<LoginState>> {
        let (session_token, refresh_token) = self.cookie_tokens(cookies);
        let Some(state) = self
            .index
            .get_session(session_token.as_deref(), refresh_token.as_deref())
        else {
            return Ok(None);
        };

        if session_token.as_deref() != Some(state.session_token()) {
            debug!(
                target: LOG_TARGET,
                session = %fingerprint(state.session_token()),
                "Session found by refresh token, re-binding session cookie"
            );
            self.codec.write(
                cookies,
                SESSION_TOKEN_COOKIE,
                state.session_token().to_owned(),
            );
        }
        Ok(Some(state))
    }

    async fn update_tokens(
        &self,
        cookies: &Cookies,
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> SessionResult<LoginState> {
        let verified = VerifiedToken::verify(verifier, token).await?;
        let (session_token, refresh_token) = self.cookie_tokens(cookies);

        let existing = self
            .index
            .get_session(session_token.as_deref(), refresh_token.as_deref());
        let updated = match existing {
            Some(existing) => self
                .index
                .update_tokens(existing.session_token(), &verified)
                .inspect_err(|err| {
                    if err.is_security() {
                        warn!(
                            target: LOG_TARGET,
                            %err,
                            session_user = %existing.user_id(),
                            token_user = %verified.user_id(),
                            "Refusing to continue session as a different user"
                        );
                    }
                })?,
            None => None,
        };

        let state = match updated {
            Some(state) => state,
            None => {
                // Pruned here or created by another replica. The spent token
                // must still lead concurrent requests to the new session.
                debug!(target: LOG_TARGET, "No session to continue, starting a new one");
                self.add_verified(&verified, refresh_token.as_deref())?
            }
        };

        self.write_cookies(cookies, &state);
        Ok(state)
    }

    async fn delete_session(&self, cookies: &Cookies) -> SessionResult<()> {
        let (session_token, refresh_token) = self.cookie_tokens(cookies);
        self.codec.clear(cookies, SESSION_TOKEN_COOKIE);
        self.codec.clear(cookies, REFRESH_TOKEN_COOKIE);

        // The session may live in another replica's index; the cookies are
        // gone either way.
        match self
            .index
            .delete_session(session_token.as_deref(), refresh_token.as_deref())
        {
            Some(state) => info!(
                target: LOG_TARGET,
                user_id = %state.user_id(),
                session = %fingerprint(state.session_token()),
                "Session deleted"
            ),
            None => debug!(target: LOG_TARGET, "Session to delete not indexed here"),
        }
        Ok(())
    }

    fn get_cookie_refresh_token(&self, cookies: &Cookies) -> Option<String> {
        self.codec.read(cookies, REFRESH_TOKEN_COOKIE)
    }

    fn update_cookie_refresh_token(&self, cookies: &Cookies, refresh_token: &str) {
        self.codec
            .write(cookies, REFRESH_TOKEN_COOKIE, refresh_token.to_owned());
    }

    async fn prune(&self) -> SessionResult<usize> {
        Ok(self.index.prune_sessions())
    }
}
