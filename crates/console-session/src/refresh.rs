//! Coordinated session refresh.
//!
//! Several requests of one browser tend to notice an expiring session at the
//! same time. Only one of them may spend the (often single-use) refresh token;
//! the others have to wait for it and adopt its result.

mod locks;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use snafu::ResultExt as _;
use tower_cookies::Cookies;
use tracing::{debug, info, warn};

use self::locks::RefreshLocks;
use crate::config::RefreshTokenRotation;
use crate::error::{FmtCompact as _, SessionResult, UpstreamRefreshSnafu};
use crate::fingerprint;
use crate::login_state::LoginState;
use crate::store::SessionStore;
use crate::token::{IdTokenVerifier, TokenResponse, TokenSource};

const LOG_TARGET: &str = "console::session::refresh";

/// How a refresh request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshPath {
    /// The identity provider was asked for new tokens.
    Full,
    /// A concurrent request had already refreshed the session.
    ShortCircuit,
    /// The refresh failed before it could be classified.
    Unknown,
}

impl RefreshPath {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshPath::Full => "full",
            RefreshPath::ShortCircuit => "short-circuit",
            RefreshPath::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RefreshPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of handled refreshes, per [`RefreshPath`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub full: u64,
    pub short_circuit: u64,
    pub unknown: u64,
}

#[derive(Default)]
struct RefreshCounters {
    full: AtomicU64,
    short_circuit: AtomicU64,
    unknown: AtomicU64,
}

impl RefreshCounters {
    fn record(&self, path: RefreshPath) {
        let counter = match path {
            RefreshPath::Full => &self.full,
            RefreshPath::ShortCircuit => &self.short_circuit,
            RefreshPath::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RefreshStats {
        RefreshStats {
            full: self.full.load(Ordering::Relaxed),
            short_circuit: self.short_circuit.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

#[derive(bon::Builder)]
pub struct RefreshCoordinator {
    store: Arc<dyn SessionStore>,
    verifier: Arc<dyn IdTokenVerifier>,
    token_source: Arc<dyn TokenSource>,
    #[builder(default)]
    rotation: RefreshTokenRotation,
    refresh_timeout: Option<Duration>,
    #[builder(skip)]
    locks: RefreshLocks,
    #[builder(skip)]
    counters: RefreshCounters,
}

impl RefreshCoordinator {
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn verifier(&self) -> &Arc<dyn IdTokenVerifier> {
        &self.verifier
    }

    pub fn stats(&self) -> RefreshStats {
        self.counters.snapshot()
    }

    /// Resolve the session of a request, refreshing it when it is missing or
    /// due for rotation and the request carries a refresh token.
    ///
    /// `Ok(None)` means the request is not authenticated.
    pub async fn authenticate(&self, cookies: &Cookies) -> SessionResult<Option<LoginState>> {
        let session = self.store.get_session(cookies).await?;
        if let Some(session) = &session
            && !session.should_rotate()
        {
            return Ok(Some(session.clone()));
        }

        let Some(refresh_token) = self.store.get_cookie_refresh_token(cookies) else {
            return Ok(session.filter(|session| !session.is_expired()));
        };

        match self.refresh_session(cookies, &refresh_token).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            // The old tokens are still good for a while; try again next time.
            Err(err) if err.is_upstream() => match session.filter(|s| !s.is_expired()) {
                Some(session) => {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        user_id = %session.user_id(),
                        "Proactive refresh failed, keeping current tokens"
                    );
                    Ok(Some(session))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Refresh the request's session using `cookie_refresh_token`, serialized
    /// with every other refresh of the same token.
    pub async fn refresh_session(
        &self,
        cookies: &Cookies,
        cookie_refresh_token: &str,
    ) -> SessionResult<LoginState> {
        let _guard = self.locks.acquire(cookie_refresh_token).await;

        let res = self.refresh_locked(cookies, cookie_refresh_token).await;
        let path = match &res {
            Ok((_, path)) => *path,
            Err(_) => RefreshPath::Unknown,
        };
        self.counters.record(path);
        match &res {
            Ok((session, _)) => info!(
                target: LOG_TARGET,
                refresh_path = %path,
                user_id = %session.user_id(),
                refresh_token = %fingerprint(cookie_refresh_token),
                "Session refresh handled"
            ),
            Err(err) => warn!(
                target: LOG_TARGET,
                refresh_path = %path,
                err = %err.fmt_compact(),
                refresh_token = %fingerprint(cookie_refresh_token),
                "Session refresh failed"
            ),
        }
        res.map(|(session, _)| session)
    }

    async fn refresh_locked(
        &self,
        cookies: &Cookies,
        cookie_refresh_token: &str,
    ) -> SessionResult<(LoginState, RefreshPath)> {
        if let Some(current) = self.store.get_session(cookies).await?
            && self.already_refreshed(&current, cookie_refresh_token)
        {
            if let Some(refresh_token) = current.refresh_token() {
                self.store.update_cookie_refresh_token(cookies, refresh_token);
            }
            return Ok((current, RefreshPath::ShortCircuit));
        }

        let token = self.exchange(cookie_refresh_token).await?;
        let session = self
            .store
            .update_tokens(cookies, self.verifier.as_ref(), &token)
            .await?;
        Ok((session, RefreshPath::Full))
    }

    fn already_refreshed(&self, current: &LoginState, cookie_refresh_token: &str) -> bool {
        if current.is_expired() {
            return false;
        }
        match self.rotation {
            RefreshTokenRotation::Rotating => current
                .refresh_token()
                .is_some_and(|token| token != cookie_refresh_token),
            RefreshTokenRotation::Stable => !current.should_rotate(),
        }
    }

    async fn exchange(&self, refresh_token: &str) -> SessionResult<TokenResponse> {
        debug!(
            target: LOG_TARGET,
            refresh_token = %fingerprint(refresh_token),
            "Requesting new tokens"
        );
        let exchange = self.token_source.refresh(refresh_token);
        let res = match self.refresh_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(res) => res,
                Err(elapsed) => Err(elapsed.into()),
            },
            None => exchange.await,
        };
        res.context(UpstreamRefreshSnafu)
    }
}
