use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ClaimResult, SecuritySnafu, SessionResult};
use crate::token::{IdTokenVerifier, TokenResponse, VerifiedToken};

/// Fraction of the remaining token lifetime after which a session should be
/// refreshed proactively.
const ROTATE_FRACTION: f64 = 0.8;

/// Random, url-safe identifier with 256 bits of entropy.
pub(crate) fn random_token() -> String {
    let bytes: [u8; 32] = rand::random();
    data_encoding::BASE64URL_NOPAD.encode(&bytes)
}

fn compute_rotate_at(now: OffsetDateTime, expires_at: OffsetDateTime) -> OffsetDateTime {
    if expires_at <= now {
        return expires_at;
    }
    let rotate_at = (now + (expires_at - now) * ROTATE_FRACTION).min(expires_at);
    // Whole seconds, so the value survives the timestamp serialization.
    rotate_at.replace_nanosecond(0).unwrap_or(rotate_at)
}

/// An authenticated user session.
///
/// Only [`LoginState::update_tokens`] (and its sync counterpart) changes a
/// value after construction, and it never changes the `session_token`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    session_token: String,
    user_id: String,
    username: String,
    email: String,
    access_token: String,
    refresh_token: String,
    #[serde(with = "time::serde::timestamp")]
    expires_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    rotate_at: OffsetDateTime,
}

impl LoginState {
    /// Verify the ID token of a token response and start a new session for it.
    pub async fn new(verifier: &dyn IdTokenVerifier, token: &TokenResponse) -> ClaimResult<Self> {
        let verified = VerifiedToken::verify(verifier, token).await?;
        Ok(Self::from_verified(&verified))
    }

    pub fn from_verified(verified: &VerifiedToken) -> Self {
        Self::from_verified_at(verified, OffsetDateTime::now_utc())
    }

    pub(crate) fn from_verified_at(verified: &VerifiedToken, now: OffsetDateTime) -> Self {
        Self {
            session_token: random_token(),
            user_id: verified.user_id.clone(),
            username: verified.username.clone(),
            email: verified.email.clone(),
            access_token: verified.raw_token.clone(),
            refresh_token: verified.refresh_token.clone().unwrap_or_default(),
            expires_at: verified.expires_at,
            rotate_at: compute_rotate_at(now, verified.expires_at),
        }
    }

    /// Verify a refreshed token response and move this session onto it.
    ///
    /// Fails with [`crate::SessionError::Security`] and leaves `self` untouched
    /// if the new token belongs to a different subject.
    pub async fn update_tokens(
        &mut self,
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> SessionResult<()> {
        let verified = VerifiedToken::verify(verifier, token).await?;
        self.apply_verified(&verified)
    }

    pub fn apply_verified(&mut self, verified: &VerifiedToken) -> SessionResult<()> {
        self.apply_verified_at(verified, OffsetDateTime::now_utc())
    }

    pub(crate) fn apply_verified_at(
        &mut self,
        verified: &VerifiedToken,
        now: OffsetDateTime,
    ) -> SessionResult<()> {
        if verified.user_id != self.user_id {
            return SecuritySnafu {
                session_user: self.user_id.clone(),
                token_user: verified.user_id.clone(),
            }
            .fail();
        }

        self.access_token = verified.raw_token.clone();
        // Providers that don't rotate refresh tokens may omit them on refresh.
        if let Some(refresh_token) = &verified.refresh_token {
            self.refresh_token = refresh_token.clone();
        }
        if !verified.username.is_empty() {
            self.username = verified.username.clone();
        }
        if !verified.email.is_empty() {
            self.email = verified.email.clone();
        }
        self.expires_at = verified.expires_at;
        self.rotate_at = compute_rotate_at(now, verified.expires_at);
        Ok(())
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// The raw bearer token forwarded to the cluster API.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// `None` when the provider issued no refresh token.
    pub fn refresh_token(&self) -> Option<&str> {
        Some(self.refresh_token.as_str()).filter(|token| !token.is_empty())
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    pub fn rotate_at(&self) -> OffsetDateTime {
        self.rotate_at
    }

    pub fn should_rotate(&self) -> bool {
        self.should_rotate_at(OffsetDateTime::now_utc())
    }

    pub fn should_rotate_at(&self, now: OffsetDateTime) -> bool {
        self.rotate_at < now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at < now
    }

    /// Check invariants of a value that came from outside (e.g. a file).
    pub(crate) fn is_well_formed(&self) -> bool {
        !self.session_token.is_empty() && !self.user_id.is_empty() && self.rotate_at <= self.expires_at
    }
}

impl fmt::Debug for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginState")
            .field("session", &crate::fingerprint(&self.session_token))
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .field("rotate_at", &self.rotate_at)
            .finish_non_exhaustive()
    }
}
