//! Interfaces to the identity provider.
//!
//! Signature verification and the OAuth2 refresh grant live outside of this
//! crate. The session code only sees them through [`IdTokenVerifier`] and
//! [`TokenSource`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, ResultExt as _};
use time::OffsetDateTime;

use crate::error::{
    BoxedErrorResult, ClaimResult, InvalidExpirySnafu, MissingExpirySnafu, MissingIdTokenSnafu,
    MissingSubjectSnafu, VerificationSnafu,
};

/// Claims of a verified ID token that the session cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub sub: Option<String>,
    /// Unix timestamp, seconds.
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Token endpoint response, as handed over by the OAuth2 client.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Verifies signature, issuer and audience of a raw ID token.
#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    async fn verify(&self, raw_id_token: &str) -> BoxedErrorResult<IdTokenClaims>;
}

/// Performs the refresh-grant exchange with the identity provider.
///
/// Dropping the returned future must abort the exchange.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> BoxedErrorResult<TokenResponse>;
}

/// An ID token that passed verification and carries every mandatory claim.
#[derive(Clone)]
pub struct VerifiedToken {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) email: String,
    pub(crate) raw_token: String,
    pub(crate) refresh_token: Option<String>,
    pub(crate) expires_at: OffsetDateTime,
}

impl VerifiedToken {
    pub async fn verify(
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> ClaimResult<Self> {
        let raw_token = token.id_token.as_deref().context(MissingIdTokenSnafu)?;
        let claims = verifier
            .verify(raw_token)
            .await
            .context(VerificationSnafu)?;
        Self::from_claims(claims, raw_token, token.refresh_token.as_deref())
    }

    pub(crate) fn from_claims(
        claims: IdTokenClaims,
        raw_token: &str,
        refresh_token: Option<&str>,
    ) -> ClaimResult<Self> {
        let user_id = claims
            .sub
            .filter(|sub| !sub.is_empty())
            .context(MissingSubjectSnafu)?;
        let exp = claims.exp.context(MissingExpirySnafu)?;
        let expires_at = OffsetDateTime::from_unix_timestamp(exp).context(InvalidExpirySnafu)?;

        Ok(Self {
            user_id,
            username: claims.name.unwrap_or_default(),
            email: claims.email.unwrap_or_default(),
            raw_token: raw_token.to_owned(),
            refresh_token: refresh_token
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned),
            expires_at,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

impl fmt::Debug for VerifiedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedToken")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
