use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BoxedErrorResult;
use crate::token::{IdTokenClaims, IdTokenVerifier, TokenResponse, VerifiedToken};

/// Treats the raw ID token as the JSON encoding of its claims.
///
/// A token equal to `"reject"` fails verification.
pub(crate) struct JsonClaimsVerifier;

#[async_trait]
impl IdTokenVerifier for JsonClaimsVerifier {
    async fn verify(&self, raw_id_token: &str) -> BoxedErrorResult<IdTokenClaims> {
        if raw_id_token == "reject" {
            return Err("signature mismatch".into());
        }
        Ok(serde_json::from_str(raw_id_token)?)
    }
}

pub(crate) fn claims(sub: &str, exp: OffsetDateTime) -> IdTokenClaims {
    IdTokenClaims {
        sub: Some(sub.to_owned()),
        exp: Some(exp.unix_timestamp()),
        email: Some(format!("{sub}@example.com")),
        name: Some(sub.to_owned()),
    }
}

pub(crate) fn token_response(claims: &IdTokenClaims, refresh_token: Option<&str>) -> TokenResponse {
    TokenResponse {
        access_token: "opaque-access".to_owned(),
        id_token: Some(serde_json::to_string(claims).expect("claims serialize")),
        refresh_token: refresh_token.map(ToOwned::to_owned),
    }
}

pub(crate) fn verified(sub: &str, exp: OffsetDateTime, refresh_token: Option<&str>) -> VerifiedToken {
    let claims = claims(sub, exp);
    let raw = serde_json::to_string(&claims).expect("claims serialize");
    VerifiedToken::from_claims(claims, &raw, refresh_token).expect("claims are complete")
}
