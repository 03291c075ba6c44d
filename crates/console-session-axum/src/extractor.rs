use axum::extract::{FromRef, FromRequestParts};
use axum::http::request;
use console_session::LoginState;
use snafu::ResultExt as _;
use tower_cookies::Cookies;

use crate::AuthState;
use crate::error::{InternalServerSnafu, LoginRequiredSnafu, RequestError, SessionSnafu};

/// The caller's session, refreshed if it was about to expire.
///
/// Rejects unauthenticated requests with a redirect to the login page.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession(pub LoginState);

/// Like [`AuthenticatedSession`], but lets unauthenticated requests through.
///
/// Session failures still reject the request.
#[derive(Debug, Clone)]
pub struct OptionalSession(pub Option<LoginState>);

fn original_uri(req: &request::Parts) -> Option<String> {
    req.uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_owned())
}

async fn authenticate<S>(
    req: &mut request::Parts,
    state: &S,
) -> Result<(AuthState, Option<LoginState>), RequestError>
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    let auth = AuthState::from_ref(state);
    let cookies = Cookies::from_request_parts(req, state)
        .await
        .map_err(|(_, msg)| InternalServerSnafu { msg }.build())?;

    let session = auth
        .coordinator()
        .authenticate(&cookies)
        .await
        .with_context(|_| SessionSnafu {
            login_path: auth.login_path().clone(),
            redirect: original_uri(req),
        })?;
    Ok((auth, session))
}

impl<S> FromRequestParts<S> for AuthenticatedSession
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = RequestError;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let (auth, session) = authenticate(req, state).await?;
        let session = session.ok_or_else(|| {
            LoginRequiredSnafu {
                login_path: auth.login_path().clone(),
                redirect: original_uri(req),
            }
            .build()
        })?;
        Ok(Self(session))
    }
}

impl<S> FromRequestParts<S> for OptionalSession
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = RequestError;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let (_, session) = authenticate(req, state).await?;
        Ok(Self(session))
    }
}
