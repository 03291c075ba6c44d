use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use console_session::SessionError;
use console_session::error::FmtCompact as _;
use serde::Serialize;
use snafu::Snafu;
use tracing::{debug, warn};

use crate::LOG_TARGET;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RequestError {
    #[snafu(display("login required"))]
    LoginRequired {
        login_path: Arc<str>,
        redirect: Option<String>,
    },
    /// The session layer failed; the request is treated as unauthenticated.
    #[snafu(display("session unusable"))]
    Session {
        source: SessionError,
        login_path: Arc<str>,
        redirect: Option<String>,
    },
    #[snafu(display("InternalServerError: {msg}"))]
    InternalServerError { msg: &'static str },
}
pub type RequestResult<T> = std::result::Result<T, RequestError>;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

fn login_redirect(login_path: &str, redirect: Option<&str>) -> Response {
    let url = match redirect {
        Some(path) => format!("{login_path}?redirect={}", urlencoding::encode(path)),
        None => login_path.to_owned(),
    };
    Redirect::to(&url).into_response()
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        debug!(
            target: LOG_TARGET,
            err = %self.fmt_compact(),
            "Request Error"
        );

        match self {
            RequestError::LoginRequired {
                login_path,
                redirect,
            } => login_redirect(&login_path, redirect.as_deref()),
            RequestError::Session {
                source,
                login_path,
                redirect,
            } => {
                if source.is_security() {
                    warn!(
                        target: LOG_TARGET,
                        err = %source.fmt_compact(),
                        "Session rejected for security reasons"
                    );
                } else {
                    debug!(
                        target: LOG_TARGET,
                        err = %source.fmt_compact(),
                        "Session unusable, sending to login"
                    );
                }
                login_redirect(&login_path, redirect.as_deref())
            }
            err @ RequestError::InternalServerError { .. } => {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Unexpected Request Error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(ErrorResponse {
                        message: "Internal Service Error".to_owned(),
                    }),
                )
                    .into_response()
            }
        }
    }
}
