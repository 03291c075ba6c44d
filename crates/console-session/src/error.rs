use std::path::PathBuf;
use std::{error, fmt, io};

use snafu::Snafu;

/// Error type returned by injected collaborators (verifier, token source).
pub type BoxedError = Box<dyn error::Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = std::result::Result<T, BoxedError>;

/// The ID token could not be turned into a session identity.
///
/// Never recoverable: the user has to go through the login flow again.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClaimError {
    #[snafu(display("token response did not contain an id_token"))]
    MissingIdToken,
    #[snafu(display("id token verification failed"))]
    Verification { source: BoxedError },
    #[snafu(display("id token has no subject claim"))]
    MissingSubject,
    #[snafu(display("id token has no expiry claim"))]
    MissingExpiry,
    #[snafu(display("id token expiry is out of range"))]
    InvalidExpiry { source: time::error::ComponentRange },
}

pub type ClaimResult<T> = std::result::Result<T, ClaimError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(transparent)]
    Claim { source: ClaimError },
    /// A refresh authenticated a different identity than the session it was
    /// supposed to continue.
    #[snafu(display("session identity changed during refresh"))]
    Security {
        session_user: String,
        token_user: String,
    },
    #[snafu(display("no session could be resolved"))]
    NotFound,
    #[snafu(display("identity provider refused the refresh grant"))]
    UpstreamRefresh { source: BoxedError },
    #[snafu(display("session index invariant violated: {msg}"))]
    Invariant { msg: String },
    #[snafu(display("session file io error: {}", path.display()))]
    Io { source: io::Error, path: PathBuf },
    #[snafu(display("session payload encoding failed"))]
    Encode { source: serde_json::Error },
    #[snafu(display("session payload is corrupt"))]
    CorruptSession,
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Identity mismatch; worth a security-relevant log line.
    pub fn is_security(&self) -> bool {
        matches!(self, SessionError::Security { .. })
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, SessionError::UpstreamRefresh { .. })
    }
}

/// Renders an error and all of its `source()`s on a single line, suitable for
/// a log field.
pub struct CompactChain<'e>(&'e (dyn error::Error + 'static));

impl fmt::Display for CompactChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chain = std::iter::successors(Some(self.0), |err| err.source());
        if let Some(first) = chain.next() {
            write!(f, "{first}")?;
        }
        for cause in chain {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactChain<'_>;
}

impl<E> FmtCompact for E
where
    E: error::Error + 'static,
{
    fn fmt_compact(&self) -> CompactChain<'_> {
        CompactChain(self)
    }
}
