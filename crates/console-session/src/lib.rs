//! Login sessions of the admin console.
//!
//! A successful OIDC login turns into a [`LoginState`], kept by one of two
//! [`SessionStore`] backends:
//!
//! * [`CombinedSessionStore`]: an in-memory [`SessionIndex`] keyed by an
//!   opaque session token carried in an encrypted cookie,
//! * [`FilesystemSessionStore`]: a sealed file per session in a shared
//!   directory, named by an encrypted cookie.
//!
//! Either way the refresh token travels in its own encrypted cookie, and a
//! [`RefreshCoordinator`] makes sure concurrent requests of a browser spend it
//! only once.

pub mod codec;
pub mod combined;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod index;
pub mod login_state;
pub mod pruner;
pub mod refresh;
pub mod service;
pub mod store;
pub mod token;

#[cfg(test)]
mod test_util;

pub use tower_cookies::Key;

pub use self::codec::CookieSettings;
pub use self::combined::{CombinedSessionStore, SESSION_TOKEN_COOKIE};
pub use self::config::{RefreshTokenRotation, SessionConfig, SessionOpts};
pub use self::error::{ClaimError, SessionError, SessionResult};
pub use self::filesystem::{FilesystemSessionStore, SESSION_FILE_COOKIE};
pub use self::index::SessionIndex;
pub use self::login_state::LoginState;
pub use self::refresh::{RefreshCoordinator, RefreshPath, RefreshStats};
pub use self::service::SessionService;
pub use self::store::{REFRESH_TOKEN_COOKIE, SessionStore};
pub use self::token::{IdTokenClaims, IdTokenVerifier, TokenResponse, TokenSource};

/// Short, non-reversible tag for a secret, safe to put in logs.
pub(crate) fn fingerprint(secret: &str) -> String {
    let hash = blake3::hash(secret.as_bytes());
    let mut hex = hash.to_hex().to_string();
    hex.truncate(12);
    hex
}
