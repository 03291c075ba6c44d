//! Filesystem backend: the cookie names a file, the file holds the session.
//!
//! No state is kept in memory, so any replica mounting the same directory
//! (and sharing the cookie key) can serve any request, and sessions survive
//! restarts. Each file holds a sealed JSON [`LoginState`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use snafu::{OptionExt as _, ResultExt as _};
use tokio::fs;
use tower_cookies::Cookies;
use tower_cookies::cookie::SameSite;
use tracing::{debug, info, warn};

use crate::codec::{CookieCodec, CookieSettings};
use crate::error::{
    CorruptSessionSnafu, EncodeSnafu, FmtCompact as _, IoSnafu, SessionError, SessionResult,
};
use crate::login_state::{LoginState, random_token};
use crate::store::{REFRESH_TOKEN_COOKIE, SessionStore};
use crate::token::{IdTokenVerifier, TokenResponse, VerifiedToken};
use crate::{Key, fingerprint};

const LOG_TARGET: &str = "console::session::filesystem";

pub const SESSION_FILE_COOKIE: &str = "console-session-file";

const FILE_PREFIX: &str = "session_";
const PAYLOAD_PURPOSE: &str = "console-session-payload";

fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub struct FilesystemSessionStore {
    dir: PathBuf,
    codec: CookieCodec,
}

impl FilesystemSessionStore {
    /// Open (creating if needed) the session directory.
    pub async fn new(
        dir: impl Into<PathBuf>,
        key: Key,
        settings: CookieSettings,
    ) -> SessionResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: dir.clone() })?;
        Ok(Self {
            dir,
            codec: CookieCodec::new(key, settings, SameSite::Strict),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{file_id}"))
    }

    /// The cookie's file id, if it is present, authentic and well-formed.
    fn cookie_file_id(&self, cookies: &Cookies) -> Option<String> {
        self.codec
            .read(cookies, SESSION_FILE_COOKIE)
            .filter(|file_id| is_valid_file_id(file_id))
    }

    /// Read a session file regardless of the session's expiry.
    async fn load(&self, file_id: &str) -> SessionResult<Option<LoginState>> {
        let path = self.file_path(file_id);
        let sealed = match fs::read_to_string(&path).await {
            Ok(sealed) => sealed,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(IoSnafu { path }),
        };

        let payload = self
            .codec
            .unseal(PAYLOAD_PURPOSE, sealed.trim())
            .context(CorruptSessionSnafu)?;
        let state: LoginState =
            serde_json::from_str(&payload).map_err(|_| CorruptSessionSnafu.build())?;
        if !state.is_well_formed() {
            return CorruptSessionSnafu.fail();
        }
        Ok(Some(state))
    }

    async fn save(&self, file_id: &str, state: &LoginState) -> SessionResult<()> {
        let payload = serde_json::to_string(state).context(EncodeSnafu)?;
        let sealed = self
            .codec
            .seal(PAYLOAD_PURPOSE, payload)
            .context(CorruptSessionSnafu)?;

        // Write-then-rename, so readers on other replicas never see a torn file.
        let path = self.file_path(file_id);
        let tmp_path = self.dir.join(format!(".{FILE_PREFIX}{file_id}.{}", random_token()));
        fs::write(&tmp_path, sealed)
            .await
            .context(IoSnafu { path: tmp_path.clone() })?;
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err).context(IoSnafu { path });
        }
        Ok(())
    }

    async fn remove_file(&self, file_id: &str) -> SessionResult<()> {
        let path = self.file_path(file_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }

    fn write_cookies(&self, cookies: &Cookies, file_id: &str, state: &LoginState) {
        self.codec
            .write(cookies, SESSION_FILE_COOKIE, file_id.to_owned());
        match state.refresh_token() {
            Some(refresh_token) => {
                self.codec
                    .write(cookies, REFRESH_TOKEN_COOKIE, refresh_token.to_owned());
            }
            None => self.codec.clear(cookies, REFRESH_TOKEN_COOKIE),
        }
    }

    fn clear_cookies(&self, cookies: &Cookies) {
        self.codec.clear(cookies, SESSION_FILE_COOKIE);
        self.codec.clear(cookies, REFRESH_TOKEN_COOKIE);
    }

    /// Remove session files not rewritten within `max_age`.
    pub async fn prune_files(&self, max_age: Duration) -> SessionResult<usize> {
        let io_context = || IoSnafu {
            path: self.dir.clone(),
        };
        let mut entries = fs::read_dir(&self.dir).await.with_context(|_| io_context())?;
        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await.with_context(|_| io_context())? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(FILE_PREFIX) && !name.starts_with(&format!(".{FILE_PREFIX}")) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    debug!(target: LOG_TARGET, err = %err.fmt_compact(), %name, "Can't stat session file");
                    continue;
                }
            };
            let stale = now
                .duration_since(modified)
                .is_ok_and(|age| max_age < age);
            if stale {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(target: LOG_TARGET, err = %err.fmt_compact(), %name, "Failed to remove stale session file");
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for FilesystemSessionStore {
    async fn add_session(
        &self,
        cookies: &Cookies,
        verifier: &dyn IdTokenVerifier,
        token: &TokenResponse,
    ) -> SessionResult<LoginState> {
        let state = LoginState::new(verifier, token).await?;
        let file_id = random_token();
        self.save(&file_id, &state).await?;
        self.write_cookies(cookies, &file_id, &state);
        info!(
            target: LOG_TARGET,
            user_id = %state.user_id(),
            session = %fingerprint(state.session_token()),
            "Session created"
        );
        Ok(state)
    }

    async fn get_session(&self, cookies: &Cookies) -> SessionResult<Option<LoginState>> {
        let Some(file_id) = self.cookie_file_id(cookies) else {
            return Ok(None);
        };

        let state = match self.load(&file_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(err @ SessionError::CorruptSession) => {
                warn!(target: LOG_TARGET, file = %fingerprint(&file_id), "Discarding undecodable session file");
                self.remove_file(&file_id).await?;
                self.clear_cookies(cookies);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if state.is_expired() {
            // With a refresh token around, the refresh rewrites this file in
            // place; concurrent requests rely on finding it there.
            if self.get_cookie_refresh_token(cookies).is_none() {
                debug!(target: LOG_TARGET, session = %fingerprint(state.session_token()), "Session expired, removing");
                self.delete_session(cookies).await?;
            }
            return Ok(None);
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
        let file_id = self.cookie_file_id(cookies).unwrap_or_else(random_token);

        let existing = match self.load(&file_id).await {
            Ok(existing) => existing,
            Err(SessionError::CorruptSession) => {
                warn!(target: LOG_TARGET, file = %fingerprint(&file_id), "Overwriting undecodable session file");
                None
            }
            Err(err) => return Err(err),
        };

        let state = match existing {
            Some(mut state) => {
                state.apply_verified(&verified).inspect_err(|err| {
                    warn!(
                        target: LOG_TARGET,
                        %err,
                        session_user = %state.user_id(),
                        token_user = %verified.user_id(),
                        "Refusing to continue session as a different user"
                    );
                })?;
                state
            }
            None => {
                debug!(target: LOG_TARGET, "No session to continue, starting a new one");
                LoginState::from_verified(&verified)
            }
        };

        self.save(&file_id, &state).await?;
        self.write_cookies(cookies, &file_id, &state);
        Ok(state)
    }

    async fn delete_session(&self, cookies: &Cookies) -> SessionResult<()> {
        let file_id = self.cookie_file_id(cookies);
        self.clear_cookies(cookies);
        if let Some(file_id) = file_id {
            if let Err(err) = self.remove_file(&file_id).await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Failed to remove session file");
            }
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
        let max_age = self.codec.settings().max_age.unsigned_abs();
        self.prune_files(max_age).await
    }
}
