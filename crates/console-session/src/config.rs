use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, io};

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tokio::fs;
use tracing::{info, warn};

use crate::Key;
use crate::codec::CookieSettings;
use crate::index::DEFAULT_MAX_SESSIONS;

const LOG_TARGET: &str = "console::session::config";

/// Length of the cookie master key, as expected by the private cookie jar.
pub const COOKIE_KEY_LEN: usize = 64;
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// What the identity provider does to a refresh token once it was used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RefreshTokenRotation {
    /// Every refresh hands out a new refresh token and invalidates the old
    /// one. A session whose refresh token differs from the one a request
    /// carries has already been refreshed by someone else.
    #[default]
    Rotating,
    /// The refresh token stays valid. A session is considered refreshed as
    /// long as it is not due for rotation.
    Stable,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SessionBackend {
    #[default]
    Combined,
    Filesystem,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("can't read cookie key file {}", path.display()))]
    KeyRead { source: io::Error, path: PathBuf },
    #[snafu(display(
        "cookie key file {} must contain exactly {COOKIE_KEY_LEN} bytes, found {len}",
        path.display()
    ))]
    InvalidKey { path: PathBuf, len: usize },
    #[snafu(display("can't write cookie key file {}", path.display()))]
    KeyWrite { source: io::Error, path: PathBuf },
    #[snafu(display("the filesystem session backend needs --session-dir"))]
    MissingSessionDir,
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Command line / environment options of the session layer.
///
/// Meant to be `#[command(flatten)]`ed into the embedding binary's options.
#[derive(Debug, Clone, clap::Args)]
pub struct SessionOpts {
    /// Where sessions are kept
    #[arg(long, env = "CONSOLE_SESSION_BACKEND", value_enum, default_value_t)]
    pub session_backend: SessionBackend,

    /// Directory holding session files (filesystem backend)
    #[arg(long, env = "CONSOLE_SESSION_DIR")]
    pub session_dir: Option<PathBuf>,

    /// File with the 64-byte cookie encryption key, generated if missing
    ///
    /// Without it every restart invalidates all session cookies.
    #[arg(long, env = "CONSOLE_COOKIE_KEY_FILE")]
    pub cookie_key_file: Option<PathBuf>,

    #[arg(long, env = "CONSOLE_COOKIE_PATH", default_value = "/")]
    pub cookie_path: String,

    /// Mark session cookies `Secure` (serve over https only)
    #[arg(long, env = "CONSOLE_SECURE_COOKIES")]
    pub secure_cookies: bool,

    #[arg(long, env = "CONSOLE_COOKIE_MAX_AGE_SECS", default_value_t = 30 * 24 * 60 * 60)]
    pub cookie_max_age_secs: u32,

    /// Capacity of the in-memory session index (combined backend)
    #[arg(long, env = "CONSOLE_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Seconds between expired session sweeps, `0` disables them
    #[arg(long, env = "CONSOLE_SESSION_PRUNE_INTERVAL_SECS", default_value_t = 300)]
    pub session_prune_interval_secs: u64,

    #[arg(long, env = "CONSOLE_REFRESH_TOKEN_ROTATION", value_enum, default_value_t)]
    pub refresh_token_rotation: RefreshTokenRotation,

    /// Upper bound on a token refresh round-trip, `0` disables it
    #[arg(long, env = "CONSOLE_REFRESH_TIMEOUT_SECS", default_value_t = 30)]
    pub refresh_timeout_secs: u64,

    #[arg(long, env = "CONSOLE_LOGIN_PATH", default_value = DEFAULT_LOGIN_PATH)]
    pub login_path: String,
}

impl SessionOpts {
    pub async fn load_config(&self) -> ConfigResult<SessionConfig> {
        let key = match &self.cookie_key_file {
            Some(path) => load_or_generate_key(path).await?,
            None => {
                warn!(
                    target: LOG_TARGET,
                    "No cookie key file configured, sessions will not survive a restart"
                );
                Key::generate()
            }
        };

        let backend = match self.session_backend {
            SessionBackend::Combined => BackendConfig::Combined {
                max_sessions: self.max_sessions,
            },
            SessionBackend::Filesystem => BackendConfig::Filesystem {
                dir: self.session_dir.clone().context(MissingSessionDirSnafu)?,
            },
        };

        Ok(SessionConfig::builder()
            .key(key)
            .cookie(CookieSettings {
                path: self.cookie_path.clone(),
                secure: self.secure_cookies,
                max_age: time::Duration::seconds(i64::from(self.cookie_max_age_secs)),
            })
            .backend(backend)
            .maybe_prune_interval(
                (0 < self.session_prune_interval_secs)
                    .then(|| Duration::from_secs(self.session_prune_interval_secs)),
            )
            .rotation(self.refresh_token_rotation)
            .maybe_refresh_timeout(
                (0 < self.refresh_timeout_secs).then(|| Duration::from_secs(self.refresh_timeout_secs)),
            )
            .login_path(self.login_path.clone())
            .build())
    }
}

async fn load_or_generate_key(path: &Path) -> ConfigResult<Key> {
    match fs::read(path).await {
        Ok(bytes) => {
            if bytes.len() != COOKIE_KEY_LEN {
                return InvalidKeySnafu {
                    path,
                    len: bytes.len(),
                }
                .fail();
            }
            Ok(Key::from(&bytes))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let key = Key::generate();
            write_key(path, &key).await?;
            info!(target: LOG_TARGET, path = %path.display(), "Generated new cookie key");
            Ok(key)
        }
        Err(err) => Err(err).context(KeyReadSnafu { path }),
    }
}

async fn write_key(path: &Path, key: &Key) -> ConfigResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .context(KeyWriteSnafu { path })?;
    }
    fs::write(path, key.master())
        .await
        .context(KeyWriteSnafu { path })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context(KeyWriteSnafu { path })?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Combined { max_sessions: usize },
    Filesystem { dir: PathBuf },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Combined {
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Runtime configuration of [`crate::SessionService`].
#[derive(Clone, bon::Builder)]
pub struct SessionConfig {
    pub key: Key,
    #[builder(default)]
    pub cookie: CookieSettings,
    #[builder(default)]
    pub backend: BackendConfig,
    /// `None` disables periodic pruning.
    pub prune_interval: Option<Duration>,
    #[builder(default)]
    pub rotation: RefreshTokenRotation,
    pub refresh_timeout: Option<Duration>,
    #[builder(into, default = DEFAULT_LOGIN_PATH.to_owned())]
    pub login_path: String,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("key", &"<redacted>")
            .field("cookie", &self.cookie)
            .field("backend", &self.backend)
            .field("prune_interval", &self.prune_interval)
            .field("rotation", &self.rotation)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("login_path", &self.login_path)
            .finish()
    }
}
