use std::sync::Arc;

use tower_cookies::Cookies;
use tracing::info;

use crate::combined::CombinedSessionStore;
use crate::config::{BackendConfig, SessionConfig};
use crate::error::SessionResult;
use crate::filesystem::FilesystemSessionStore;
use crate::index::SessionIndex;
use crate::login_state::LoginState;
use crate::pruner::SessionPruner;
use crate::refresh::RefreshCoordinator;
use crate::store::SessionStore;
use crate::token::{IdTokenVerifier, TokenResponse, TokenSource};

const LOG_TARGET: &str = "console::session::service";

/// The configured session backend together with its refresh coordinator.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    login_path: Arc<str>,
}

impl SessionService {
    /// Build the backend selected by `config` and start its pruner.
    ///
    /// Must be called within a tokio runtime.
    pub async fn init(
        config: SessionConfig,
        verifier: Arc<dyn IdTokenVerifier>,
        token_source: Arc<dyn TokenSource>,
    ) -> SessionResult<Self> {
        let store: Arc<dyn SessionStore> = match &config.backend {
            BackendConfig::Combined { max_sessions } => {
                info!(target: LOG_TARGET, max_sessions, "Using in-memory session store");
                Arc::new(CombinedSessionStore::new(
                    Arc::new(SessionIndex::new(*max_sessions)),
                    config.key.clone(),
                    config.cookie.clone(),
                ))
            }
            BackendConfig::Filesystem { dir } => {
                info!(target: LOG_TARGET, dir = %dir.display(), "Using filesystem session store");
                Arc::new(
                    FilesystemSessionStore::new(dir, config.key.clone(), config.cookie.clone())
                        .await?,
                )
            }
        };

        if let Some(interval) = config.prune_interval {
            tokio::spawn(SessionPruner::new(Arc::downgrade(&store), interval).run());
        }

        let coordinator = RefreshCoordinator::builder()
            .store(store.clone())
            .verifier(verifier)
            .token_source(token_source)
            .rotation(config.rotation)
            .maybe_refresh_timeout(config.refresh_timeout)
            .build();

        Ok(Self {
            store,
            coordinator: Arc::new(coordinator),
            login_path: config.login_path.into(),
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn login_path(&self) -> &Arc<str> {
        &self.login_path
    }

    /// Start a session for a completed login.
    pub async fn login(&self, cookies: &Cookies, token: &TokenResponse) -> SessionResult<LoginState> {
        self.store
            .add_session(cookies, self.coordinator.verifier().as_ref(), token)
            .await
    }

    pub async fn logout(&self, cookies: &Cookies) -> SessionResult<()> {
        self.store.delete_session(cookies).await
    }
}
