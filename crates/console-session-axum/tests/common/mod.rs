#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRef, Query, State};
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use console_session::config::RefreshTokenRotation;
use console_session::error::BoxedErrorResult;
use console_session::{
    CombinedSessionStore, CookieSettings, FilesystemSessionStore, IdTokenClaims, IdTokenVerifier,
    Key, LoginState, RefreshCoordinator, SessionIndex, SessionStore, TokenResponse, TokenSource,
};
use console_session_axum::{AuthState, AuthenticatedSession, auth_router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tower::ServiceExt as _;
use tower_cookies::{CookieManagerLayer, Cookies};

/// Treats the raw ID token as the JSON encoding of its claims.
pub struct FakeVerifier;

#[async_trait]
impl IdTokenVerifier for FakeVerifier {
    async fn verify(&self, raw_id_token: &str) -> BoxedErrorResult<IdTokenClaims> {
        Ok(serde_json::from_str(raw_id_token)?)
    }
}

pub fn id_token(sub: &str, ttl_secs: i64) -> String {
    serde_json::to_string(&IdTokenClaims {
        sub: Some(sub.to_owned()),
        exp: Some(OffsetDateTime::now_utc().unix_timestamp() + ttl_secs),
        email: Some(format!("{sub}@example.com")),
        name: Some(sub.to_owned()),
    })
    .unwrap()
}

#[derive(Default)]
struct IssuerState {
    /// Refresh token -> subject, for every refresh token still accepted.
    live: HashMap<String, String>,
    subject_override: Option<String>,
    failing: bool,
}

/// An identity provider honoring the configured rotation policy.
pub struct FakeTokenSource {
    rotation: RefreshTokenRotation,
    delay: Duration,
    calls: AtomicUsize,
    next_id: AtomicU64,
    state: Mutex<IssuerState>,
}

impl FakeTokenSource {
    pub fn new(rotation: RefreshTokenRotation) -> Self {
        Self {
            rotation,
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            state: Mutex::new(IssuerState::default()),
        }
    }

    /// Tokens for a login of `sub`; the ID token expires in `ttl_secs`.
    pub fn issue(&self, sub: &str, ttl_secs: i64, with_refresh_token: bool) -> TokenResponse {
        let refresh_token = with_refresh_token.then(|| {
            let token = format!(
                "refresh-{}",
                self.next_id.fetch_add(1, Ordering::SeqCst)
            );
            self.state
                .lock()
                .unwrap()
                .live
                .insert(token.clone(), sub.to_owned());
            token
        });
        TokenResponse {
            access_token: format!("access-{sub}"),
            id_token: Some(id_token(sub, ttl_secs)),
            refresh_token,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Make refreshes authenticate `sub`, whoever the refresh token belongs to.
    pub fn impersonate(&self, sub: &str) {
        self.state.lock().unwrap().subject_override = Some(sub.to_owned());
    }
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    async fn refresh(&self, refresh_token: &str) -> BoxedErrorResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let sub = {
            let mut state = self.state.lock().unwrap();
            if state.failing {
                return Err("identity provider unavailable".into());
            }
            let sub = match self.rotation {
                RefreshTokenRotation::Rotating => state.live.remove(refresh_token),
                RefreshTokenRotation::Stable => state.live.get(refresh_token).cloned(),
            }
            .ok_or("invalid_grant")?;
            state.subject_override.clone().unwrap_or(sub)
        };

        Ok(match self.rotation {
            RefreshTokenRotation::Rotating => self.issue(&sub, 3600, true),
            RefreshTokenRotation::Stable => TokenResponse {
                refresh_token: Some(refresh_token.to_owned()),
                ..self.issue(&sub, 3600, false)
            },
        })
    }
}

/// What the test routes report about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReply {
    pub session_token: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl From<&LoginState> for SessionReply {
    fn from(session: &LoginState) -> Self {
        Self {
            session_token: session.session_token().to_owned(),
            user_id: session.user_id().to_owned(),
            access_token: session.access_token().to_owned(),
            refresh_token: session.refresh_token().map(ToOwned::to_owned),
        }
    }
}

#[derive(Clone, FromRef)]
struct AppState {
    auth: AuthState,
    tokens: Arc<FakeTokenSource>,
}

#[derive(Deserialize)]
struct LoginQuery {
    sub: String,
    ttl: i64,
    #[serde(default = "yes")]
    refresh: bool,
}

fn yes() -> bool {
    true
}

async fn login(
    State(auth): State<AuthState>,
    State(tokens): State<Arc<FakeTokenSource>>,
    cookies: Cookies,
    Query(query): Query<LoginQuery>,
) -> Result<Json<SessionReply>, (StatusCode, String)> {
    let token = tokens.issue(&query.sub, query.ttl, query.refresh);
    let coordinator = auth.coordinator();
    let session = coordinator
        .store()
        .add_session(&cookies, coordinator.verifier().as_ref(), &token)
        .await
        .map_err(|err| (StatusCode::UNAUTHORIZED, err.to_string()))?;
    Ok(Json(SessionReply::from(&session)))
}

async fn protected(AuthenticatedSession(session): AuthenticatedSession) -> Json<SessionReply> {
    Json(SessionReply::from(&session))
}

pub struct TestApp {
    pub router: Router,
    pub coordinator: Arc<RefreshCoordinator>,
    pub tokens: Arc<FakeTokenSource>,
    /// Set for the combined backend.
    pub index: Option<Arc<SessionIndex>>,
}

impl TestApp {
    pub fn combined(key: Key, rotation: RefreshTokenRotation) -> Self {
        Self::combined_with_index(key, rotation, Arc::new(SessionIndex::default()))
    }

    pub fn combined_with_index(
        key: Key,
        rotation: RefreshTokenRotation,
        index: Arc<SessionIndex>,
    ) -> Self {
        let store = CombinedSessionStore::new(index.clone(), key, CookieSettings::default());
        let mut app = Self::build(Arc::new(store), rotation);
        app.index = Some(index);
        app
    }

    pub async fn filesystem(dir: &Path, key: Key, rotation: RefreshTokenRotation) -> Self {
        let store = FilesystemSessionStore::new(dir, key, CookieSettings::default())
            .await
            .unwrap();
        Self::build(Arc::new(store), rotation)
    }

    fn build(store: Arc<dyn SessionStore>, rotation: RefreshTokenRotation) -> Self {
        let tokens = Arc::new(FakeTokenSource::new(rotation));
        let coordinator = Arc::new(
            RefreshCoordinator::builder()
                .store(store)
                .verifier(Arc::new(FakeVerifier))
                .token_source(tokens.clone())
                .rotation(rotation)
                .refresh_timeout(Duration::from_secs(5))
                .build(),
        );
        let state = AppState {
            auth: AuthState::new(coordinator.clone(), "/auth/login"),
            tokens: tokens.clone(),
        };
        let router = Router::new()
            .route("/test/login", post(login))
            .route("/protected", get(protected))
            .merge(auth_router())
            .layer(CookieManagerLayer::new())
            .with_state(state);

        Self {
            router,
            coordinator,
            tokens,
            index: None,
        }
    }
}

/// Minimal cookie jar following `Set-Cookie` headers.
#[derive(Debug, Clone, Default)]
pub struct TestBrowser {
    /// Cookie name -> encoded `name=value` pair, as received.
    cookies: BTreeMap<String, String>,
    last_set_cookies: Vec<String>,
}

impl TestBrowser {
    pub fn request(&self, method: Method, uri: &str) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if !self.cookies.is_empty() {
            let header = self
                .cookies
                .values()
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(COOKIE, header);
        }
        builder.body(Body::empty()).unwrap()
    }

    pub fn absorb(&mut self, res: &Response) {
        self.last_set_cookies.clear();
        for header in res.headers().get_all(SET_COOKIE) {
            let header = header.to_str().unwrap().to_owned();
            let mut parts = header.split(';').map(str::trim);
            let pair = parts.next().unwrap_or_default();
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let removed = value.is_empty()
                || parts.any(|attr| attr.eq_ignore_ascii_case("max-age=0"));
            if removed {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_owned(), pair.to_owned());
            }
            self.last_set_cookies.push(header);
        }
    }

    pub async fn send(&mut self, router: &Router, method: Method, uri: &str) -> Response {
        let res = router.clone().oneshot(self.request(method, uri)).await.unwrap();
        self.absorb(&res);
        res
    }

    pub async fn login(&mut self, app: &TestApp, sub: &str, ttl_secs: i64) -> SessionReply {
        let res = self
            .send(
                &app.router,
                Method::POST,
                &format!("/test/login?sub={sub}&ttl={ttl_secs}"),
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        json(res).await
    }

    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies.contains_key(name)
    }

    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        self.cookies
            .get(name)
            .and_then(|pair| pair.split_once('='))
            .map(|(_, value)| value)
    }

    pub fn set_cookie_value(&mut self, name: &str, value: &str) {
        self.cookies
            .insert(name.to_owned(), format!("{name}={value}"));
    }

    pub fn remove_cookie(&mut self, name: &str) {
        self.cookies.remove(name);
    }

    /// Raw `Set-Cookie` headers of the last response.
    pub fn last_set_cookies(&self) -> &[String] {
        &self.last_set_cookies
    }
}

pub async fn json<T: DeserializeOwned>(res: Response) -> T {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn location(res: &Response) -> &str {
    res.headers()[LOCATION].to_str().unwrap()
}
