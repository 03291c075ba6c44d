//! Server-side session index.
//!
//! Sessions are owned by the `by_token` map. The refresh-token index and the
//! age list only hold session tokens, so every removal goes through one place
//! that scrubs all three. A single mutex guards the whole structure; it is
//! never held across an await point.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tracing::{debug, error, trace};

use crate::error::{InvariantSnafu, SessionError, SessionResult};
use crate::login_state::LoginState;
use crate::token::VerifiedToken;

const LOG_TARGET: &str = "console::session::index";

pub const DEFAULT_MAX_SESSIONS: usize = 32768;

fn invariant_violation(msg: impl Into<String>) -> SessionError {
    let err = InvariantSnafu { msg }.build();
    error!(target: LOG_TARGET, %err, "Session index inconsistency");
    err
}

struct IndexedSession {
    state: LoginState,
    /// Keys of `by_refresh_token` that point at this session: the current
    /// refresh token and, after a rotation, the previous one.
    refresh_keys: Vec<String>,
}

#[derive(Default)]
struct IndexInner {
    by_token: HashMap<String, IndexedSession>,
    by_refresh_token: HashMap<String, String>,
    /// Session tokens ordered by descending expiry, as of the last sort.
    by_age: Vec<String>,
}

impl IndexInner {
    fn link_refresh_key(&mut self, refresh_token: &str, session_token: &str) {
        if let Some(prev_owner) = self
            .by_refresh_token
            .insert(refresh_token.to_owned(), session_token.to_owned())
            && prev_owner != session_token
        {
            if let Some(prev) = self.by_token.get_mut(&prev_owner) {
                prev.refresh_keys.retain(|key| key != refresh_token);
            }
        }
        if let Some(entry) = self.by_token.get_mut(session_token)
            && !entry.refresh_keys.iter().any(|key| key == refresh_token)
        {
            entry.refresh_keys.push(refresh_token.to_owned());
        }
    }

    /// Drop a session from `by_token` and `by_refresh_token`. The caller is
    /// responsible for `by_age`.
    fn scrub(&mut self, session_token: &str) -> Option<LoginState> {
        let entry = self.by_token.remove(session_token)?;
        for key in &entry.refresh_keys {
            if self.by_refresh_token.get(key).map(String::as_str) == Some(session_token) {
                self.by_refresh_token.remove(key);
            }
        }
        Some(entry.state)
    }

    fn remove(&mut self, session_token: &str) -> Option<LoginState> {
        let state = self.scrub(session_token)?;
        let before = self.by_age.len();
        self.by_age.retain(|token| token != session_token);
        if before == self.by_age.len() {
            invariant_violation("indexed session was missing from the age list");
        }
        Some(state)
    }

    /// Resolve a refresh token to the session token it points at, repairing
    /// dangling entries on the way.
    fn resolve_refresh_token(&mut self, refresh_token: &str) -> Option<String> {
        let session_token = self.by_refresh_token.get(refresh_token)?.clone();
        if self.by_token.contains_key(&session_token) {
            return Some(session_token);
        }
        invariant_violation("refresh token pointed at a missing session");
        self.by_refresh_token.remove(refresh_token);
        None
    }
}

/// In-memory sessions of this replica, bounded by `max_sessions`.
pub struct SessionIndex {
    inner: Mutex<IndexInner>,
    max_sessions: usize,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionIndex {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner::default()),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexInner> {
        // Every mutation leaves the maps consistent before it can panic, so a
        // poisoned lock still guards valid data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn len(&self) -> usize {
        self.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_session(&self, state: LoginState) -> SessionResult<()> {
        self.add_session_with_previous(state, None)
    }

    /// Add a session that replaces one this index no longer holds.
    ///
    /// `previous_refresh_token` is the token spent to obtain `state`. It
    /// resolves to the new session just like the previous token of a session
    /// refreshed in place, so requests still carrying it find the new session.
    pub fn add_session_with_previous(
        &self,
        state: LoginState,
        previous_refresh_token: Option<&str>,
    ) -> SessionResult<()> {
        let mut inner = self.lock();
        let session_token = state.session_token().to_owned();
        if inner.by_token.contains_key(&session_token) {
            return Err(invariant_violation("session token collision"));
        }

        let refresh_token = state.refresh_token().map(ToOwned::to_owned);
        inner.by_token.insert(
            session_token.clone(),
            IndexedSession {
                state,
                refresh_keys: vec![],
            },
        );
        let previous = previous_refresh_token.filter(|token| !token.is_empty());
        for key in previous.into_iter().chain(refresh_token.as_deref()) {
            inner.link_refresh_key(key, &session_token);
        }
        inner.by_age.push(session_token);
        trace!(target: LOG_TARGET, sessions = inner.by_token.len(), "Session added");
        Ok(())
    }

    /// Look up by session token, falling back to the refresh token.
    ///
    /// The fallback covers a session-token cookie issued by another replica,
    /// or one whose session was pruned here, accompanied by a refresh-token
    /// cookie this replica does know.
    pub fn get_session(
        &self,
        session_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Option<LoginState> {
        let mut inner = self.lock();
        if let Some(session_token) = session_token
            && let Some(entry) = inner.by_token.get(session_token)
        {
            return Some(entry.state.clone());
        }

        let refresh_token = refresh_token.filter(|token| !token.is_empty())?;
        let session_token = inner.resolve_refresh_token(refresh_token)?;
        trace!(target: LOG_TARGET, "Session resolved by refresh token");
        inner
            .by_token
            .get(&session_token)
            .map(|entry| entry.state.clone())
    }

    /// Apply a refreshed token to an indexed session.
    ///
    /// Returns `Ok(None)` if the session is no longer indexed. On success the
    /// refresh-token index points both the previous and the new refresh token
    /// at the session, so a request still carrying the previous one finds the
    /// already refreshed session.
    pub fn update_tokens(
        &self,
        session_token: &str,
        verified: &VerifiedToken,
    ) -> SessionResult<Option<LoginState>> {
        let mut inner = self.lock();
        let Some(entry) = inner.by_token.get_mut(session_token) else {
            return Ok(None);
        };

        let previous = entry.state.refresh_token().map(ToOwned::to_owned);
        entry.state.apply_verified(verified)?;
        let current = entry.state.refresh_token().map(ToOwned::to_owned);
        let updated = entry.state.clone();

        let mut keep: Vec<String> = previous.into_iter().chain(current).collect();
        keep.dedup();
        let stale = mem::take(&mut entry.refresh_keys);
        for key in stale.iter().filter(|key| !keep.contains(key)) {
            if inner.by_refresh_token.get(key).map(String::as_str) == Some(session_token) {
                inner.by_refresh_token.remove(key);
            }
        }
        for key in &keep {
            inner.link_refresh_key(key, session_token);
        }

        Ok(Some(updated))
    }

    pub fn delete_by_session_token(&self, session_token: &str) -> Option<LoginState> {
        self.lock().remove(session_token)
    }

    pub fn delete_by_refresh_token(&self, refresh_token: &str) -> Option<LoginState> {
        let mut inner = self.lock();
        let session_token = inner.resolve_refresh_token(refresh_token)?;
        inner.remove(&session_token)
    }

    /// Delete whatever the given tokens resolve to. Missing sessions are not an
    /// error.
    pub fn delete_session(
        &self,
        session_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Option<LoginState> {
        let mut inner = self.lock();
        if let Some(session_token) = session_token
            && let Some(state) = inner.remove(session_token)
        {
            return Some(state);
        }
        let refresh_token = refresh_token.filter(|token| !token.is_empty())?;
        let session_token = inner.resolve_refresh_token(refresh_token)?;
        inner.remove(&session_token)
    }

    /// Remove expired sessions, then evict the soonest-expiring ones until at
    /// most `max_sessions` remain. Returns the number of removed sessions.
    pub fn prune_sessions(&self) -> usize {
        self.prune_sessions_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn prune_sessions_at(&self, now: OffsetDateTime) -> usize {
        let mut inner = self.lock();

        let removed: Vec<String> = {
            let IndexInner {
                by_token, by_age, ..
            } = &mut *inner;
            let expiry = |token: &String| by_token.get(token).map(|entry| entry.state.expires_at());

            // Refreshes move expiries around, so the order may have gone stale.
            if !by_age.is_sorted_by_key(|token| Reverse(expiry(token))) {
                by_age.sort_by_key(|token| Reverse(expiry(token)));
            }

            let live = by_age.partition_point(|token| expiry(token).is_some_and(|exp| now <= exp));
            let keep = live.min(self.max_sessions);
            by_age.drain(keep..).collect()
        };

        for session_token in &removed {
            if inner.scrub(session_token).is_none() {
                invariant_violation("age list referenced a missing session");
            }
        }

        if !removed.is_empty() {
            debug!(
                target: LOG_TARGET,
                removed = removed.len(),
                remaining = inner.by_token.len(),
                "Pruned sessions"
            );
        }
        removed.len()
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let inner = self.lock();
        assert_eq!(inner.by_age.len(), inner.by_token.len());
        let mut seen = std::collections::HashSet::new();
        for token in &inner.by_age {
            assert!(inner.by_token.contains_key(token), "age list entry not indexed");
            assert!(seen.insert(token), "age list entry duplicated");
        }
        for (key, session_token) in &inner.by_refresh_token {
            let entry = inner
                .by_token
                .get(session_token)
                .expect("refresh key points at indexed session");
            assert!(entry.refresh_keys.contains(key));
        }
        for (session_token, entry) in &inner.by_token {
            for key in &entry.refresh_keys {
                assert_eq!(inner.by_refresh_token.get(key), Some(session_token));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn refresh_key_count(&self) -> usize {
        self.lock().by_refresh_token.len()
    }
}

#[cfg(test)]
mod tests;
