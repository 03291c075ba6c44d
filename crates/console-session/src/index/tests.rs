use time::{Duration, OffsetDateTime};

use super::*;
use crate::test_util::verified;

fn session(sub: &str, expires_at: OffsetDateTime, refresh_token: Option<&str>) -> LoginState {
    LoginState::from_verified(&verified(sub, expires_at, refresh_token))
}

#[test]
fn add_get_delete() {
    let index = SessionIndex::new(10);
    let now = OffsetDateTime::now_utc();
    let state = session("user-id", now + Duration::hours(1), Some("r1"));

    index.add_session(state.clone()).unwrap();
    index.assert_consistent();

    assert_eq!(index.get_session(Some(state.session_token()), None), Some(state.clone()));
    assert_eq!(index.get_session(None, Some("r1")), Some(state.clone()));
    assert_eq!(index.get_session(Some("unknown"), Some("r1")), Some(state.clone()));
    assert_eq!(index.get_session(Some("unknown"), Some("r2")), None);

    assert_eq!(index.delete_by_session_token(state.session_token()), Some(state));
    index.assert_consistent();
    assert!(index.is_empty());
    assert_eq!(index.refresh_key_count(), 0);
}

#[test]
fn duplicate_session_token_is_an_invariant_error() {
    let index = SessionIndex::new(10);
    let state = session("user-id", OffsetDateTime::now_utc() + Duration::hours(1), None);

    index.add_session(state.clone()).unwrap();
    let err = index.add_session(state).expect_err("collision");

    assert!(matches!(err, SessionError::Invariant { .. }));
    assert_eq!(index.len(), 1);
    index.assert_consistent();
}

#[test]
fn deleting_missing_sessions_is_a_noop() {
    let index = SessionIndex::new(10);
    let state = session("user-id", OffsetDateTime::now_utc() + Duration::hours(1), Some("r1"));
    index.add_session(state.clone()).unwrap();

    assert_eq!(index.delete_by_session_token("nope"), None);
    assert_eq!(index.delete_by_refresh_token("nope"), None);
    assert_eq!(index.delete_session(Some("nope"), Some("also-nope")), None);
    assert_eq!(index.delete_session(None, None), None);

    assert_eq!(index.len(), 1);
    index.assert_consistent();
}

#[test]
fn delete_by_refresh_token_scrubs_all_indexes() {
    let index = SessionIndex::new(10);
    let state = session("user-id", OffsetDateTime::now_utc() + Duration::hours(1), Some("r1"));
    index.add_session(state.clone()).unwrap();

    assert_eq!(index.delete_by_refresh_token("r1"), Some(state.clone()));
    assert_eq!(index.get_session(Some(state.session_token()), Some("r1")), None);
    index.assert_consistent();
}

#[test]
fn prune_removes_expired_and_trims_to_capacity() {
    let index = SessionIndex::new(3);
    let now = OffsetDateTime::now_utc();

    let expired = session("expired", now - Duration::hours(1), Some("r0"));
    index.add_session(expired.clone()).unwrap();
    for i in 0..3 {
        index
            .add_session(session(&format!("user-{i}"), now + Duration::hours(1), None))
            .unwrap();
    }

    assert_eq!(index.prune_sessions_at(now), 1);
    assert_eq!(index.len(), 3);
    assert_eq!(index.get_session(Some(expired.session_token()), Some("r0")), None);
    index.assert_consistent();
}

#[test]
fn capacity_eviction_drops_soonest_expiry_first() {
    let index = SessionIndex::new(2);
    let now = OffsetDateTime::now_utc();

    let soon = session("soon", now + Duration::minutes(5), None);
    let later = session("later", now + Duration::hours(1), None);
    let latest = session("latest", now + Duration::hours(2), None);
    index.add_session(later.clone()).unwrap();
    index.add_session(soon.clone()).unwrap();
    index.add_session(latest.clone()).unwrap();

    assert_eq!(index.prune_sessions_at(now), 1);
    assert!(index.get_session(Some(soon.session_token()), None).is_none());
    assert!(index.get_session(Some(later.session_token()), None).is_some());
    assert!(index.get_session(Some(latest.session_token()), None).is_some());
    index.assert_consistent();
}

#[test]
fn prune_resorts_after_refresh_moved_an_expiry() {
    let index = SessionIndex::new(10);
    let now = OffsetDateTime::now_utc();

    let refreshed = session("refreshed", now + Duration::minutes(1), Some("r1"));
    let stable = session("stable", now + Duration::hours(1), None);
    index.add_session(stable.clone()).unwrap();
    index.add_session(refreshed.clone()).unwrap();

    index
        .update_tokens(
            refreshed.session_token(),
            &verified("refreshed", now + Duration::hours(3), Some("r2")),
        )
        .unwrap()
        .expect("still indexed");

    // The age list still has "refreshed" behind "stable"; only a re-sort
    // keeps it alive past the original expiry of "stable".
    assert_eq!(index.prune_sessions_at(now + Duration::hours(2)), 1);
    assert!(index.get_session(Some(refreshed.session_token()), None).is_some());
    assert!(index.get_session(Some(stable.session_token()), None).is_none());
    index.assert_consistent();
}

#[test]
fn refresh_keeps_previous_refresh_token_resolvable() {
    let index = SessionIndex::new(10);
    let now = OffsetDateTime::now_utc();
    let state = session("user-id", now + Duration::minutes(1), Some("r1"));
    index.add_session(state.clone()).unwrap();

    let updated = index
        .update_tokens(
            state.session_token(),
            &verified("user-id", now + Duration::hours(1), Some("r2")),
        )
        .unwrap()
        .expect("indexed");
    assert_eq!(updated.session_token(), state.session_token());
    assert_eq!(updated.refresh_token(), Some("r2"));

    assert_eq!(index.get_session(None, Some("r1")), Some(updated.clone()));
    assert_eq!(index.get_session(None, Some("r2")), Some(updated.clone()));

    // A second rotation forgets the oldest token.
    index
        .update_tokens(
            state.session_token(),
            &verified("user-id", now + Duration::hours(2), Some("r3")),
        )
        .unwrap()
        .expect("indexed");
    assert_eq!(index.get_session(None, Some("r1")), None);
    assert!(index.get_session(None, Some("r2")).is_some());
    assert!(index.get_session(None, Some("r3")).is_some());
    assert_eq!(index.refresh_key_count(), 2);
    index.assert_consistent();
}

#[test]
fn replacement_session_is_reachable_by_spent_refresh_token() {
    let index = SessionIndex::new(10);
    let now = OffsetDateTime::now_utc();
    let state = session("user-id", now + Duration::hours(1), Some("r2"));

    index
        .add_session_with_previous(state.clone(), Some("r1"))
        .unwrap();

    assert_eq!(index.get_session(Some("pruned"), Some("r1")), Some(state.clone()));
    assert_eq!(index.get_session(None, Some("r2")), Some(state.clone()));
    assert_eq!(index.refresh_key_count(), 2);

    assert_eq!(index.delete_by_refresh_token("r1"), Some(state));
    assert_eq!(index.refresh_key_count(), 0);
    index.assert_consistent();
}

#[test]
fn impersonating_update_leaves_index_untouched() {
    let index = SessionIndex::new(10);
    let now = OffsetDateTime::now_utc();
    let state = session("user-id", now + Duration::minutes(1), Some("r1"));
    index.add_session(state.clone()).unwrap();

    let err = index
        .update_tokens(
            state.session_token(),
            &verified("intruder", now + Duration::hours(1), Some("r2")),
        )
        .expect_err("identity changed");

    assert!(err.is_security());
    assert_eq!(index.get_session(Some(state.session_token()), None), Some(state));
    assert_eq!(index.get_session(None, Some("r2")), None);
    index.assert_consistent();
}

#[test]
fn update_of_vanished_session_reports_none() {
    let index = SessionIndex::new(10);
    let outcome = index
        .update_tokens(
            "gone",
            &verified("user-id", OffsetDateTime::now_utc() + Duration::hours(1), None),
        )
        .unwrap();
    assert!(outcome.is_none());
}

#[test]
fn random_operation_sequences_stay_consistent() {
    let index = SessionIndex::new(8);
    let now = OffsetDateTime::now_utc();
    let mut tokens = vec![];

    for round in 0..200i64 {
        match round % 7 {
            0..=3 => {
                let offset = Duration::minutes((round * 37) % 120 - 30);
                let refresh = format!("r{round}");
                let state = session(&format!("user-{round}"), now + offset, Some(&refresh));
                tokens.push((state.session_token().to_owned(), format!("user-{round}")));
                index.add_session(state).unwrap();
            }
            4 => {
                if let Some((token, _)) = tokens.pop() {
                    index.delete_by_session_token(&token);
                }
            }
            5 => {
                if let Some((token, user)) = tokens.first() {
                    let _ = index.update_tokens(
                        token,
                        &verified(user, now + Duration::minutes(round), Some(&format!("u{round}"))),
                    );
                }
            }
            _ => {
                index.prune_sessions_at(now);
                assert!(index.len() <= index.max_sessions());
            }
        }
        index.assert_consistent();
    }
}
