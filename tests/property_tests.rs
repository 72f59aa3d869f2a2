//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use std::cmp::Ordering;
use trtl_replica::cursor::PageCursor;
use trtl_replica::object::{Identity, Object, UpdateType, VersionVector};
use trtl_replica::probability::time_probability;
use trtl_replica::store::{MemoryStore, ObjectStore};

fn vv(pid: u64, counter: u64) -> VersionVector {
    VersionVector {
        pid,
        counter,
        region: "us-east-1".to_string(),
        parent: None,
    }
}

fn object(key: Vec<u8>, value: Vec<u8>, pid: u64, counter: u64) -> Object {
    Object {
        namespace: "v".to_string(),
        key,
        value,
        version: vv(pid, counter),
        tombstone: false,
        owner: format!("trtl-{}", pid),
        region: "us-east-1".to_string(),
        modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

// =============================================================================
// Version Ordering Properties
// =============================================================================

proptest! {
    /// Same process: the larger counter wins regardless of argument order.
    #[test]
    fn version_counter_monotonic(pid in 1u64..1000, c1 in 0u64..10_000, c2 in 0u64..10_000) {
        prop_assume!(c1 != c2);
        let (lo, hi) = if c1 < c2 { (vv(pid, c1), vv(pid, c2)) } else { (vv(pid, c2), vv(pid, c1)) };

        prop_assert!(hi.is_later(&lo));
        prop_assert!(!lo.is_later(&hi));
        prop_assert_eq!(UpdateType::resolve(Some(&lo), &hi), UpdateType::Stomp);
        prop_assert_eq!(UpdateType::resolve(Some(&hi), &lo), UpdateType::Skip);
    }

    /// Precedence is a total order: antisymmetric and equal only for the same write.
    #[test]
    fn version_precedence_antisymmetric(
        p1 in 1u64..50, c1 in 0u64..50,
        p2 in 1u64..50, c2 in 0u64..50,
    ) {
        let a = vv(p1, c1);
        let b = vv(p2, c2);
        prop_assert_eq!(a.precedence(&b), b.precedence(&a).reverse());
        prop_assert_eq!(a.precedence(&b) == Ordering::Equal, p1 == p2 && c1 == c2);
    }

    /// Exactly one side of a cross-process conflict wins.
    #[test]
    fn version_conflict_has_single_winner(
        p1 in 1u64..50, p2 in 1u64..50, counter in 1u64..100,
    ) {
        prop_assume!(p1 != p2);
        let a = vv(p1, counter);
        let b = vv(p2, counter);
        prop_assert!(a.is_later(&b) ^ b.is_later(&a));
        prop_assert_eq!(a.is_later(&b), p1 > p2);
    }

    /// A version produced by `next` is always a later child of its source.
    #[test]
    fn version_next_is_later_child(pid in 1u64..1000, other in 1u64..1000, counter in 0u64..10_000) {
        let base = vv(pid, counter);
        let next = base.next(other, "eu-west-1");
        prop_assert!(next.is_later(&base));
        prop_assert!(next.is_child_of(&base));
        prop_assert_eq!(UpdateType::resolve(Some(&base), &next), UpdateType::Forward);
    }
}

// =============================================================================
// Apply Idempotence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Applying the same repair twice changes nothing after the first time.
    #[test]
    fn repair_is_idempotent(
        key in proptest::collection::vec(any::<u8>(), 1..16),
        value in proptest::collection::vec(any::<u8>(), 0..64),
        pid in 1u64..100,
        counter in 1u64..100,
        local_counter in proptest::option::of(1u64..100),
    ) {
        let (first, second, before, after) = block_on(async {
            let store = MemoryStore::new(Identity::new(999, "us-east-1", "trtl-999"));
            if let Some(c) = local_counter {
                store.insert(object(key.clone(), b"local".to_vec(), 500, c)).await;
            }

            let incoming = object(key.clone(), value.clone(), pid, counter);
            let first = store.update(incoming.clone()).await.unwrap();
            let before = store.object("v", &key).await.unwrap();
            let second = store.update(incoming).await.unwrap();
            let after = store.object("v", &key).await.unwrap();
            (first, second, before, after)
        });

        prop_assert_eq!(before, after);
        prop_assert!(!second.applied());
        if first.applied() {
            prop_assert_eq!(second, UpdateType::NoChange);
        }
    }
}

// =============================================================================
// Page Cursor Properties
// =============================================================================

proptest! {
    /// Load(Dump(cursor)) == cursor, including empty keys and namespaces.
    #[test]
    fn cursor_round_trip(
        page_size in any::<i32>(),
        next_key in proptest::collection::vec(any::<u8>(), 0..128),
        namespace in ".{0,32}",
    ) {
        let cursor = PageCursor::new(page_size, next_key, namespace);
        let token = cursor.dump().unwrap();
        prop_assert_eq!(PageCursor::load(&token).unwrap(), cursor);
    }

    /// Tokens only use the URL-safe alphabet.
    #[test]
    fn cursor_token_url_safe(
        page_size in 1i32..1000,
        next_key in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let token = PageCursor::new(page_size, next_key, "vasps").dump().unwrap();
        prop_assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    /// Garbage never panics the decoder.
    #[test]
    fn cursor_load_never_panics(token in ".{0,64}") {
        let _ = PageCursor::load(&token);
    }
}

// =============================================================================
// Replication Probability Properties
// =============================================================================

proptest! {
    /// Older objects are never more likely to be replicated.
    #[test]
    fn probability_monotonic_decay(a in 0i64..10_000_000, b in 0i64..10_000_000) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let (newer, older) = if a <= b { (a, b) } else { (b, a) };

        let p_newer = time_probability(now - ChronoDuration::seconds(newer), now);
        let p_older = time_probability(now - ChronoDuration::seconds(older), now);
        prop_assert!(p_older <= p_newer);
        prop_assert!((0.0..=1.0).contains(&p_older));
    }

    /// Something modified just now is almost certainly replicated.
    #[test]
    fn probability_now_near_one(millis in 0i64..1000) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let p = time_probability(now - ChronoDuration::milliseconds(millis), now);
        prop_assert!((0.99..=1.0).contains(&p));
    }
}
