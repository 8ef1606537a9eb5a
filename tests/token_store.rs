// tests/token_store.rs

//! Token store invariants under concurrency.

mod common;

use common::setup_store;
use foundry::{Error, TokenStore};

#[tokio::test]
async fn concurrent_rotations_have_exactly_one_winner() {
    let (db, _bus) = setup_store();
    let store = TokenStore::new(db, chrono::Duration::minutes(5));

    let issued = store.issue("aa:bb:cc:dd:ee:ff").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let old_value = issued.value.clone();
        handles.push(tokio::spawn(async move {
            store.rotate("aa:bb:cc:dd:ee:ff", &old_value).await
        }));
    }

    let mut successes = 0;
    let mut invalid = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(replacement) => {
                assert_ne!(replacement.value, issued.value);
                successes += 1;
            }
            Err(Error::Unauthorized(_)) => invalid += 1,
            Err(other) => panic!("unexpected rotate error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(invalid, 7);
}

#[tokio::test]
async fn rotation_chain_always_has_one_active_token() {
    let (db, _bus) = setup_store();
    let store = TokenStore::new(db, chrono::Duration::minutes(5));

    let mut current = store.issue("aa:bb:cc:dd:ee:01").await.unwrap();
    for _ in 0..5 {
        let next = store.rotate("aa:bb:cc:dd:ee:01", &current.value).await.unwrap();
        // The consumed token no longer rotates
        assert!(store
            .rotate("aa:bb:cc:dd:ee:01", &current.value)
            .await
            .is_err());
        current = next;
    }

    let active = store.active("aa:bb:cc:dd:ee:01").await.unwrap().unwrap();
    assert_eq!(active.value, current.value);
}

#[tokio::test]
async fn tokens_are_scoped_to_their_mac() {
    let (db, _bus) = setup_store();
    let store = TokenStore::new(db, chrono::Duration::minutes(5));

    let token = store.issue("aa:bb:cc:dd:ee:02").await.unwrap();

    // Rotating with the right value but the wrong MAC is invalid
    let err = store
        .rotate("aa:bb:cc:dd:ee:03", &token.value)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    // And the original still works for its own MAC
    store
        .rotate("aa:bb:cc:dd:ee:02", &token.value)
        .await
        .unwrap();
}
