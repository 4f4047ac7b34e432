//! Shared CAS contract checks run against every backend in unit tests.

use serde_json::json;

use crate::error::KvError;
use crate::store::KvStore;

/// Run the full get/set/cas/delete contract against a store.
///
/// Keys are prefixed so the suite can share a store with other tests.
pub(crate) async fn check_cas_contract(store: &dyn KvStore, prefix: &str) {
    let key = |name: &str| format!("{prefix}{name}");

    // Never-written keys are absent, not errors.
    assert!(store.get(&key("missing")).await.unwrap().is_none());

    // set then get returns the value with a token.
    store.set(&key("a"), json!("VALUE")).await.unwrap();
    let first = store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(first.value, json!("VALUE"));

    // cas with the fresh token succeeds, a stale token is rejected.
    store
        .cas(&key("a"), json!("OTHER-VALUE-ONE"), Some(first.casid))
        .await
        .unwrap();
    let err = store
        .cas(&key("a"), json!("OTHER-VALUE-TWO"), Some(first.casid))
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::CasMismatch { .. }), "got {err:?}");
    let second = store.get(&key("a")).await.unwrap().unwrap();
    assert_eq!(second.value, json!("OTHER-VALUE-ONE"));
    assert_ne!(second.casid, first.casid);

    // A blind set invalidates previously issued tokens.
    store.set(&key("a"), json!("BLIND")).await.unwrap();
    let err = store
        .cas(&key("a"), json!("LOST"), Some(second.casid))
        .await
        .unwrap_err();
    assert!(err.is_cas_mismatch());
    assert_eq!(
        store.get(&key("a")).await.unwrap().unwrap().value,
        json!("BLIND")
    );

    // cas with no token creates only when absent.
    store
        .cas(&key("fresh"), json!({"n": 1}), None)
        .await
        .unwrap();
    let err = store
        .cas(&key("fresh"), json!({"n": 2}), None)
        .await
        .unwrap_err();
    assert!(err.is_cas_mismatch());
    assert_eq!(
        store.get(&key("fresh")).await.unwrap().unwrap().value,
        json!({"n": 1})
    );

    // cas with a real token on an absent key is a mismatch.
    let err = store
        .cas(&key("ghost"), json!(1), Some(second.casid))
        .await
        .unwrap_err();
    assert!(err.is_cas_mismatch());
    assert!(store.get(&key("ghost")).await.unwrap().is_none());

    // delete then get is absent, and a null-token cas recreates the key.
    store.delete(&key("fresh")).await.unwrap();
    assert!(store.get(&key("fresh")).await.unwrap().is_none());
    store
        .cas(&key("fresh"), json!("again"), None)
        .await
        .unwrap();
    assert_eq!(
        store.get(&key("fresh")).await.unwrap().unwrap().value,
        json!("again")
    );

    // Deleting a missing key is fine.
    store.delete(&key("never-there")).await.unwrap();

    // Empty values are records, not absences.
    store.set(&key("empty"), json!("")).await.unwrap();
    let empty = store.get(&key("empty")).await.unwrap().unwrap();
    assert_eq!(empty.value, json!(""));
}
