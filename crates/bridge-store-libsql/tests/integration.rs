#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

//! Integration tests for the libSQL bridge store.
//!
//! These run against an in-memory database and exercise the pagination,
//! idempotency and singleton semantics the rest of the service relies on.

use std::time::Duration;

use bridge_store::{BridgeKind, BridgeStore, KeyType, NewBridgeAccount, NewExternalReply, NewFollow, NewKeyPair};
use bridge_store_libsql::LibSqlBridgeStore;
use tokio::time::sleep;

async fn open_store() -> LibSqlBridgeStore {
    let store = LibSqlBridgeStore::open(":memory:").await.expect("open store");
    store.setup().await.expect("setup store");
    store
}

fn make_follow(user_did: &str, i: u32) -> NewFollow {
    NewFollow {
        user_did: user_did.to_owned(),
        activity_id: format!("https://remote.example/activities/{i}"),
        actor_uri: format!("https://remote.example/users/actor-{i}"),
        actor_inbox: format!("https://remote.example/users/actor-{i}/inbox"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn migrations_and_pragmas_applied() {
    // If this doesn't panic or return errors, setup succeeded.
    let _store = open_store().await;

    // Setup must also be safe to call on an already-migrated database.
    let store = open_store().await;
    store.setup().await.expect("second setup");
}

#[tokio::test(flavor = "current_thread")]
async fn follow_create_is_idempotent_by_activity_id() {
    let store = open_store().await;

    let follow = make_follow("did:plc:alice", 1);
    store.create_follow(follow.clone()).await.unwrap();
    store.create_follow(follow).await.unwrap();

    assert_eq!(store.get_follows_count("did:plc:alice").await.unwrap(), 1);

    let page = store.get_follows("did:plc:alice", None, 10).await.unwrap();
    assert_eq!(page.follows.len(), 1);
    assert!(page.next_cursor.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn follow_delete_by_logical_key() {
    let store = open_store().await;

    store.create_follow(make_follow("did:plc:alice", 1)).await.unwrap();
    store.create_follow(make_follow("did:plc:alice", 2)).await.unwrap();

    store
        .delete_follow("did:plc:alice", "https://remote.example/users/actor-1")
        .await
        .unwrap();

    assert_eq!(store.get_follows_count("did:plc:alice").await.unwrap(), 1);

    // Deleting an unknown follow is a no-op.
    store
        .delete_follow("did:plc:alice", "https://remote.example/users/actor-1")
        .await
        .unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn follow_pagination_walks_newest_first() {
    let store = open_store().await;

    for i in 0..5 {
        store.create_follow(make_follow("did:plc:alice", i)).await.unwrap();
        // Distinct created_at timestamps so the cursor can discriminate rows.
        sleep(Duration::from_millis(5)).await;
    }

    let first = store.get_follows("did:plc:alice", None, 2).await.unwrap();
    assert_eq!(first.follows.len(), 2);
    assert_eq!(first.follows[0].actor_uri, "https://remote.example/users/actor-4");
    assert_eq!(first.follows[1].actor_uri, "https://remote.example/users/actor-3");
    let cursor = first.next_cursor.expect("more pages");

    let second = store.get_follows("did:plc:alice", Some(cursor), 2).await.unwrap();
    assert_eq!(second.follows.len(), 2);
    assert_eq!(second.follows[0].actor_uri, "https://remote.example/users/actor-2");
    let cursor = second.next_cursor.expect("more pages");

    let last = store.get_follows("did:plc:alice", Some(cursor), 2).await.unwrap();
    assert_eq!(last.follows.len(), 1);
    assert!(last.next_cursor.is_none());

    // Another user's follows are invisible.
    let other = store.get_follows("did:plc:bob", None, 10).await.unwrap();
    assert!(other.follows.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn key_pair_race_returns_winner() {
    let store = open_store().await;

    let winner = store
        .create_key_pair(NewKeyPair {
            user_did: "did:plc:alice".to_owned(),
            key_type: KeyType::Rsa,
            public_jwk: "{\"kty\":\"RSA\",\"n\":\"first\"}".to_owned(),
            private_jwk: "{\"kty\":\"RSA\",\"d\":\"first\"}".to_owned(),
        })
        .await
        .unwrap();

    // A losing writer gets the winner's row back, not its own.
    let loser = store
        .create_key_pair(NewKeyPair {
            user_did: "did:plc:alice".to_owned(),
            key_type: KeyType::Rsa,
            public_jwk: "{\"kty\":\"RSA\",\"n\":\"second\"}".to_owned(),
            private_jwk: "{\"kty\":\"RSA\",\"d\":\"second\"}".to_owned(),
        })
        .await
        .unwrap();

    assert_eq!(loser.public_jwk, winner.public_jwk);

    let pairs = store.get_key_pairs("did:plc:alice").await.unwrap();
    assert_eq!(pairs.len(), 1);

    assert!(
        store
            .get_key_pair("did:plc:alice", KeyType::Ed25519)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "current_thread")]
async fn bridge_account_singleton_per_kind() {
    let store = open_store().await;

    assert!(store.get_bridge_account(BridgeKind::Mastodon).await.unwrap().is_none());

    store
        .create_bridge_account(NewBridgeAccount {
            kind: BridgeKind::Mastodon,
            did: "did:plc:bridge".to_owned(),
            handle: "bridge.pds.example".to_owned(),
            password: "hunter2".to_owned(),
            access_jwt: "access-1".to_owned(),
            refresh_jwt: "refresh-1".to_owned(),
        })
        .await
        .unwrap();

    store
        .update_bridge_tokens(BridgeKind::Mastodon, "access-2", "refresh-2")
        .await
        .unwrap();

    let account = store
        .get_bridge_account(BridgeKind::Mastodon)
        .await
        .unwrap()
        .expect("account exists");
    assert_eq!(account.access_jwt, "access-2");
    assert_eq!(account.refresh_jwt, "refresh-2");
    assert_eq!(account.did, "did:plc:bridge");

    // The other kind is unaffected.
    assert!(store.get_bridge_account(BridgeKind::Bluesky).await.unwrap().is_none());

    store.delete_bridge_account(BridgeKind::Mastodon).await.unwrap();
    assert!(store.get_bridge_account(BridgeKind::Mastodon).await.unwrap().is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn post_mapping_lookup_by_either_key() {
    let store = open_store().await;

    let at_uri = "at://did:plc:alice/app.bsky.feed.post/abc";
    let ap_note_id = "https://m.example/users/a/statuses/1";

    store.create_post_mapping(at_uri, ap_note_id).await.unwrap();
    store.create_post_mapping(at_uri, ap_note_id).await.unwrap();

    let by_at = store.get_post_mapping_by_at_uri(at_uri).await.unwrap().expect("mapping");
    assert_eq!(by_at.ap_note_id, ap_note_id);

    let by_ap = store
        .get_post_mapping_by_ap_note_id(ap_note_id)
        .await
        .unwrap()
        .expect("mapping");
    assert_eq!(by_ap.at_uri, at_uri);

    assert!(
        store
            .get_post_mapping_by_at_uri("at://did:plc:alice/app.bsky.feed.post/nope")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "current_thread")]
async fn monitored_posts_batch_orders_never_checked_first() {
    let store = open_store().await;

    store
        .create_monitored_post("at://did:plc:alice/app.bsky.feed.post/a", "did:plc:alice")
        .await
        .unwrap();
    store
        .create_monitored_post("at://did:plc:alice/app.bsky.feed.post/b", "did:plc:alice")
        .await
        .unwrap();
    store
        .create_monitored_post("at://did:plc:bob/app.bsky.feed.post/c", "did:plc:bob")
        .await
        .unwrap();

    store
        .update_monitored_post_last_checked("at://did:plc:alice/app.bsky.feed.post/a")
        .await
        .unwrap();

    let batch = store.get_monitored_posts_batch(2).await.unwrap();
    assert_eq!(batch.len(), 2);
    // Never-checked rows come first; the just-checked post must be last in line.
    assert!(batch.iter().all(|post| post.last_checked.is_none()));

    let all = store.get_monitored_posts_batch(10).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].at_uri, "at://did:plc:alice/app.bsky.feed.post/a");
    assert!(all[2].last_checked.is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn external_reply_is_idempotent() {
    let store = open_store().await;

    let reply = NewExternalReply {
        at_uri: "at://did:plc:ext/app.bsky.feed.post/z".to_owned(),
        parent_at_uri: "at://did:plc:alice/app.bsky.feed.post/abc".to_owned(),
        author_did: "did:plc:ext".to_owned(),
        ap_note_id: "https://bridge.example/posts/xyz".to_owned(),
    };

    store.create_external_reply(reply.clone()).await.unwrap();
    store.create_external_reply(reply).await.unwrap();

    let stored = store
        .get_external_reply("at://did:plc:ext/app.bsky.feed.post/z")
        .await
        .unwrap()
        .expect("reply exists");
    assert_eq!(stored.parent_at_uri, "at://did:plc:alice/app.bsky.feed.post/abc");
    assert_eq!(stored.author_did, "did:plc:ext");
}
