use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

/// Key pair flavor attached to a bridged actor.
///
/// `Rsa` keys (RSASSA-PKCS1-v1_5) sign outbound HTTP requests; `Ed25519` keys
/// back the actor's assertion methods. Both must exist before any outbound
/// delivery for a given user.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyType {
    Rsa,
    Ed25519,
}

impl KeyType {
    pub const ALL: [KeyType; 2] = [KeyType::Rsa, KeyType::Ed25519];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Ed25519 => "ed25519",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rsa" => Some(KeyType::Rsa),
            "ed25519" => Some(KeyType::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which dedicated PDS repository a bridge account row belongs to.
///
/// There is at most one account per kind; the kind mirrors the configuration
/// section that provisions it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BridgeKind {
    Mastodon,
    Bluesky,
}

impl BridgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeKind::Mastodon => "mastodon",
            BridgeKind::Bluesky => "bluesky",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mastodon" => Some(BridgeKind::Mastodon),
            "bluesky" => Some(BridgeKind::Bluesky),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted follow relationship from a remote ActivityPub actor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Follow {
    /// DID of the local account being followed.
    pub user_did: String,
    /// Id of the Follow activity that established the relationship.
    pub activity_id: String,
    /// Remote actor URI.
    pub actor_uri: String,
    /// Remote actor inbox; always an absolute URL.
    pub actor_inbox: String,
    pub created_at: OffsetDateTime,
}

/// Follow data as received from the inbox, before the store stamps it.
#[derive(Clone, Debug)]
pub struct NewFollow {
    pub user_did: String,
    pub activity_id: String,
    pub actor_uri: String,
    pub actor_inbox: String,
}

/// One page of follows, newest first.
#[derive(Clone, Debug, Default)]
pub struct FollowPage {
    pub follows: Vec<Follow>,
    /// `created_at` of the last returned row (epoch milliseconds), absent on
    /// the final page.
    pub next_cursor: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub user_did: String,
    pub key_type: KeyType,
    /// Public key, JWK JSON.
    pub public_jwk: String,
    /// Private key, JWK JSON.
    pub private_jwk: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewKeyPair {
    pub user_did: String,
    pub key_type: KeyType,
    pub public_jwk: String,
    pub private_jwk: String,
}

/// Credentials for a dedicated PDS repository owned by the sidecar.
#[derive(Clone, Debug)]
pub struct BridgeAccount {
    pub kind: BridgeKind,
    pub did: String,
    pub handle: String,
    pub password: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewBridgeAccount {
    pub kind: BridgeKind,
    pub did: String,
    pub handle: String,
    pub password: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

/// Cross-protocol identity of a single post.
///
/// Keeps remote reply targets resolvable back to their original ActivityPub
/// note id instead of a locally-minted URI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PostMapping {
    pub at_uri: String,
    pub ap_note_id: String,
    pub created_at: OffsetDateTime,
}

/// A local post watched by the external-reply poller.
#[derive(Clone, Debug)]
pub struct MonitoredPost {
    pub at_uri: String,
    pub author_did: String,
    pub last_checked: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Idempotency record for an external reply that was already federated.
#[derive(Clone, Debug)]
pub struct ExternalReply {
    pub at_uri: String,
    pub parent_at_uri: String,
    pub author_did: String,
    pub ap_note_id: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewExternalReply {
    pub at_uri: String,
    pub parent_at_uri: String,
    pub author_did: String,
    pub ap_note_id: String,
}

pub type DynBridgeStore = Arc<dyn BridgeStore>;

/// Storage-agnostic persistence surface for the bridge.
///
/// The store is the only shared mutable resource of the service; every other
/// component holds by-value copies of the rows it reads.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    /// Performs initial setup required before using the store.
    ///
    /// Runs PRAGMAs and forward-only migrations exactly once; a failure here
    /// must abort boot.
    async fn setup(&self) -> anyhow::Result<()>;

    /// Records an accepted follow. Idempotent: re-inserting the same
    /// `activity_id` leaves the original row untouched.
    async fn create_follow(&self, follow: NewFollow) -> anyhow::Result<()>;

    /// Deletes by the logical key `(user_did, actor_uri)`.
    async fn delete_follow(&self, user_did: &str, actor_uri: &str) -> anyhow::Result<()>;

    /// Pages follows newest-first. A caller passing `cursor = X` receives
    /// only rows with `created_at < X`.
    async fn get_follows(&self, user_did: &str, cursor: Option<i64>, limit: usize) -> anyhow::Result<FollowPage>;

    async fn get_follows_count(&self, user_did: &str) -> anyhow::Result<u64>;

    /// Inserts a key pair and returns the persisted row.
    ///
    /// Atomic per `(user_did, key_type)`: when two callers race, both get the
    /// winner's row back.
    async fn create_key_pair(&self, key_pair: NewKeyPair) -> anyhow::Result<KeyPair>;

    async fn get_key_pair(&self, user_did: &str, key_type: KeyType) -> anyhow::Result<Option<KeyPair>>;

    async fn get_key_pairs(&self, user_did: &str) -> anyhow::Result<Vec<KeyPair>>;

    async fn get_bridge_account(&self, kind: BridgeKind) -> anyhow::Result<Option<BridgeAccount>>;

    async fn create_bridge_account(&self, account: NewBridgeAccount) -> anyhow::Result<()>;

    /// Rotates the session tokens, bumping `updated_at`.
    async fn update_bridge_tokens(&self, kind: BridgeKind, access_jwt: &str, refresh_jwt: &str)
    -> anyhow::Result<()>;

    async fn delete_bridge_account(&self, kind: BridgeKind) -> anyhow::Result<()>;

    /// Idempotent on `at_uri`.
    async fn create_post_mapping(&self, at_uri: &str, ap_note_id: &str) -> anyhow::Result<()>;

    async fn get_post_mapping_by_at_uri(&self, at_uri: &str) -> anyhow::Result<Option<PostMapping>>;

    async fn get_post_mapping_by_ap_note_id(&self, ap_note_id: &str) -> anyhow::Result<Option<PostMapping>>;

    /// Idempotent on `at_uri`.
    async fn create_monitored_post(&self, at_uri: &str, author_did: &str) -> anyhow::Result<()>;

    /// Up to `limit` least-recently-checked posts, never-checked rows first.
    async fn get_monitored_posts_batch(&self, limit: usize) -> anyhow::Result<Vec<MonitoredPost>>;

    async fn update_monitored_post_last_checked(&self, at_uri: &str) -> anyhow::Result<()>;

    async fn get_external_reply(&self, at_uri: &str) -> anyhow::Result<Option<ExternalReply>>;

    async fn create_external_reply(&self, reply: NewExternalReply) -> anyhow::Result<()>;
}
