//! Small AT-Protocol primitives: AT-URIs, TIDs and record CIDs.

use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use rand::Rng as _;
use sha2::{Digest as _, Sha256};

/// Collection NSID for feed posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";
/// Collection NSID for the actor profile record.
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";
/// Collection NSID for graph follows.
pub const GRAPH_FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

/// DAG-CBOR multicodec.
const DAG_CBOR_CODEC: u64 = 0x71;
/// SHA2-256 multihash code.
const SHA2_256_CODE: u64 = 0x12;

/// Parsed `at://{did}/{collection}/{rkey}` address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(uri: &str) -> anyhow::Result<Self> {
        let rest = uri.strip_prefix("at://").with_context(|| format!("not an AT-URI: {uri}"))?;

        let mut parts = rest.splitn(3, '/');
        let did = parts.next().filter(|s| !s.is_empty());
        let collection = parts.next().filter(|s| !s.is_empty());
        let rkey = parts.next().filter(|s| !s.is_empty());

        match (did, collection, rkey) {
            (Some(did), Some(collection), Some(rkey)) => Ok(Self {
                did: did.to_owned(),
                collection: collection.to_owned(),
                rkey: rkey.to_owned(),
            }),
            _ => anyhow::bail!("malformed AT-URI: {uri}"),
        }
    }

    pub fn new(did: &str, collection: &str, rkey: &str) -> Self {
        Self {
            did: did.to_owned(),
            collection: collection.to_owned(),
            rkey: rkey.to_owned(),
        }
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

/// Timestamp identifier used as a record key.
///
/// 13 characters of base32-sortable encoding over a 64-bit value:
/// microseconds since the UNIX epoch shifted left by 10 bits, OR-ed with a
/// random 10-bit clock identifier. Lexicographic order matches creation
/// order.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Tid(String);

const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

impl Tid {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros())
            .unwrap_or_default();
        let micros = u64::try_from(micros).unwrap_or(u64::MAX) & ((1 << 53) - 1);

        let clock_id = rand::thread_rng().gen_range(0u64..1024);

        Self::from_raw((micros << 10) | clock_id)
    }

    fn from_raw(value: u64) -> Self {
        let mut out = String::with_capacity(13);

        for i in 0..13 {
            let shift = 60 - 5 * i;
            let index = usize::try_from((value >> shift) & 0x1f).unwrap_or_default();
            out.push(char::from(TID_ALPHABET[index]));
        }

        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the CID of a record: DAG-CBOR encoding, SHA2-256, CIDv1.
pub fn record_cid(value: &serde_json::Value) -> anyhow::Result<String> {
    let encoded = serde_ipld_dagcbor::to_vec(value).context("failed to encode record as DAG-CBOR")?;

    let digest = Sha256::digest(&encoded);
    let multihash =
        multihash::Multihash::<64>::wrap(SHA2_256_CODE, &digest).context("failed to wrap record digest")?;

    Ok(cid::Cid::new_v1(DAG_CBOR_CODEC, multihash).to_string())
}

/// Public Bluesky permalink for a post record.
pub fn bsky_post_url(did: &str, rkey: &str) -> String {
    format!("https://bsky.app/profile/{did}/post/{rkey}")
}

/// Public Bluesky permalink for a profile.
pub fn bsky_profile_url(did: &str) -> String {
    format!("https://bsky.app/profile/{did}")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("at://did:plc:alice/app.bsky.feed.post/abc", "did:plc:alice", "app.bsky.feed.post", "abc")]
    #[case("at://did:web:pds.example/app.bsky.graph.follow/3k2a", "did:web:pds.example", "app.bsky.graph.follow", "3k2a")]
    fn at_uri_roundtrip(#[case] uri: &str, #[case] did: &str, #[case] collection: &str, #[case] rkey: &str) {
        let parsed = AtUri::parse(uri).unwrap();
        assert_eq!(parsed.did, did);
        assert_eq!(parsed.collection, collection);
        assert_eq!(parsed.rkey, rkey);
        assert_eq!(parsed.to_string(), uri);
    }

    #[rstest]
    #[case("https://example.com/not-an-at-uri")]
    #[case("at://did:plc:alice")]
    #[case("at://did:plc:alice/app.bsky.feed.post")]
    #[case("at://did:plc:alice//abc")]
    fn at_uri_rejects_malformed(#[case] uri: &str) {
        assert!(AtUri::parse(uri).is_err());
    }

    #[test]
    fn tid_is_13_chars_of_alphabet() {
        let tid = Tid::now();
        assert_eq!(tid.as_str().len(), 13);
        assert!(tid.as_str().bytes().all(|b| TID_ALPHABET.contains(&b)));
    }

    #[test]
    fn tid_orders_by_time() {
        let early = Tid::from_raw(1_000_000 << 10);
        let late = Tid::from_raw(2_000_000 << 10);
        assert!(early < late);
    }

    #[test]
    fn record_cid_is_stable() {
        let value = serde_json::json!({"$type": "app.bsky.feed.post", "text": "Hello"});

        let first = record_cid(&value).unwrap();
        let second = record_cid(&value).unwrap();

        assert_eq!(first, second);
        // CIDv1, base32 multibase.
        assert!(first.starts_with('b'));
        assert!(first.len() > 10);
    }
}
