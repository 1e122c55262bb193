//! Actor/object URI synthesis and the outbound side of federation.

pub mod delivery;
pub mod keys;
pub mod vocab;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bridge_store::DynBridgeStore;
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use url::Url;

use crate::config::Conf;
use crate::http::ACTIVITY_CONTENT_TYPE;
use crate::pds::{PdsClient, USER_AGENT};

use self::vocab::RemoteActor;

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Builds and parses the ActivityPub URIs this service is authoritative for,
/// and performs outbound federation I/O (actor fetches, signed deliveries).
pub struct FederationContext {
    conf: Arc<Conf>,
    store: DynBridgeStore,
    pds: Arc<PdsClient>,
    client: reqwest::Client,
    /// Origin of `public_url` without a trailing slash.
    base: String,
}

impl FederationContext {
    pub fn new(conf: Arc<Conf>, store: DynBridgeStore, pds: Arc<PdsClient>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build federation HTTP client")?;

        let base = conf.public_url.as_str().trim_end_matches('/').to_owned();

        Ok(Self {
            conf,
            store,
            pds,
            client,
            base,
        })
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    pub fn store(&self) -> &DynBridgeStore {
        &self.store
    }

    pub fn pds(&self) -> &PdsClient {
        &self.pds
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn actor_uri(&self, identifier: &str) -> String {
        format!("{}/users/{identifier}", self.base)
    }

    pub fn inbox_uri(&self, identifier: &str) -> String {
        format!("{}/users/{identifier}/inbox", self.base)
    }

    pub fn outbox_uri(&self, identifier: &str) -> String {
        format!("{}/users/{identifier}/outbox", self.base)
    }

    pub fn followers_uri(&self, identifier: &str) -> String {
        format!("{}/users/{identifier}/followers", self.base)
    }

    pub fn following_uri(&self, identifier: &str) -> String {
        format!("{}/users/{identifier}/following", self.base)
    }

    pub fn shared_inbox_uri(&self) -> String {
        format!("{}/inbox", self.base)
    }

    /// Object URI for a record, addressed by its percent-encoded AT-URI.
    pub fn object_uri(&self, at_uri: &str) -> String {
        format!("{}/posts/{}", self.base, utf8_percent_encode(at_uri, NON_ALPHANUMERIC))
    }

    /// Extracts the local identifier out of one of our actor URIs.
    pub fn parse_actor_uri(&self, uri: &str) -> Option<String> {
        let identifier = uri.strip_prefix(&self.base)?.strip_prefix("/users/")?;

        if identifier.is_empty() || identifier.contains('/') {
            return None;
        }

        Some(identifier.to_owned())
    }

    /// Extracts the AT-URI out of a local object URI or `/posts/…` path.
    ///
    /// Absolute URLs must live under our own public URL; a bare path is
    /// accepted as-is.
    pub fn parse_object_uri(&self, target: &str) -> Option<String> {
        let path = if let Some(rest) = target.strip_prefix(&self.base) {
            rest
        } else if target.starts_with('/') {
            target
        } else {
            return None;
        };

        let encoded = path.strip_prefix("/posts/")?;
        let at_uri = percent_decode_str(encoded).decode_utf8().ok()?;

        at_uri.starts_with("at://").then(|| at_uri.into_owned())
    }

    /// Loads the actor's signing keys, creating any missing pair.
    pub async fn ensure_key_pairs(&self, identifier: &str) -> anyhow::Result<keys::ActorKeys> {
        keys::ensure_key_pairs(self.store.as_ref(), identifier).await
    }

    /// Fetches a remote actor document.
    pub async fn fetch_actor(&self, uri: &str) -> anyhow::Result<RemoteActor> {
        let url = Url::parse(uri).with_context(|| format!("invalid actor URI: {uri}"))?;
        self.check_url(&url)?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, ACTIVITY_CONTENT_TYPE)
            .send()
            .await
            .context("actor fetch failed")?
            .error_for_status()
            .context("actor fetch was rejected")?;

        response.json::<RemoteActor>().await.context("invalid actor document")
    }

    /// Refuses URLs pointing into private address space unless the test-only
    /// allowance is configured.
    pub(crate) fn check_url(&self, url: &Url) -> anyhow::Result<()> {
        if self.conf.allow_private_address {
            return Ok(());
        }

        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "unsupported URL scheme: {}",
            url.scheme()
        );

        let host = url.host_str().context("URL has no host")?;
        anyhow::ensure!(!is_private_host(host), "refusing private address: {host}");

        Ok(())
    }
}

fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    let candidate = host.trim_start_matches('[').trim_end_matches(']');

    match candidate.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            addr.is_loopback() || addr.is_private() || addr.is_link_local() || addr.is_unspecified()
        }
        Ok(IpAddr::V6(addr)) => addr.is_loopback() || addr.is_unspecified() || (addr.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn test_context() -> FederationContext {
        crate::test_support::federation_context()
    }

    #[test]
    fn uri_synthesis() {
        let ctx = test_context();

        assert_eq!(
            ctx.actor_uri("did:plc:alice"),
            "https://bridge.example/users/did:plc:alice"
        );
        assert_eq!(
            ctx.followers_uri("did:plc:alice"),
            "https://bridge.example/users/did:plc:alice/followers"
        );
        assert_eq!(ctx.shared_inbox_uri(), "https://bridge.example/inbox");
    }

    #[test]
    fn object_uri_roundtrip() {
        let ctx = test_context();

        let at_uri = "at://did:plc:alice/app.bsky.feed.post/abc";
        let object_uri = ctx.object_uri(at_uri);

        assert!(object_uri.starts_with("https://bridge.example/posts/"));
        assert_eq!(ctx.parse_object_uri(&object_uri).as_deref(), Some(at_uri));
    }

    #[rstest]
    #[case("/posts/at://did:plc:alice/app.bsky.feed.post/abc", Some("at://did:plc:alice/app.bsky.feed.post/abc"))]
    #[case("/posts/https://elsewhere.example/notes/1", None)]
    #[case("https://other.example/posts/at://did:plc:alice/app.bsky.feed.post/abc", None)]
    #[case("/users/did:plc:alice", None)]
    fn parse_object_uri_cases(#[case] target: &str, #[case] expected: Option<&str>) {
        let ctx = test_context();
        assert_eq!(ctx.parse_object_uri(target).as_deref(), expected);
    }

    #[rstest]
    #[case("https://bridge.example/users/did:plc:alice", Some("did:plc:alice"))]
    #[case("https://bridge.example/users/did:plc:alice/inbox", None)]
    #[case("https://other.example/users/did:plc:alice", None)]
    fn parse_actor_uri_cases(#[case] uri: &str, #[case] expected: Option<&str>) {
        let ctx = test_context();
        assert_eq!(ctx.parse_actor_uri(uri).as_deref(), expected);
    }

    #[rstest]
    #[case("localhost", true)]
    #[case("127.0.0.1", true)]
    #[case("10.1.2.3", true)]
    #[case("192.168.0.10", true)]
    #[case("169.254.0.1", true)]
    #[case("[::1]", true)]
    #[case("mastodon.social", false)]
    #[case("8.8.8.8", false)]
    fn private_host_detection(#[case] host: &str, #[case] expected: bool) {
        assert_eq!(is_private_host(host), expected);
    }
}
