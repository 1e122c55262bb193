//! Shared fixtures for unit tests.

use std::sync::Arc;

use bridge_store::{BridgeStore, DynBridgeStore};
use bridge_store_libsql::LibSqlBridgeStore;
use url::Url;

use crate::config::{Conf, FirehoseConf};
use crate::federation::FederationContext;
use crate::pds::PdsClient;

pub(crate) fn test_conf() -> Conf {
    Conf {
        hostname: "bridge.example".to_owned(),
        port: 3000,
        public_url: Url::parse("https://bridge.example").expect("static URL"),
        pds_url: Url::parse("http://pds.example:2583").expect("static URL"),
        pds_hostname: "pds.example".to_owned(),
        pds_admin_token: None,
        db_location: ":memory:".to_owned(),
        firehose: FirehoseConf {
            enabled: false,
            cursor: None,
        },
        mastodon_bridge: None,
        bluesky_bridge: None,
        constellation: None,
        app_view_url: None,
        allow_private_address: false,
        log_directive: None,
    }
}

pub(crate) async fn memory_store() -> DynBridgeStore {
    let store = LibSqlBridgeStore::open(":memory:").await.expect("open in-memory store");
    store.setup().await.expect("setup in-memory store");
    Arc::new(store)
}

/// Context over a store stub; for tests exercising only URI synthesis.
pub(crate) fn federation_context() -> FederationContext {
    let conf = Arc::new(test_conf());
    let pds = Arc::new(PdsClient::new(conf.pds_url.clone()).expect("build PDS client"));

    FederationContext::new(conf, Arc::new(NullStore), pds).expect("build federation context")
}

/// Context backed by a live in-memory store.
pub(crate) async fn federation_context_with_store() -> (FederationContext, DynBridgeStore) {
    let conf = Arc::new(test_conf());
    let pds = Arc::new(PdsClient::new(conf.pds_url.clone()).expect("build PDS client"));
    let store = memory_store().await;

    let ctx = FederationContext::new(conf, Arc::clone(&store), pds).expect("build federation context");
    (ctx, store)
}

/// Store stub that answers nothing; panics are acceptable in tests reaching
/// further than intended.
pub(crate) struct NullStore;

#[async_trait::async_trait]
impl BridgeStore for NullStore {
    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_follow(&self, _follow: bridge_store::NewFollow) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_follow(&self, _user_did: &str, _actor_uri: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_follows(
        &self,
        _user_did: &str,
        _cursor: Option<i64>,
        _limit: usize,
    ) -> anyhow::Result<bridge_store::FollowPage> {
        Ok(bridge_store::FollowPage::default())
    }

    async fn get_follows_count(&self, _user_did: &str) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn create_key_pair(&self, _key_pair: bridge_store::NewKeyPair) -> anyhow::Result<bridge_store::KeyPair> {
        anyhow::bail!("NullStore does not persist key pairs")
    }

    async fn get_key_pair(
        &self,
        _user_did: &str,
        _key_type: bridge_store::KeyType,
    ) -> anyhow::Result<Option<bridge_store::KeyPair>> {
        Ok(None)
    }

    async fn get_key_pairs(&self, _user_did: &str) -> anyhow::Result<Vec<bridge_store::KeyPair>> {
        Ok(Vec::new())
    }

    async fn get_bridge_account(
        &self,
        _kind: bridge_store::BridgeKind,
    ) -> anyhow::Result<Option<bridge_store::BridgeAccount>> {
        Ok(None)
    }

    async fn create_bridge_account(&self, _account: bridge_store::NewBridgeAccount) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_bridge_tokens(
        &self,
        _kind: bridge_store::BridgeKind,
        _access_jwt: &str,
        _refresh_jwt: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_bridge_account(&self, _kind: bridge_store::BridgeKind) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_post_mapping(&self, _at_uri: &str, _ap_note_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_post_mapping_by_at_uri(&self, _at_uri: &str) -> anyhow::Result<Option<bridge_store::PostMapping>> {
        Ok(None)
    }

    async fn get_post_mapping_by_ap_note_id(
        &self,
        _ap_note_id: &str,
    ) -> anyhow::Result<Option<bridge_store::PostMapping>> {
        Ok(None)
    }

    async fn create_monitored_post(&self, _at_uri: &str, _author_did: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_monitored_posts_batch(&self, _limit: usize) -> anyhow::Result<Vec<bridge_store::MonitoredPost>> {
        Ok(Vec::new())
    }

    async fn update_monitored_post_last_checked(&self, _at_uri: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_external_reply(&self, _at_uri: &str) -> anyhow::Result<Option<bridge_store::ExternalReply>> {
        Ok(None)
    }

    async fn create_external_reply(&self, _reply: bridge_store::NewExternalReply) -> anyhow::Result<()> {
        Ok(())
    }
}
