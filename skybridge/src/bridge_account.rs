//! Provisioning and session management for the dedicated bridge
//! repositories.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use bridge_store::{BridgeAccount, BridgeKind, DynBridgeStore, NewBridgeAccount};
use rand::Rng as _;
use rand::distributions::Alphanumeric;

use crate::atproto::PROFILE_COLLECTION;
use crate::config::BridgeConf;
use crate::convert::blobs::{BlobMediator, BlobUploader};
use crate::pds::{Blob, CreatedRecord, PdsClient, XrpcError};

const PASSWORD_LENGTH: usize = 24;

#[derive(Default)]
struct ManagerState {
    account: Option<BridgeAccount>,
    initialized: bool,
    /// Set when a refreshed session is rejected again; cleared only by a
    /// restart.
    failed: bool,
}

/// Owns one dedicated PDS repository used to publish proxied content.
///
/// The same manager serves both bridge kinds; the configuration section and
/// the store rows it touches are selected by `kind`.
pub struct BridgeAccountManager {
    kind: BridgeKind,
    conf: Option<BridgeConf>,
    admin_token: Option<String>,
    store: DynBridgeStore,
    pds: Arc<PdsClient>,
    state: parking_lot::RwLock<ManagerState>,
    /// Single-flights token refresh: concurrent 401s must not race each
    /// other's refresh tokens.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl BridgeAccountManager {
    pub fn new(
        kind: BridgeKind,
        conf: Option<BridgeConf>,
        admin_token: Option<String>,
        store: DynBridgeStore,
        pds: Arc<PdsClient>,
    ) -> Self {
        Self {
            kind,
            conf,
            admin_token,
            store,
            pds,
            state: parking_lot::RwLock::new(ManagerState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> BridgeKind {
        self.kind
    }

    /// Whether bridging through this account is configured, provisioned and
    /// not in a failed state.
    pub fn is_available(&self) -> bool {
        let state = self.state.read();
        self.conf.is_some() && state.initialized && !state.failed
    }

    pub fn did(&self) -> Option<String> {
        self.state.read().account.as_ref().map(|account| account.did.clone())
    }

    pub fn handle(&self) -> Option<String> {
        self.state
            .read()
            .account
            .as_ref()
            .map(|account| account.handle.clone())
    }

    /// Single-shot provisioning: creates the PDS account on first start and
    /// publishes its profile; later starts only load the stored credentials.
    pub async fn init(&self) -> anyhow::Result<()> {
        let Some(conf) = self.conf.clone() else {
            debug!(kind = %self.kind, "Bridge account not configured");
            return Ok(());
        };

        if let Some(account) = self.store.get_bridge_account(self.kind).await? {
            debug!(kind = %self.kind, did = %account.did, "Bridge account already provisioned");

            let mut state = self.state.write();
            state.account = Some(account);
            state.initialized = true;

            return Ok(());
        }

        info!(kind = %self.kind, handle = %conf.handle, "Provisioning bridge account");

        let invite_code = match self.admin_token.as_deref() {
            Some(token) => Some(
                self.pds
                    .create_invite_code(token)
                    .await
                    .context("failed to create invite code")?,
            ),
            None => None,
        };

        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();

        let session = self
            .pds
            .create_account(&conf.handle, &password, invite_code.as_deref())
            .await
            .context("failed to create bridge account on the PDS")?;

        self.store
            .create_bridge_account(NewBridgeAccount {
                kind: self.kind,
                did: session.did.clone(),
                handle: session.handle.clone(),
                password,
                access_jwt: session.access_jwt,
                refresh_jwt: session.refresh_jwt,
            })
            .await?;

        let account = self
            .store
            .get_bridge_account(self.kind)
            .await?
            .context("bridge account missing after creation")?;

        {
            let mut state = self.state.write();
            state.account = Some(account);
            state.initialized = true;
        }

        // Profile publication is cosmetic; a failure must not unprovision
        // the account.
        if let Err(error) = self.publish_profile(&conf).await {
            warn!(error = format!("{error:#}"), kind = %self.kind, "Failed to publish bridge profile");
        }

        Ok(())
    }

    async fn publish_profile(&self, conf: &BridgeConf) -> anyhow::Result<()> {
        let mut profile = serde_json::json!({ "$type": PROFILE_COLLECTION });

        if let Some(display_name) = &conf.display_name {
            profile["displayName"] = serde_json::Value::String(display_name.clone());
        }
        if let Some(description) = &conf.description {
            profile["description"] = serde_json::Value::String(description.clone());
        }

        if let Some(avatar_url) = &conf.avatar_url {
            let client = reqwest::Client::builder()
                .user_agent(crate::pds::USER_AGENT)
                .build()
                .context("failed to build avatar client")?;
            let mediator = BlobMediator::new(client, false);
            if let Some((bytes, mime_type)) = mediator.fetch_capped(avatar_url.as_str(), None).await {
                let blob = self.upload_blob(bytes, &mime_type).await?;
                profile["avatar"] = serde_json::to_value(&blob)?;
            }
        }

        self.create_record_with_rkey(PROFILE_COLLECTION, Some("self"), &profile)
            .await?;

        Ok(())
    }

    fn current_account(&self) -> anyhow::Result<BridgeAccount> {
        let state = self.state.read();

        anyhow::ensure!(!state.failed, "bridge account {} is marked unavailable", self.kind);

        state
            .account
            .clone()
            .with_context(|| format!("bridge account {} is not initialized", self.kind))
    }

    fn mark_failed(&self) {
        error!(kind = %self.kind, "Bridge credentials rejected after refresh; marking unavailable until restart");
        self.state.write().failed = true;
    }

    /// Rotates the session tokens; only one refresh runs at a time, and
    /// losers of the race reuse the winner's fresh tokens.
    async fn refresh_tokens(&self) -> anyhow::Result<BridgeAccount> {
        let _guard = self.refresh_lock.lock().await;

        // Someone may have refreshed while we waited for the lock.
        let account = self
            .store
            .get_bridge_account(self.kind)
            .await?
            .with_context(|| format!("bridge account {} disappeared from the store", self.kind))?;

        if let Some(cached) = self.state.read().account.as_ref()
            && cached.access_jwt != account.access_jwt
        {
            self.state.write().account = Some(account.clone());
            return Ok(account);
        }

        let tokens = match self.pds.refresh_session(&account.refresh_jwt).await {
            Ok(tokens) => tokens,
            Err(error) if is_auth_error(&error) => {
                self.mark_failed();
                return Err(error).context("bridge session refresh was rejected");
            }
            Err(error) => return Err(error).context("bridge session refresh failed"),
        };

        self.store
            .update_bridge_tokens(self.kind, &tokens.access_jwt, &tokens.refresh_jwt)
            .await?;

        let account = self
            .store
            .get_bridge_account(self.kind)
            .await?
            .with_context(|| format!("bridge account {} disappeared from the store", self.kind))?;

        self.state.write().account = Some(account.clone());

        Ok(account)
    }

    /// Creates a record in the bridge repository, refreshing the session
    /// once on a 401.
    pub async fn create_record(&self, collection: &str, value: &serde_json::Value) -> anyhow::Result<CreatedRecord> {
        self.create_record_with_rkey(collection, None, value).await
    }

    pub async fn create_record_with_rkey(
        &self,
        collection: &str,
        rkey: Option<&str>,
        value: &serde_json::Value,
    ) -> anyhow::Result<CreatedRecord> {
        let account = self.current_account()?;

        match self
            .pds
            .create_record(&account.did, collection, rkey, value, &account.access_jwt)
            .await
        {
            Ok(created) => Ok(created),
            Err(error) if is_auth_error(&error) => {
                let account = self.refresh_tokens().await?;

                match self
                    .pds
                    .create_record(&account.did, collection, rkey, value, &account.access_jwt)
                    .await
                {
                    Ok(created) => Ok(created),
                    Err(error) if is_auth_error(&error) => {
                        self.mark_failed();
                        Err(error).context("bridge credentials rejected after refresh")
                    }
                    Err(error) => Err(error).context("failed to create record"),
                }
            }
            Err(error) => Err(error).context("failed to create record"),
        }
    }

    async fn upload_blob_inner(&self, bytes: Vec<u8>, mime_type: &str) -> anyhow::Result<Blob> {
        let account = self.current_account()?;

        match self
            .pds
            .upload_blob(bytes.clone(), mime_type, &account.access_jwt)
            .await
        {
            Ok(blob) => Ok(blob),
            Err(error) if is_auth_error(&error) => {
                let account = self.refresh_tokens().await?;

                match self.pds.upload_blob(bytes, mime_type, &account.access_jwt).await {
                    Ok(blob) => Ok(blob),
                    Err(error) if is_auth_error(&error) => {
                        self.mark_failed();
                        Err(error).context("bridge credentials rejected after refresh")
                    }
                    Err(error) => Err(error).context("failed to upload blob"),
                }
            }
            Err(error) => Err(error).context("failed to upload blob"),
        }
    }
}

#[async_trait]
impl BlobUploader for BridgeAccountManager {
    async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str) -> anyhow::Result<Blob> {
        self.upload_blob_inner(bytes, mime_type).await
    }
}

/// A rejected or expired session token; everything else is a plain failure.
fn is_auth_error(error: &XrpcError) -> bool {
    match error {
        XrpcError::Network(_) => false,
        XrpcError::Status { status, error, .. } => {
            *status == reqwest::StatusCode::UNAUTHORIZED || error.as_deref() == Some("ExpiredToken")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn unconfigured_manager_is_unavailable_but_inits_cleanly() {
        let store = test_support::memory_store().await;
        let pds = Arc::new(PdsClient::new(url::Url::parse("http://pds.example:2583").unwrap()).unwrap());

        let manager = BridgeAccountManager::new(BridgeKind::Mastodon, None, None, store, pds);

        manager.init().await.unwrap();

        assert!(!manager.is_available());
        assert!(manager.did().is_none());
    }

    #[tokio::test]
    async fn already_provisioned_account_loads_from_store() {
        let store = test_support::memory_store().await;
        let pds = Arc::new(PdsClient::new(url::Url::parse("http://pds.example:2583").unwrap()).unwrap());

        store
            .create_bridge_account(NewBridgeAccount {
                kind: BridgeKind::Bluesky,
                did: "did:plc:bridge".to_owned(),
                handle: "bridge.pds.example".to_owned(),
                password: "hunter2".to_owned(),
                access_jwt: "access".to_owned(),
                refresh_jwt: "refresh".to_owned(),
            })
            .await
            .unwrap();

        let manager = BridgeAccountManager::new(
            BridgeKind::Bluesky,
            Some(BridgeConf {
                kind: BridgeKind::Bluesky,
                handle: "bridge.pds.example".to_owned(),
                display_name: None,
                description: None,
                avatar_url: None,
            }),
            None,
            store,
            pds,
        );

        manager.init().await.unwrap();

        assert!(manager.is_available());
        assert_eq!(manager.did().as_deref(), Some("did:plc:bridge"));
        assert_eq!(manager.handle().as_deref(), Some("bridge.pds.example"));
    }

    #[test]
    fn auth_error_detection() {
        let unauthorized = XrpcError::Status {
            status: reqwest::StatusCode::UNAUTHORIZED,
            error: None,
            message: None,
        };
        assert!(is_auth_error(&unauthorized));

        let expired = XrpcError::Status {
            status: reqwest::StatusCode::BAD_REQUEST,
            error: Some("ExpiredToken".to_owned()),
            message: None,
        };
        assert!(is_auth_error(&expired));

        let not_found = XrpcError::Status {
            status: reqwest::StatusCode::NOT_FOUND,
            error: None,
            message: None,
        };
        assert!(!is_auth_error(&not_found));
    }
}
