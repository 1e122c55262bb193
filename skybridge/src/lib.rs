#[macro_use]
extern crate tracing;

pub mod api;
pub mod atproto;
pub mod bridge_account;
pub mod config;
pub mod convert;
pub mod federation;
pub mod firehose;
pub mod http;
pub mod listener;
pub mod log;
pub mod pds;
pub mod poller;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use bridge_store::DynBridgeStore;

use crate::bridge_account::BridgeAccountManager;
use crate::config::ConfHandle;
use crate::convert::ConverterRegistry;
use crate::federation::FederationContext;
use crate::pds::PdsClient;

/// Shared handle distributed to the HTTP handlers and the background tasks.
///
/// Constructed in two phases by the service: store and PDS client first, then
/// the components depending on them (see `service::spawn_tasks`).
#[derive(Clone)]
pub struct BridgeState {
    pub conf_handle: ConfHandle,
    pub store: DynBridgeStore,
    pub pds: Arc<PdsClient>,
    pub federation: Arc<FederationContext>,
    pub registry: Arc<ConverterRegistry>,
    pub mastodon_bridge: Arc<BridgeAccountManager>,
    pub bluesky_bridge: Arc<BridgeAccountManager>,
    pub stop_signal: skybridge_task::StopSignal,
}

impl BridgeState {
    /// DIDs of the provisioned bridge accounts, used to keep bridge-authored
    /// records from re-federating.
    pub fn bridge_dids(&self) -> Vec<String> {
        [&self.mastodon_bridge, &self.bluesky_bridge]
            .into_iter()
            .filter_map(|manager| manager.did())
            .collect()
    }
}
