//! Polls the backlink service for external replies to monitored posts and
//! re-publishes them through the bluesky-bridge actor.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use bridge_store::{MonitoredPost, NewExternalReply};
use serde::Deserialize;
use skybridge_task::{StopSignal, Task};
use url::Url;

use crate::BridgeState;
use crate::atproto::{self, AtUri};
use crate::config::ConstellationConf;
use crate::convert::richtext;
use crate::federation::delivery::DeliveryTargets;
use crate::federation::vocab::{Create, Note, PUBLIC};
use crate::pds::{PdsClient, USER_AGENT};

const BATCH_SIZE: usize = 50;
const BACKLINK_SOURCE: &str = "app.bsky.feed.post:reply.parent.uri";
const BACKLINK_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
struct BacklinksResponse {
    #[serde(default)]
    records: Vec<BacklinkRecord>,
}

#[derive(Debug, Deserialize)]
struct BacklinkRecord {
    did: String,
    collection: String,
    rkey: String,
}

fn backlink_uris(response: BacklinksResponse) -> Vec<String> {
    response
        .records
        .into_iter()
        .map(|record| AtUri::new(&record.did, &record.collection, &record.rkey).to_string())
        .collect()
}

/// Client for the `blue.microcosm.links.getBacklinks` endpoint.
pub struct ConstellationClient {
    base_url: Url,
    client: reqwest::Client,
}

impl ConstellationClient {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build backlink client")?;

        Ok(Self { base_url, client })
    }

    /// AT-URIs of records whose reply parent is `subject`.
    pub async fn get_backlinks(&self, subject: &str) -> anyhow::Result<Vec<String>> {
        let url = self
            .base_url
            .join("xrpc/blue.microcosm.links.getBacklinks")
            .context("cannot build backlinks URL")?;

        let response = self
            .client
            .get(url)
            .query(&[
                ("subject", subject),
                ("source", BACKLINK_SOURCE),
                ("limit", &BACKLINK_LIMIT.to_string()),
            ])
            .send()
            .await
            .context("backlink request failed")?
            .error_for_status()
            .context("backlink request was rejected")?;

        let body: BacklinksResponse = response.json().await.context("invalid backlink response")?;

        Ok(backlink_uris(body))
    }
}

/// Timer-driven worker discovering replies made from outside the local PDS.
pub struct ConstellationTask {
    state: BridgeState,
    conf: ConstellationConf,
    constellation: ConstellationClient,
    /// AppView used to fetch external records and profiles; the local PDS
    /// knows nothing about them.
    app_view: Arc<PdsClient>,
}

impl ConstellationTask {
    pub fn new(state: BridgeState, conf: ConstellationConf, app_view: Arc<PdsClient>) -> anyhow::Result<Self> {
        let constellation = ConstellationClient::new(conf.url.clone())?;

        Ok(Self {
            state,
            conf,
            constellation,
            app_view,
        })
    }
}

#[async_trait]
impl Task for ConstellationTask {
    type Output = anyhow::Result<()>;

    fn name(&self) -> &'static str {
        "external reply poller"
    }

    async fn run(self, mut stop: StopSignal) -> Self::Output {
        loop {
            tokio::select! {
                _ = stop.requested() => {
                    info!("External reply poller stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.conf.poll_interval) => {}
            }

            if let Err(error) = self.process_batch().await {
                error!(error = format!("{error:#}"), "External reply batch failed");
            }
        }
    }
}

impl ConstellationTask {
    pub async fn process_batch(&self) -> anyhow::Result<()> {
        if !self.state.bluesky_bridge.is_available() {
            debug!("Bluesky bridge unavailable; skipping poll");
            return Ok(());
        }

        let batch = self.state.store.get_monitored_posts_batch(BATCH_SIZE).await?;

        trace!(batch_size = batch.len(), "Polling monitored posts");

        for post in batch {
            // A failed backlink call fails this post, not the batch.
            if let Err(error) = self.process_post(&post).await {
                warn!(error = format!("{error:#}"), at_uri = %post.at_uri, "Failed to poll post for replies");
            }

            if let Err(error) = self.state.store.update_monitored_post_last_checked(&post.at_uri).await {
                warn!(error = format!("{error:#}"), at_uri = %post.at_uri, "Failed to stamp monitored post");
            }
        }

        Ok(())
    }

    async fn process_post(&self, post: &MonitoredPost) -> anyhow::Result<()> {
        let reply_uris = self.constellation.get_backlinks(&post.at_uri).await?;

        for reply_uri in reply_uris {
            if let Err(error) = self.process_reply(post, &reply_uri).await {
                warn!(error = format!("{error:#}"), %reply_uri, "Failed to federate external reply");
            }
        }

        Ok(())
    }

    /// Publishes one external reply exactly once.
    pub async fn process_reply(&self, post: &MonitoredPost, reply_uri: &str) -> anyhow::Result<()> {
        // Idempotency ledger first: a reply is federated at most once.
        if self.state.store.get_external_reply(reply_uri).await?.is_some() {
            return Ok(());
        }

        let reply_at = AtUri::parse(reply_uri)?;
        let author_did = reply_at.did.clone();

        // Replies from local accounts arrive through the firehose.
        if self.state.pds.get_account(&author_did).await?.is_some() {
            trace!(%reply_uri, "Skipping local reply");
            return Ok(());
        }

        if self.state.bridge_dids().iter().any(|did| *did == author_did) {
            return Ok(());
        }

        let Some(record) = self
            .app_view
            .get_record(&author_did, &reply_at.collection, &reply_at.rkey)
            .await?
        else {
            debug!(%reply_uri, "External reply record not found on the AppView");
            return Ok(());
        };

        let handle = self
            .app_view
            .get_profile(&author_did)
            .await?
            .map(|profile| profile.handle)
            .unwrap_or_else(|| author_did.clone());

        let text = record.value.get("text").and_then(|text| text.as_str()).unwrap_or_default();

        let bridge_did = self
            .state
            .bluesky_bridge
            .did()
            .context("bluesky bridge has no provisioned account")?;

        let ctx = &self.state.federation;

        let mut note = Note::new(ctx.object_uri(reply_uri), ctx.actor_uri(&bridge_did));
        note.content = Some(format!(
            "<p><a href=\"{}\">@{handle}</a> replied:</p><p>{}</p>",
            atproto::bsky_profile_url(&author_did),
            richtext::escape_html(text),
        ));
        note.in_reply_to = Some(ctx.object_uri(&post.at_uri));
        note.to = vec![PUBLIC.to_owned()];
        note.cc = vec![ctx.followers_uri(&post.author_did)];
        note.published = record
            .value
            .get("createdAt")
            .and_then(|created_at| created_at.as_str())
            .map(str::to_owned);
        note.url = Some(atproto::bsky_post_url(&author_did, &reply_at.rkey));

        let ap_note_id = note.id.clone();
        let create = Create::of_note(note);

        ctx.send_activity(
            &bridge_did,
            DeliveryTargets::FollowersOf(post.author_did.clone()),
            &create,
        )
        .await?;

        self.state
            .store
            .create_external_reply(NewExternalReply {
                at_uri: reply_uri.to_owned(),
                parent_at_uri: post.at_uri.clone(),
                author_did,
                ap_note_id,
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlink_records_become_at_uris() {
        let response: BacklinksResponse = serde_json::from_value(serde_json::json!({
            "total": 2,
            "records": [
                {"did": "did:plc:ext", "collection": "app.bsky.feed.post", "rkey": "z"},
                {"did": "did:plc:other", "collection": "app.bsky.feed.post", "rkey": "y"},
            ],
            "cursor": null,
        }))
        .unwrap();

        assert_eq!(
            backlink_uris(response),
            vec![
                "at://did:plc:ext/app.bsky.feed.post/z".to_owned(),
                "at://did:plc:other/app.bsky.feed.post/y".to_owned(),
            ]
        );
    }
}
