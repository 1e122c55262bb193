//! Consumes the PDS commit stream and drives conversion + delivery.

use std::io::Cursor;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt as _;
use serde::Deserialize;
use skybridge_task::{StopSignal, Task};
use time::OffsetDateTime;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::BridgeState;
use crate::atproto::POST_COLLECTION;
use crate::convert::RecordConverter;
use crate::federation::delivery::DeliveryTargets;
use crate::federation::vocab::{Delete, PUBLIC};

const SUBSCRIBE_REPOS: &str = "/xrpc/com.atproto.sync.subscribeRepos";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Header of a framed firehose message.
#[derive(Debug, Deserialize)]
struct FrameHeader {
    op: i64,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A `#commit` event body, reduced to the fields the bridge routes on.
#[derive(Debug, Deserialize)]
pub struct CommitEvent {
    pub repo: String,
    pub seq: i64,
    #[serde(default)]
    pub ops: Vec<RepoOp>,
}

#[derive(Debug, Deserialize)]
pub struct RepoOp {
    pub action: String,
    pub path: String,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug)]
pub enum Frame {
    Commit(CommitEvent),
    Error(ErrorBody),
    /// Anything the bridge has no semantics for (`#identity`, `#account`, …).
    Ignored,
}

/// Splits a WebSocket message into its two CBOR items and classifies it.
pub fn parse_frame(data: &[u8]) -> anyhow::Result<Frame> {
    let mut cursor = Cursor::new(data);

    let header: FrameHeader = ciborium::de::from_reader(&mut cursor).context("invalid frame header")?;

    match (header.op, header.t.as_deref()) {
        (1, Some("#commit")) => {
            let body: CommitEvent = ciborium::de::from_reader(&mut cursor).context("invalid commit body")?;
            Ok(Frame::Commit(body))
        }
        (-1, _) => {
            let body: ErrorBody = ciborium::de::from_reader(&mut cursor).unwrap_or_default();
            Ok(Frame::Error(body))
        }
        _ => Ok(Frame::Ignored),
    }
}

/// Routes one commit through the converter registry and out to followers.
///
/// Commits authored by a bridge repository are dropped wholesale: bridge
/// records must never re-federate.
pub async fn process_commit(state: &BridgeState, commit: &CommitEvent) -> anyhow::Result<()> {
    if state.bridge_dids().iter().any(|did| *did == commit.repo) {
        trace!(repo = %commit.repo, seq = commit.seq, "Dropping bridge-authored commit");
        return Ok(());
    }

    for op in &commit.ops {
        let mut parts = op.path.splitn(2, '/');
        let (Some(collection), Some(rkey)) = (parts.next(), parts.next()) else {
            debug!(path = %op.path, "Skipping op with unexpected path shape");
            continue;
        };

        let Some(converter) = state.registry.get(collection) else {
            continue;
        };

        let result = match op.action.as_str() {
            "create" => process_create(state, converter.as_ref(), &commit.repo, collection, rkey).await,
            "delete" => process_delete(state, &commit.repo, &op.path).await,
            // Updates have no federated semantic in the current mapping.
            _ => Ok(()),
        };

        if let Err(error) = result {
            error!(
                error = format!("{error:#}"),
                repo = %commit.repo,
                path = %op.path,
                seq = commit.seq,
                "Failed to process repo op"
            );
        }
    }

    Ok(())
}

async fn process_create(
    state: &BridgeState,
    converter: &dyn RecordConverter,
    repo: &str,
    collection: &str,
    rkey: &str,
) -> anyhow::Result<()> {
    let Some(record) = state.pds.get_record(repo, collection, rkey).await? else {
        debug!(%repo, %collection, %rkey, "Created record is already gone");
        return Ok(());
    };

    let Some(converted) = converter.to_activity_pub(&state.federation, repo, &record).await? else {
        return Ok(());
    };

    if let Some(activity) = converted.activity {
        state
            .federation
            .send_activity(repo, DeliveryTargets::FollowersOf(repo.to_owned()), &activity)
            .await?;
    }

    if collection == POST_COLLECTION {
        // Watch the post so external replies to it get discovered.
        state.store.create_monitored_post(&record.uri, repo).await?;
    }

    Ok(())
}

async fn process_delete(state: &BridgeState, repo: &str, path: &str) -> anyhow::Result<()> {
    let at_uri = format!("at://{repo}/{path}");
    let object_uri = state.federation.object_uri(&at_uri);

    let delete = Delete {
        kind: "Delete".to_owned(),
        id: format!("{object_uri}#delete-{}", OffsetDateTime::now_utc().unix_timestamp()),
        actor: state.federation.actor_uri(repo),
        to: vec![PUBLIC.to_owned()],
        cc: vec![state.federation.followers_uri(repo)],
        object: object_uri,
    };

    state
        .federation
        .send_activity(repo, DeliveryTargets::FollowersOf(repo.to_owned()), &delete)
        .await
}

/// Long-lived worker reading the firehose WebSocket.
pub struct FirehoseTask {
    pub state: BridgeState,
}

#[async_trait]
impl Task for FirehoseTask {
    type Output = anyhow::Result<()>;

    fn name(&self) -> &'static str {
        "firehose processor"
    }

    async fn run(self, mut stop: StopSignal) -> Self::Output {
        let mut cursor = self.state.conf_handle.get_conf().firehose.cursor;

        loop {
            tokio::select! {
                _ = stop.requested() => {
                    info!("Firehose processor stopping");
                    return Ok(());
                }
                result = self.run_connection(&mut cursor) => {
                    match result {
                        Ok(()) => warn!("Firehose connection closed"),
                        Err(error) => error!(error = format!("{error:#}"), "Firehose connection failed"),
                    }
                }
            }

            tokio::select! {
                _ = stop.requested() => {
                    info!("Firehose processor stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

impl FirehoseTask {
    async fn run_connection(&self, cursor: &mut Option<i64>) -> anyhow::Result<()> {
        let url = firehose_url(&self.state.conf_handle.get_conf().pds_url, *cursor)?;

        info!(%url, "Connecting to firehose");

        let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("failed to connect to firehose")?;

        while let Some(message) = stream.next().await {
            let message = message.context("firehose read failed")?;

            match message {
                Message::Binary(data) => match parse_frame(&data) {
                    Ok(Frame::Commit(commit)) => {
                        *cursor = Some(commit.seq);

                        if let Err(error) = process_commit(&self.state, &commit).await {
                            error!(
                                error = format!("{error:#}"),
                                repo = %commit.repo,
                                seq = commit.seq,
                                "Failed to process commit"
                            );
                        }
                    }
                    Ok(Frame::Error(body)) => {
                        error!(error = ?body.error, message = ?body.message, "Firehose sent an error frame");
                    }
                    Ok(Frame::Ignored) => {}
                    Err(error) => {
                        warn!(error = format!("{error:#}"), "Skipping undecodable frame");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        Ok(())
    }
}

fn firehose_url(pds_url: &Url, cursor: Option<i64>) -> anyhow::Result<Url> {
    let mut url = pds_url.clone();

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow::anyhow!("cannot switch {pds_url} to a WebSocket scheme"))?;

    url.set_path(SUBSCRIBE_REPOS);

    match cursor {
        Some(cursor) => url.set_query(Some(&format!("cursor={cursor}"))),
        None => url.set_query(None),
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(header: serde_json::Value, body: serde_json::Value) -> Vec<u8> {
        let mut data = Vec::new();
        ciborium::ser::into_writer(&header, &mut data).unwrap();
        ciborium::ser::into_writer(&body, &mut data).unwrap();
        data
    }

    #[test]
    fn commit_frame_decodes() {
        let data = encode_frame(
            serde_json::json!({"op": 1, "t": "#commit"}),
            serde_json::json!({
                "repo": "did:plc:alice",
                "seq": 42,
                "ops": [{"action": "create", "path": "app.bsky.feed.post/abc", "cid": "bafyrei"}],
            }),
        );

        let Frame::Commit(commit) = parse_frame(&data).unwrap() else {
            panic!("expected a commit frame");
        };

        assert_eq!(commit.repo, "did:plc:alice");
        assert_eq!(commit.seq, 42);
        assert_eq!(commit.ops.len(), 1);
        assert_eq!(commit.ops[0].action, "create");
        assert_eq!(commit.ops[0].path, "app.bsky.feed.post/abc");
        assert_eq!(commit.ops[0].cid.as_deref(), Some("bafyrei"));
    }

    #[test]
    fn error_frame_is_surfaced() {
        let data = encode_frame(
            serde_json::json!({"op": -1}),
            serde_json::json!({"error": "FutureCursor", "message": "cursor is ahead"}),
        );

        let Frame::Error(body) = parse_frame(&data).unwrap() else {
            panic!("expected an error frame");
        };

        assert_eq!(body.error.as_deref(), Some("FutureCursor"));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let data = encode_frame(
            serde_json::json!({"op": 1, "t": "#identity"}),
            serde_json::json!({"did": "did:plc:alice"}),
        );

        assert!(matches!(parse_frame(&data).unwrap(), Frame::Ignored));
    }

    #[test]
    fn garbage_fails_to_parse() {
        assert!(parse_frame(&[0xff, 0x00, 0x13, 0x37]).is_err());
    }

    #[test]
    fn firehose_url_carries_cursor() {
        let base = Url::parse("http://pds.example:2583").unwrap();

        let plain = firehose_url(&base, None).unwrap();
        assert_eq!(plain.as_str(), "ws://pds.example:2583/xrpc/com.atproto.sync.subscribeRepos");

        let resumed = firehose_url(&Url::parse("https://pds.example").unwrap(), Some(17)).unwrap();
        assert_eq!(
            resumed.as_str(),
            "wss://pds.example/xrpc/com.atproto.sync.subscribeRepos?cursor=17"
        );
    }
}
