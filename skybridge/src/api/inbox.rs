//! Inbox listeners: Follow/Undo bookkeeping and reply ingestion.
//!
//! HTTP signature verification happens upstream of these handlers; here the
//! policy is log-and-drop: malformed or unconvertible activities are logged
//! and acknowledged, never bounced with a 4xx that would make the remote
//! side retry forever.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use bridge_store::NewFollow;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use url::Url;

use crate::BridgeState;
use crate::atproto::{AtUri, POST_COLLECTION};
use crate::convert::post::extract_language;
use crate::convert::{ApObject, RecordRef, ReplyRef, ToRecordOpts};
use crate::federation::delivery::{DeliveryTargets, InboxTarget};
use crate::federation::vocab::{Accept, Create, Follow, Undo};

pub(super) async fn post_user_inbox(
    State(state): State<BridgeState>,
    Path(_identifier): Path<String>,
    body: Bytes,
) -> StatusCode {
    handle_inbox(&state, &body).await
}

pub(super) async fn post_shared_inbox(State(state): State<BridgeState>, body: Bytes) -> StatusCode {
    handle_inbox(&state, &body).await
}

async fn handle_inbox(state: &BridgeState, body: &[u8]) -> StatusCode {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(error) => {
            debug!(%error, "Inbox received non-JSON payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    match value.get("type").and_then(|kind| kind.as_str()) {
        Some("Follow") => handle_follow(state, value).await,
        Some("Undo") => handle_undo(state, value).await,
        Some("Create") => handle_create(state, value).await,
        kind => debug!(?kind, "Ignoring activity type"),
    }

    StatusCode::ACCEPTED
}

/// Persists an accepted follow and answers with an Accept.
async fn handle_follow(state: &BridgeState, value: serde_json::Value) {
    let follow: Follow = match serde_json::from_value(value) {
        Ok(follow) => follow,
        Err(error) => {
            warn!(%error, "Dropping malformed Follow");
            return;
        }
    };

    // All three ids must be valid absolute URLs.
    if Url::parse(&follow.id).is_err() || Url::parse(&follow.actor).is_err() || Url::parse(&follow.object).is_err() {
        warn!(activity_id = %follow.id, "Dropping Follow with invalid ids");
        return;
    }

    let Some(identifier) = state.federation.parse_actor_uri(&follow.object) else {
        warn!(object = %follow.object, "Dropping Follow whose object is not a local actor");
        return;
    };

    match state.pds.get_account(&identifier).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(%identifier, "Dropping Follow for an unknown account");
            return;
        }
        Err(error) => {
            warn!(error = format!("{error:#}"), %identifier, "Dropping Follow; account lookup failed");
            return;
        }
    }

    let actor = match state.federation.fetch_actor(&follow.actor).await {
        Ok(actor) => actor,
        Err(error) => {
            warn!(error = format!("{error:#}"), actor = %follow.actor, "Dropping Follow; actor fetch failed");
            return;
        }
    };

    if Url::parse(&actor.inbox).is_err() {
        warn!(inbox = %actor.inbox, "Dropping Follow; actor advertises an invalid inbox");
        return;
    }

    if let Err(error) = state
        .store
        .create_follow(NewFollow {
            user_did: identifier.clone(),
            activity_id: follow.id.clone(),
            actor_uri: follow.actor.clone(),
            actor_inbox: actor.inbox.clone(),
        })
        .await
    {
        error!(error = format!("{error:#}"), activity_id = %follow.id, "Failed to persist follow");
        return;
    }

    info!(%identifier, actor = %follow.actor, "Follow accepted");

    let accept_id = format!(
        "{}#accepts/{}",
        state.federation.actor_uri(&identifier),
        utf8_percent_encode(&follow.id, NON_ALPHANUMERIC),
    );
    let accept = Accept::of_follow(accept_id, follow);

    let target = InboxTarget {
        id: actor.id,
        inbox: actor.inbox,
    };

    if let Err(error) = state
        .federation
        .send_activity(&identifier, DeliveryTargets::Inboxes(vec![target]), &accept)
        .await
    {
        error!(error = format!("{error:#}"), %identifier, "Failed to send Accept");
    }
}

/// Undo(Follow): deletes the follow row.
async fn handle_undo(state: &BridgeState, value: serde_json::Value) {
    let undo: Undo = match serde_json::from_value(value) {
        Ok(undo) => undo,
        Err(error) => {
            warn!(%error, "Dropping malformed Undo");
            return;
        }
    };

    if undo.object.get("type").and_then(|kind| kind.as_str()) != Some("Follow") {
        debug!("Ignoring Undo of a non-Follow object");
        return;
    }

    let Some(followed) = undo.object.get("object").and_then(|object| object.as_str()) else {
        warn!(activity_id = %undo.id, "Dropping Undo without a followed actor");
        return;
    };

    let Some(identifier) = state.federation.parse_actor_uri(followed) else {
        warn!(object = %followed, "Dropping Undo whose object is not a local actor");
        return;
    };

    if let Err(error) = state.store.delete_follow(&identifier, &undo.actor).await {
        error!(error = format!("{error:#}"), %identifier, "Failed to delete follow");
        return;
    }

    info!(%identifier, actor = %undo.actor, "Follow removed");
}

/// Create(Note) replying to a local post, re-published as a record on the
/// mastodon-bridge repository.
async fn handle_create(state: &BridgeState, value: serde_json::Value) {
    let create: Create = match serde_json::from_value(value) {
        Ok(create) => create,
        Err(error) => {
            warn!(%error, "Dropping Create without a Note object");
            return;
        }
    };

    let mut note = create.object;
    let ap_note_id = note.id.clone();

    let Some(reply_target) = note.in_reply_to.clone() else {
        debug!(note = %ap_note_id, "Ignoring Create that is not a reply");
        return;
    };

    let Some(parent_at_uri) = state.federation.parse_object_uri(&reply_target) else {
        debug!(%reply_target, "Ignoring reply to a non-local object");
        return;
    };

    if !state.mastodon_bridge.is_available() {
        warn!(note = %ap_note_id, "Mastodon bridge unavailable; dropping reply");
        return;
    }

    let Some(bridge_did) = state.mastodon_bridge.did() else {
        warn!(note = %ap_note_id, "Mastodon bridge has no account; dropping reply");
        return;
    };

    let actor = match state.federation.fetch_actor(&create.actor).await {
        Ok(actor) => actor,
        Err(error) => {
            warn!(error = format!("{error:#}"), actor = %create.actor, "Dropping reply; actor fetch failed");
            return;
        }
    };

    let handle = actor.handle().unwrap_or_else(|| actor.id.clone());

    let reply_ref = match resolve_reply_ref(state, &parent_at_uri).await {
        Ok(reply_ref) => reply_ref,
        Err(error) => {
            warn!(error = format!("{error:#}"), %parent_at_uri, "Dropping reply; parent lookup failed");
            return;
        }
    };

    // Attribute the proxied text to its author inside the content.
    let (html, lang) = extract_language(&note);
    let prefixed = format!("<p><a href=\"{}\">{handle}</a> replied:</p>{html}", actor.id);
    note.content = Some(prefixed.clone());
    note.content_map = lang.map(|lang| BTreeMap::from([(lang, prefixed)]));

    let Some(converter) = state.registry.get(POST_COLLECTION) else {
        error!("Post converter is not registered");
        return;
    };

    let opts = ToRecordOpts {
        uploader: Some(state.mastodon_bridge.as_ref()),
        reply: Some(reply_ref),
    };

    let prepared = match converter
        .to_record(&state.federation, &bridge_did, &ApObject::Note(note), opts)
        .await
    {
        Ok(Some(prepared)) => prepared,
        Ok(None) => {
            debug!(note = %ap_note_id, "Reply has no representable content");
            return;
        }
        Err(error) => {
            error!(error = format!("{error:#}"), note = %ap_note_id, "Reply conversion failed");
            return;
        }
    };

    let rkey = match AtUri::parse(&prepared.uri) {
        Ok(at_uri) => at_uri.rkey,
        Err(error) => {
            error!(error = format!("{error:#}"), uri = %prepared.uri, "Prepared record has a bad URI");
            return;
        }
    };

    let created = match state
        .mastodon_bridge
        .create_record_with_rkey(POST_COLLECTION, Some(&rkey), &prepared.value)
        .await
    {
        Ok(created) => created,
        Err(error) => {
            error!(error = format!("{error:#}"), note = %ap_note_id, "Failed to create bridged reply record");
            return;
        }
    };

    // Remember the original note id so future replies resolve to it.
    if let Err(error) = state.store.create_post_mapping(&created.uri, &ap_note_id).await {
        error!(error = format!("{error:#}"), uri = %created.uri, "Failed to persist post mapping");
    }

    info!(uri = %created.uri, note = %ap_note_id, "Bridged reply created");
}

/// Builds the reply ref for an ingested reply: the parent's own thread root
/// when it has one, otherwise the parent itself.
async fn resolve_reply_ref(state: &BridgeState, parent_at_uri: &str) -> anyhow::Result<ReplyRef> {
    let parent = AtUri::parse(parent_at_uri)?;

    let parent_record = state
        .pds
        .get_record(&parent.did, &parent.collection, &parent.rkey)
        .await?;

    let reply_ref = match parent_record {
        Some(record) => {
            let parent_ref = RecordRef {
                uri: parent_at_uri.to_owned(),
                cid: record.cid.clone().unwrap_or_default(),
            };

            let root = record
                .value
                .pointer("/reply/root")
                .and_then(|root| serde_json::from_value::<RecordRef>(root.clone()).ok())
                .unwrap_or_else(|| parent_ref.clone());

            ReplyRef {
                root,
                parent: parent_ref,
            }
        }
        // Parent record is gone; keep the relaxed empty-CID form.
        None => ReplyRef {
            root: RecordRef {
                uri: parent_at_uri.to_owned(),
                cid: String::new(),
            },
            parent: RecordRef {
                uri: parent_at_uri.to_owned(),
                cid: String::new(),
            },
        },
    };

    Ok(reply_ref)
}
