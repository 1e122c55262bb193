//! ActivityStreams vocabulary subset used by the bridge.
//!
//! Serialization follows the JSON-LD compacted form Mastodon and friends
//! exchange: camelCase keys, a `type` discriminator on every object and
//! `@context` only on top-level documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Special collection addressing every actor.
pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
const MULTIKEY_CONTEXT: &str = "https://w3id.org/security/multikey/v1";

/// Wraps a top-level response with the JSON-LD `@context` array.
#[derive(Debug, Serialize)]
pub struct WithContext<T> {
    #[serde(rename = "@context")]
    context: serde_json::Value,
    #[serde(flatten)]
    inner: T,
}

impl<T> WithContext<T> {
    pub fn new(inner: T) -> Self {
        Self {
            context: serde_json::json!([ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT, MULTIKEY_CONTEXT]),
            inner,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Multikey {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub controller: String,
    pub public_key_multibase: String,
}

impl Multikey {
    pub fn new(id: String, controller: String, public_key_multibase: String) -> Self {
        Self {
            kind: "Multikey".to_owned(),
            id,
            controller,
            public_key_multibase,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl Image {
    pub fn new(url: String) -> Self {
        Self {
            kind: "Image".to_owned(),
            url,
            media_type: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub preferred_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub following: String,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertion_method: Vec<Multikey>,
}

/// Media attachment on a Note.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Document {
    pub fn new(url: String, media_type: Option<String>, name: Option<String>) -> Self {
        Self {
            kind: "Document".to_owned(),
            url,
            media_type,
            name,
            width: None,
            height: None,
        }
    }
}

/// Empty interaction collection advertised on outgoing Notes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStub {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub total_items: u64,
}

impl CollectionStub {
    pub fn empty(id: String) -> Self {
        Self {
            kind: "Collection".to_owned(),
            id,
            total_items: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub attributed_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_map: Option<BTreeMap<String, String>>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<CollectionStub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<CollectionStub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<CollectionStub>,
}

impl Note {
    pub fn new(id: String, attributed_to: String) -> Self {
        Self {
            kind: "Note".to_owned(),
            id,
            attributed_to,
            content: None,
            content_map: None,
            to: Vec::new(),
            cc: Vec::new(),
            in_reply_to: None,
            published: None,
            url: None,
            attachment: Vec::new(),
            replies: None,
            shares: None,
            likes: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub actor: String,
    /// URI of the actor being followed.
    pub object: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub actor: String,
    pub object: Follow,
}

impl Accept {
    pub fn of_follow(id: String, follow: Follow) -> Self {
        Self {
            kind: "Accept".to_owned(),
            id,
            actor: follow.object.clone(),
            object: follow,
        }
    }
}

/// Undo wraps its object loosely: Mastodon embeds the full Follow, other
/// software may send only its id.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Undo {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub actor: String,
    pub object: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Create {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub actor: String,
    pub object: Note,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Create {
    pub fn of_note(note: Note) -> Self {
        Self {
            kind: "Create".to_owned(),
            id: format!("{}#activity", note.id),
            actor: note.attributed_to.clone(),
            to: note.to.clone(),
            cc: note.cc.clone(),
            published: note.published.clone(),
            url: note.url.clone(),
            object: note,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub actor: String,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// URI of the deleted object.
    pub object: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub total_items: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered_items: Option<Vec<serde_json::Value>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub ordered_items: Vec<serde_json::Value>,
}

/// The fields of a fetched remote actor document the bridge cares about.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteActor {
    pub id: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub endpoints: Option<ActorEndpoints>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorEndpoints {
    #[serde(default)]
    pub shared_inbox: Option<String>,
}

impl RemoteActor {
    /// `@username@host` rendering of the actor, falling back to the URL host
    /// when no preferred username is advertised.
    pub fn handle(&self) -> Option<String> {
        let username = self.preferred_username.as_deref()?;
        let host = url::Url::parse(&self.id).ok()?.host_str()?.to_owned();
        Some(format!("@{username}@{host}"))
    }
}

/// Addressing fields accept both a single string and an array.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}
