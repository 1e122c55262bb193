//! The `app.bsky.feed.post` ↔ Note converter.

use async_trait::async_trait;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::atproto::{self, AtUri, POST_COLLECTION, Tid};
use crate::federation::FederationContext;
use crate::federation::vocab::{CollectionStub, Create, Document, Note, PUBLIC};
use crate::pds::RecordEnvelope;

use super::blobs::{BlobMediator, UploadedAttachment};
use super::richtext;
use super::{ApActivity, ApObject, Converted, PreparedRecord, RecordConverter, RecordRef, ReplyRef, ToRecordOpts};

/// Maximum UTF-8 length of a post record's text.
const MAX_TEXT_BYTES: usize = 3000;

const IMAGES_EMBED: &str = "app.bsky.embed.images";
const VIDEO_EMBED: &str = "app.bsky.embed.video";
/// At most this many images fit in an images embed.
const MAX_EMBED_IMAGES: usize = 4;

pub struct PostConverter;

#[async_trait]
impl RecordConverter for PostConverter {
    fn collection(&self) -> &'static str {
        POST_COLLECTION
    }

    async fn to_activity_pub(
        &self,
        ctx: &FederationContext,
        identifier: &str,
        record: &RecordEnvelope,
    ) -> anyhow::Result<Option<Converted>> {
        let Some(text) = record.value.get("text").and_then(|text| text.as_str()) else {
            return Ok(None);
        };

        let at_uri = AtUri::parse(&record.uri)?;

        let ap_uri = ctx.object_uri(&record.uri);
        let actor = ctx.actor_uri(identifier);
        let followers = ctx.followers_uri(identifier);

        let mut note = Note::new(ap_uri.clone(), actor);

        // Replies carry the parent's original ActivityPub identity when one
        // is on file, so external-origin threads stay intact.
        if let Some(parent_uri) = record
            .value
            .pointer("/reply/parent/uri")
            .and_then(|uri| uri.as_str())
        {
            note.in_reply_to = Some(match ctx.store().get_post_mapping_by_at_uri(parent_uri).await? {
                Some(mapping) => mapping.ap_note_id,
                None => ctx.object_uri(parent_uri),
            });
        }

        let html = richtext::to_html(text);

        let langs: Vec<String> = record
            .value
            .get("langs")
            .and_then(|langs| langs.as_array())
            .map(|langs| {
                langs
                    .iter()
                    .filter_map(|lang| lang.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if !langs.is_empty() {
            note.content_map = Some(langs.iter().map(|lang| (lang.clone(), html.clone())).collect());
        }
        note.content = Some(html);

        note.attachment = embed_documents(ctx, identifier, record.value.get("embed"));

        note.replies = Some(CollectionStub::empty(format!("{ap_uri}/replies")));
        note.shares = Some(CollectionStub::empty(format!("{ap_uri}/shares")));
        note.likes = Some(CollectionStub::empty(format!("{ap_uri}/likes")));

        note.to = vec![PUBLIC.to_owned()];
        note.cc = vec![followers];
        note.published = record
            .value
            .get("createdAt")
            .and_then(|created_at| created_at.as_str())
            .map(str::to_owned);
        note.url = Some(atproto::bsky_post_url(identifier, &at_uri.rkey));

        let create = Create::of_note(note.clone());

        Ok(Some(Converted {
            object: ApObject::Note(note),
            activity: Some(ApActivity::Create(create)),
        }))
    }

    async fn to_record(
        &self,
        ctx: &FederationContext,
        identifier: &str,
        object: &ApObject,
        opts: ToRecordOpts<'_>,
    ) -> anyhow::Result<Option<PreparedRecord>> {
        let ApObject::Note(note) = object;

        let (html, lang) = extract_language(note);
        if html.trim().is_empty() {
            return Ok(None);
        }

        let parsed = richtext::parse(&html, lang.as_deref());
        let text = truncate_text(&parsed.text);

        let created_at = match note.published.clone() {
            Some(published) => published,
            None => OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| String::new()),
        };

        let mut value = serde_json::json!({
            "$type": POST_COLLECTION,
            "text": text,
            "createdAt": created_at,
        });

        if !parsed.langs.is_empty() {
            value["langs"] = serde_json::to_value(&parsed.langs)?;
        }

        if !parsed.facets.is_empty() {
            value["facets"] = serde_json::to_value(&parsed.facets)?;
        }

        let reply = match opts.reply {
            Some(reply) => Some(reply),
            None => note
                .in_reply_to
                .as_deref()
                .and_then(|target| ctx.parse_object_uri(target))
                .map(|parent_uri| ReplyRef {
                    // The parent is also used as the thread root; nested
                    // chains would need the parent record's own root.
                    root: RecordRef {
                        uri: parent_uri.clone(),
                        cid: String::new(),
                    },
                    parent: RecordRef {
                        uri: parent_uri,
                        cid: String::new(),
                    },
                }),
        };

        if let Some(reply) = reply {
            value["reply"] = serde_json::to_value(&reply)?;
        }

        if let Some(uploader) = opts.uploader
            && !note.attachment.is_empty()
        {
            let mediator = BlobMediator::new(ctx.client().clone(), ctx.conf().allow_private_address);
            let uploaded = mediator.download(&note.attachment, uploader).await;

            if let Some(embed) = build_embed(&uploaded)? {
                value["embed"] = embed;
            }
        }

        let cid = atproto::record_cid(&value)?;
        let rkey = Tid::now();
        let uri = AtUri::new(identifier, POST_COLLECTION, rkey.as_str()).to_string();

        Ok(Some(PreparedRecord { uri, cid, value }))
    }
}

/// Splits a Note's content into HTML plus its language tag, preferring the
/// language-tagged variant when one exists.
pub fn extract_language(note: &Note) -> (String, Option<String>) {
    if let Some(map) = &note.content_map
        && let Some((lang, html)) = map.iter().next()
    {
        return (html.clone(), Some(lang.clone()));
    }

    (note.content.clone().unwrap_or_default(), None)
}

/// Caps text to [`MAX_TEXT_BYTES`] UTF-8 bytes, splicing `...` over the tail
/// when something had to go.
fn truncate_text(text: &str) -> String {
    if text.len() <= MAX_TEXT_BYTES {
        return text.to_owned();
    }

    let mut end = MAX_TEXT_BYTES - 3;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &text[..end])
}

/// Renders a record embed into Note attachments.
fn embed_documents(ctx: &FederationContext, identifier: &str, embed: Option<&serde_json::Value>) -> Vec<Document> {
    let Some(embed) = embed else {
        return Vec::new();
    };

    match embed.get("$type").and_then(|kind| kind.as_str()) {
        Some(IMAGES_EMBED) => embed
            .get("images")
            .and_then(|images| images.as_array())
            .map(|images| {
                images
                    .iter()
                    .filter_map(|image| {
                        let blob = image.get("image")?;
                        let mut document = blob_document(ctx, identifier, blob)?;
                        document.name = image.get("alt").and_then(|alt| alt.as_str()).map(str::to_owned);
                        if let Some(ratio) = image.get("aspectRatio") {
                            document.width = ratio.get("width").and_then(|w| w.as_u64()).and_then(|w| u32::try_from(w).ok());
                            document.height =
                                ratio.get("height").and_then(|h| h.as_u64()).and_then(|h| u32::try_from(h).ok());
                        }
                        Some(document)
                    })
                    .collect()
            })
            .unwrap_or_default(),
        Some(VIDEO_EMBED) => embed
            .get("video")
            .and_then(|blob| {
                let mut document = blob_document(ctx, identifier, blob)?;
                document.name = embed.get("alt").and_then(|alt| alt.as_str()).map(str::to_owned);
                Some(document)
            })
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn blob_document(ctx: &FederationContext, identifier: &str, blob: &serde_json::Value) -> Option<Document> {
    let cid = blob.pointer("/ref/$link").and_then(|link| link.as_str())?;
    let mime_type = blob.get("mimeType").and_then(|mime| mime.as_str());

    Some(Document::new(
        ctx.pds().get_blob_url(identifier, cid),
        mime_type.map(str::to_owned),
        None,
    ))
}

/// Assembles an images (preferred) or video embed from uploaded attachments.
fn build_embed(uploaded: &[UploadedAttachment]) -> anyhow::Result<Option<serde_json::Value>> {
    let images: Vec<&UploadedAttachment> = uploaded
        .iter()
        .filter(|attachment| attachment.blob.mime_type.starts_with("image/"))
        .take(MAX_EMBED_IMAGES)
        .collect();

    if !images.is_empty() {
        let images = images
            .into_iter()
            .map(|attachment| {
                let mut image = serde_json::json!({
                    "image": serde_json::to_value(&attachment.blob)?,
                    "alt": attachment.alt.clone().unwrap_or_default(),
                });
                if let (Some(width), Some(height)) = (attachment.width, attachment.height) {
                    image["aspectRatio"] = serde_json::json!({"width": width, "height": height});
                }
                Ok(image)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        return Ok(Some(serde_json::json!({
            "$type": IMAGES_EMBED,
            "images": images,
        })));
    }

    let video = uploaded
        .iter()
        .find(|attachment| attachment.blob.mime_type.starts_with("video/"));

    match video {
        Some(video) => Ok(Some(serde_json::json!({
            "$type": VIDEO_EMBED,
            "video": serde_json::to_value(&video.blob)?,
        }))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn post_record(uri: &str, value: serde_json::Value) -> RecordEnvelope {
        RecordEnvelope {
            uri: uri.to_owned(),
            cid: Some("bafyreiparent".to_owned()),
            value,
        }
    }

    #[tokio::test]
    async fn post_becomes_public_note_with_create() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let record = post_record(
            "at://did:plc:alice/app.bsky.feed.post/abc",
            serde_json::json!({
                "$type": "app.bsky.feed.post",
                "text": "Hello",
                "createdAt": "2024-01-15T12:00:00Z",
            }),
        );

        let converted = PostConverter
            .to_activity_pub(&ctx, "did:plc:alice", &record)
            .await
            .unwrap()
            .expect("post converts");

        let ApObject::Note(note) = &converted.object;
        assert_eq!(note.content.as_deref(), Some("<p>Hello</p>"));
        assert_eq!(note.to, vec![PUBLIC.to_owned()]);
        assert_eq!(
            note.cc,
            vec!["https://bridge.example/users/did:plc:alice/followers".to_owned()]
        );
        assert_eq!(
            note.url.as_deref(),
            Some("https://bsky.app/profile/did:plc:alice/post/abc")
        );
        assert_eq!(note.published.as_deref(), Some("2024-01-15T12:00:00Z"));
        assert!(note.replies.as_ref().is_some_and(|replies| replies.id.ends_with("/replies")));

        let Some(ApActivity::Create(create)) = &converted.activity else {
            panic!("expected a Create activity");
        };
        assert_eq!(create.id, format!("{}#activity", note.id));
        assert_eq!(create.to, note.to);
        assert_eq!(create.cc, note.cc);
    }

    #[tokio::test]
    async fn reply_parent_uses_post_mapping_when_present() {
        let (ctx, store) = test_support::federation_context_with_store().await;

        store
            .create_post_mapping(
                "at://did:plc:alice/app.bsky.feed.post/parent",
                "https://m.example/users/a/statuses/42",
            )
            .await
            .unwrap();

        let record = post_record(
            "at://did:plc:alice/app.bsky.feed.post/child",
            serde_json::json!({
                "text": "replying",
                "createdAt": "2024-01-15T12:00:00Z",
                "reply": {
                    "parent": {"uri": "at://did:plc:alice/app.bsky.feed.post/parent", "cid": "bafy1"},
                    "root": {"uri": "at://did:plc:alice/app.bsky.feed.post/parent", "cid": "bafy1"},
                },
            }),
        );

        let converted = PostConverter
            .to_activity_pub(&ctx, "did:plc:alice", &record)
            .await
            .unwrap()
            .expect("post converts");

        let ApObject::Note(note) = &converted.object;
        assert_eq!(note.in_reply_to.as_deref(), Some("https://m.example/users/a/statuses/42"));
    }

    #[tokio::test]
    async fn reply_parent_falls_back_to_minted_object_uri() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let record = post_record(
            "at://did:plc:alice/app.bsky.feed.post/child",
            serde_json::json!({
                "text": "replying",
                "createdAt": "2024-01-15T12:00:00Z",
                "reply": {
                    "parent": {"uri": "at://did:plc:bob/app.bsky.feed.post/parent", "cid": "bafy1"},
                    "root": {"uri": "at://did:plc:bob/app.bsky.feed.post/parent", "cid": "bafy1"},
                },
            }),
        );

        let converted = PostConverter
            .to_activity_pub(&ctx, "did:plc:alice", &record)
            .await
            .unwrap()
            .expect("post converts");

        let ApObject::Note(note) = &converted.object;
        assert_eq!(
            note.in_reply_to.as_deref(),
            Some(ctx.object_uri("at://did:plc:bob/app.bsky.feed.post/parent").as_str())
        );
    }

    #[tokio::test]
    async fn langs_emit_content_map_variants() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let record = post_record(
            "at://did:plc:alice/app.bsky.feed.post/abc",
            serde_json::json!({
                "text": "hej världen",
                "createdAt": "2024-01-15T12:00:00Z",
                "langs": ["sv"],
            }),
        );

        let converted = PostConverter
            .to_activity_pub(&ctx, "did:plc:alice", &record)
            .await
            .unwrap()
            .expect("post converts");

        let ApObject::Note(note) = &converted.object;
        let content_map = note.content_map.as_ref().expect("contentMap present");
        assert_eq!(content_map.get("sv").map(String::as_str), Some("<p>hej världen</p>"));
    }

    #[tokio::test]
    async fn image_embed_becomes_documents() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let record = post_record(
            "at://did:plc:alice/app.bsky.feed.post/abc",
            serde_json::json!({
                "text": "with a picture",
                "createdAt": "2024-01-15T12:00:00Z",
                "embed": {
                    "$type": "app.bsky.embed.images",
                    "images": [{
                        "image": {"$type": "blob", "ref": {"$link": "bafkreiimg"}, "mimeType": "image/png", "size": 512},
                        "alt": "a cat",
                        "aspectRatio": {"width": 640, "height": 480},
                    }],
                },
            }),
        );

        let converted = PostConverter
            .to_activity_pub(&ctx, "did:plc:alice", &record)
            .await
            .unwrap()
            .expect("post converts");

        let ApObject::Note(note) = &converted.object;
        assert_eq!(note.attachment.len(), 1);
        assert_eq!(note.attachment[0].media_type.as_deref(), Some("image/png"));
        assert_eq!(note.attachment[0].name.as_deref(), Some("a cat"));
        assert_eq!(note.attachment[0].width, Some(640));
        assert!(note.attachment[0].url.contains("com.atproto.sync.getBlob"));
        assert!(note.attachment[0].url.contains("bafkreiimg"));
    }

    #[tokio::test]
    async fn note_without_content_is_rejected() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let note = Note::new(
            "https://m.example/notes/1".to_owned(),
            "https://m.example/users/a".to_owned(),
        );

        let prepared = PostConverter
            .to_record(&ctx, "did:plc:bridge", &ApObject::Note(note), ToRecordOpts::default())
            .await
            .unwrap();

        assert!(prepared.is_none());
    }

    #[tokio::test]
    async fn note_roundtrip_preserves_plain_text() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let record = post_record(
            "at://did:plc:alice/app.bsky.feed.post/abc",
            serde_json::json!({
                "text": "plain text\n\nwith paragraphs",
                "createdAt": "2024-01-15T12:00:00Z",
            }),
        );

        let converted = PostConverter
            .to_activity_pub(&ctx, "did:plc:alice", &record)
            .await
            .unwrap()
            .expect("post converts");

        let prepared = PostConverter
            .to_record(&ctx, "did:plc:alice", &converted.object, ToRecordOpts::default())
            .await
            .unwrap()
            .expect("note converts back");

        assert_eq!(
            prepared.value["text"].as_str(),
            Some("plain text\n\nwith paragraphs")
        );
        assert!(prepared.uri.starts_with("at://did:plc:alice/app.bsky.feed.post/"));
        assert!(prepared.cid.starts_with('b'));
    }

    #[tokio::test]
    async fn long_notes_are_truncated_to_3000_bytes() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let mut note = Note::new(
            "https://m.example/notes/1".to_owned(),
            "https://m.example/users/a".to_owned(),
        );
        note.content = Some(format!("<p>{}</p>", "ö".repeat(2400)));

        let prepared = PostConverter
            .to_record(&ctx, "did:plc:bridge", &ApObject::Note(note), ToRecordOpts::default())
            .await
            .unwrap()
            .expect("note converts");

        let text = prepared.value["text"].as_str().unwrap();
        assert!(text.len() <= MAX_TEXT_BYTES);
        assert!(text.ends_with("..."));
    }

    #[tokio::test]
    async fn reply_target_path_builds_reply_ref() {
        let (ctx, _store) = test_support::federation_context_with_store().await;

        let mut note = Note::new(
            "https://m.example/notes/1".to_owned(),
            "https://m.example/users/a".to_owned(),
        );
        note.content = Some("<p>Hi!</p>".to_owned());
        note.in_reply_to = Some("/posts/at://did:plc:alice/app.bsky.feed.post/abc".to_owned());

        let prepared = PostConverter
            .to_record(&ctx, "did:plc:bridge", &ApObject::Note(note), ToRecordOpts::default())
            .await
            .unwrap()
            .expect("note converts");

        assert_eq!(
            prepared.value.pointer("/reply/parent/uri").and_then(|uri| uri.as_str()),
            Some("at://did:plc:alice/app.bsky.feed.post/abc")
        );
        // Root is hard-wired to the parent in this path.
        assert_eq!(
            prepared.value.pointer("/reply/root/uri"),
            prepared.value.pointer("/reply/parent/uri").cloned().as_ref()
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ä".repeat(2000);
        let truncated = truncate_text(&text);

        assert!(truncated.len() <= MAX_TEXT_BYTES);
        assert!(truncated.ends_with("..."));

        // Short text is untouched.
        assert_eq!(truncate_text("short"), "short");
    }

    #[test]
    fn language_extraction_prefers_content_map() {
        let mut note = Note::new("id".to_owned(), "actor".to_owned());
        note.content = Some("<p>untagged</p>".to_owned());

        assert_eq!(extract_language(&note), ("<p>untagged</p>".to_owned(), None));

        note.content_map = Some([("sv".to_owned(), "<p>taggad</p>".to_owned())].into_iter().collect());
        assert_eq!(
            extract_language(&note),
            ("<p>taggad</p>".to_owned(), Some("sv".to_owned()))
        );
    }
}
