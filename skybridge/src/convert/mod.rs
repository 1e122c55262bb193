//! Collection-keyed bidirectional converters between AT-Protocol records and
//! ActivityPub objects.

pub mod blobs;
pub mod post;
pub mod richtext;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::federation::FederationContext;
use crate::federation::vocab::{Create, Delete, Note};
use crate::pds::RecordEnvelope;

use self::blobs::BlobUploader;

/// Object-side of a conversion; one variant per supported object type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApObject {
    Note(Note),
}

/// Activity-side of a conversion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApActivity {
    Create(Create),
    Delete(Delete),
}

/// A record rendered into the ActivityPub vocabulary.
#[derive(Clone, Debug)]
pub struct Converted {
    pub object: ApObject,
    /// The activity announcing the object, when the record maps to one.
    pub activity: Option<ApActivity>,
}

/// A Note rendered into a record, ready for `createRecord`.
#[derive(Clone, Debug)]
pub struct PreparedRecord {
    pub uri: String,
    pub cid: String,
    pub value: serde_json::Value,
}

/// Strong reference to a record, as embedded in reply refs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordRef {
    pub uri: String,
    /// May be empty when the referenced record's CID is unknown; the relaxed
    /// form is kept rather than resolved synchronously.
    pub cid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: RecordRef,
    pub parent: RecordRef,
}

/// Options for the Note→record direction.
#[derive(Default)]
pub struct ToRecordOpts<'a> {
    /// Destination for downloaded attachments; without one, attachments are
    /// dropped.
    pub uploader: Option<&'a dyn BlobUploader>,
    /// Pre-resolved reply ref, overriding whatever the Note's reply target
    /// would yield.
    pub reply: Option<ReplyRef>,
}

/// A bidirectional converter for one record collection.
#[async_trait]
pub trait RecordConverter: Send + Sync {
    /// Collection NSID this converter handles.
    fn collection(&self) -> &'static str;

    /// Renders a record as an ActivityPub object plus its announcing
    /// activity. `None` means the record has no federated rendition.
    async fn to_activity_pub(
        &self,
        ctx: &FederationContext,
        identifier: &str,
        record: &RecordEnvelope,
    ) -> anyhow::Result<Option<Converted>>;

    /// Renders an ActivityPub object as a record owned by `identifier`.
    /// `None` means the object cannot be represented.
    async fn to_record(
        &self,
        ctx: &FederationContext,
        identifier: &str,
        object: &ApObject,
        opts: ToRecordOpts<'_>,
    ) -> anyhow::Result<Option<PreparedRecord>>;
}

/// Registry mapping collection NSIDs to converters; populated at startup
/// only.
pub struct ConverterRegistry {
    converters: HashMap<&'static str, Arc<dyn RecordConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            converters: HashMap::new(),
        };

        registry.register(Arc::new(post::PostConverter));

        registry
    }

    fn register(&mut self, converter: Arc<dyn RecordConverter>) {
        self.converters.insert(converter.collection(), converter);
    }

    pub fn get(&self, collection: &str) -> Option<&Arc<dyn RecordConverter>> {
        self.converters.get(collection)
    }

    /// Registered collection NSIDs, in stable order.
    pub fn collections(&self) -> Vec<&'static str> {
        let mut collections: Vec<_> = self.converters.keys().copied().collect();
        collections.sort_unstable();
        collections
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_post_collection() {
        let registry = ConverterRegistry::new();

        assert!(registry.get(crate::atproto::POST_COLLECTION).is_some());
        assert!(registry.get("app.bsky.graph.follow").is_none());
        assert_eq!(registry.collections(), vec![crate::atproto::POST_COLLECTION]);
    }
}
