//! Remote media download with size caps, and upload to the PDS.

use async_trait::async_trait;
use url::Url;

use crate::federation::vocab::Document;
use crate::pds::Blob;

/// Hard ceiling on a single downloaded blob.
pub const MAX_BLOB_BYTES: u64 = 10 * 1024 * 1024;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Anything able to turn raw bytes into a content-addressed PDS blob; in
/// practice a bridge account manager.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str) -> anyhow::Result<Blob>;
}

/// A downloaded-and-uploaded attachment ready to embed into a record.
#[derive(Clone, Debug)]
pub struct UploadedAttachment {
    pub blob: Blob,
    pub alt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Downloads Note attachments and re-uploads them to the PDS.
///
/// Attachments are fetched one by one (N is small per note). Oversize and
/// failing downloads produce a skipped entry, never an error; callers
/// tolerate the length mismatch.
pub struct BlobMediator {
    client: reqwest::Client,
    allow_private_address: bool,
}

impl BlobMediator {
    pub fn new(client: reqwest::Client, allow_private_address: bool) -> Self {
        Self {
            client,
            allow_private_address,
        }
    }

    pub async fn download(
        &self,
        attachments: &[Document],
        uploader: &dyn BlobUploader,
    ) -> Vec<UploadedAttachment> {
        let mut uploaded = Vec::new();

        for attachment in attachments {
            let Some((bytes, mime_type)) = self
                .fetch_capped(&attachment.url, attachment.media_type.as_deref())
                .await
            else {
                continue;
            };

            match uploader.upload_blob(bytes, &mime_type).await {
                Ok(blob) => uploaded.push(UploadedAttachment {
                    blob,
                    alt: attachment.name.clone(),
                    width: attachment.width,
                    height: attachment.height,
                }),
                Err(error) => {
                    warn!(error = format!("{error:#}"), url = %attachment.url, "Failed to upload blob");
                }
            }
        }

        uploaded
    }

    /// Fetches a remote resource, giving up quietly on failures and on
    /// bodies past [`MAX_BLOB_BYTES`].
    ///
    /// The `Content-Length` header is checked before the body is read; bodies
    /// without the header are still capped while streaming.
    pub async fn fetch_capped(&self, url: &str, mime_hint: Option<&str>) -> Option<(Vec<u8>, String)> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, %url, "Skipping attachment with invalid URL");
                return None;
            }
        };

        if !self.allow_private_address && !matches!(parsed.scheme(), "http" | "https") {
            warn!(%url, "Skipping attachment with unsupported scheme");
            return None;
        }

        let mut response = match self.client.get(parsed).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(error = format!("{error:#}"), %url, "Attachment download failed");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), %url, "Skipping attachment with non-success response");
            return None;
        }

        if let Some(length) = response.content_length()
            && length > MAX_BLOB_BYTES
        {
            warn!(length, %url, "Skipping oversize attachment");
            return None;
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_owned())
            .or_else(|| mime_hint.map(str::to_owned))
            .unwrap_or_else(|| FALLBACK_MIME.to_owned());

        let mut bytes = Vec::new();

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    bytes.extend_from_slice(&chunk);

                    if bytes.len() as u64 > MAX_BLOB_BYTES {
                        warn!(%url, "Skipping attachment whose body exceeded the cap");
                        return None;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(error = format!("{error:#}"), %url, "Attachment body read failed");
                    return None;
                }
            }
        }

        Some((bytes, mime_type))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingUploader {
        uploads: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl BlobUploader for RecordingUploader {
        async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str) -> anyhow::Result<Blob> {
            self.uploads
                .lock()
                .unwrap()
                .push((bytes.len(), mime_type.to_owned()));

            Ok(Blob {
                kind: "blob".to_owned(),
                blob_ref: crate::pds::BlobLink {
                    link: format!("bafkrei-test-{}", bytes.len()),
                },
                mime_type: mime_type.to_owned(),
                size: bytes.len() as u64,
            })
        }
    }

    #[tokio::test]
    async fn invalid_urls_are_skipped_without_upload() {
        let mediator = BlobMediator::new(reqwest::Client::new(), false);
        let uploader = RecordingUploader {
            uploads: Mutex::new(Vec::new()),
        };

        let attachments = vec![
            Document::new("not a url".to_owned(), None, None),
            Document::new("ftp://example.com/file".to_owned(), None, None),
        ];

        let uploaded = mediator.download(&attachments, &uploader).await;

        assert!(uploaded.is_empty());
        assert!(uploader.uploads.lock().unwrap().is_empty());
    }
}
