//! Typed HTTP client for the AT-Protocol XRPC surface.

use std::time::Duration;

use base64::Engine as _;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

pub const USER_AGENT: &str = concat!("skybridge/", env!("CARGO_PKG_VERSION"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error codes the upstream uses for missing resources; mapped to `Ok(None)`
/// by the nullable endpoints, matching the 404 contract.
const NOT_FOUND_ERRORS: &[&str] = &["RecordNotFound", "RepoNotFound", "AccountNotFound", "HandleNotFound"];

#[derive(Debug, thiserror::Error)]
pub enum XrpcError {
    /// Transport-level failure; always worth a retry.
    #[error("transport failure")]
    Network(#[from] reqwest::Error),

    /// The upstream answered with a non-success status.
    #[error("XRPC error {status}: {error:?} {message:?}")]
    Status {
        status: StatusCode,
        error: Option<String>,
        message: Option<String>,
    },
}

impl XrpcError {
    /// Network failures and 5xx responses are transient; 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            XrpcError::Network(_) => true,
            XrpcError::Status { status, .. } => status.is_server_error(),
        }
    }

    fn is_not_found(&self) -> bool {
        match self {
            XrpcError::Network(_) => false,
            XrpcError::Status { status, error, .. } => {
                *status == StatusCode::NOT_FOUND
                    || error
                        .as_deref()
                        .is_some_and(|code| NOT_FOUND_ERRORS.contains(&code))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Lexicon blob reference as returned by `uploadBlob` and embedded into
/// records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "$type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub blob_ref: BlobLink,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

impl Blob {
    pub fn cid(&self) -> &str {
        &self.blob_ref.link
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobLink {
    #[serde(rename = "$link")]
    pub link: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecordEnvelope {
    pub uri: String,
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListRecordsPage {
    pub records: Vec<RecordEnvelope>,
    pub cursor: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ListRecordsParams<'a> {
    pub limit: Option<u32>,
    pub reverse: bool,
    pub cursor: Option<&'a str>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AccountView {
    pub did: String,
    pub handle: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_jwt: String,
    pub refresh_jwt: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreatedRecord {
    pub uri: String,
    pub cid: String,
}

/// Basic profile data, fetched from an AppView.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
}

/// XRPC client over a single base URL (a PDS or an AppView).
#[derive(Clone, Debug)]
pub struct PdsClient {
    base_url: Url,
    client: reqwest::Client,
}

impl PdsClient {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn xrpc_url(&self, nsid: &str) -> Result<Url, XrpcError> {
        self.base_url
            .join(&format!("xrpc/{nsid}"))
            .map_err(|_| XrpcError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: Some("InvalidUrl".to_owned()),
                message: Some(format!("cannot build XRPC URL for {nsid}")),
            })
    }

    /// `com.atproto.repo.getRecord`; 404 is `Ok(None)`, never an error.
    pub async fn get_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<Option<RecordEnvelope>, XrpcError> {
        let url = self.xrpc_url("com.atproto.repo.getRecord")?;

        let request = self
            .client
            .get(url)
            .query(&[("repo", repo), ("collection", collection), ("rkey", rkey)]);

        nullable(handle_response(request.send().await?).await)
    }

    /// `com.atproto.repo.listRecords`.
    pub async fn list_records(
        &self,
        repo: &str,
        collection: &str,
        params: ListRecordsParams<'_>,
    ) -> Result<ListRecordsPage, XrpcError> {
        let url = self.xrpc_url("com.atproto.repo.listRecords")?;

        let mut query: Vec<(&str, String)> = vec![
            ("repo", repo.to_owned()),
            ("collection", collection.to_owned()),
        ];
        if let Some(limit) = params.limit {
            query.push(("limit", limit.to_string()));
        }
        if params.reverse {
            query.push(("reverse", "true".to_owned()));
        }
        if let Some(cursor) = params.cursor {
            query.push(("cursor", cursor.to_owned()));
        }

        handle_response(self.client.get(url).query(&query).send().await?).await
    }

    /// Resolves an account by DID or handle via `com.atproto.repo.describeRepo`.
    pub async fn get_account(&self, did_or_handle: &str) -> Result<Option<AccountView>, XrpcError> {
        let url = self.xrpc_url("com.atproto.repo.describeRepo")?;

        let request = self.client.get(url).query(&[("repo", did_or_handle)]);

        nullable(handle_response(request.send().await?).await)
    }

    /// `com.atproto.identity.resolveHandle`; unknown handles are `Ok(None)`.
    pub async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, XrpcError> {
        #[derive(Deserialize)]
        struct Resolved {
            did: String,
        }

        let url = self.xrpc_url("com.atproto.identity.resolveHandle")?;

        let request = self.client.get(url).query(&[("handle", handle)]);

        let resolved: Option<Resolved> = nullable(handle_response(request.send().await?).await)?;
        Ok(resolved.map(|resolved| resolved.did))
    }

    /// `app.bsky.actor.getProfile`, typically against an AppView.
    pub async fn get_profile(&self, actor: &str) -> Result<Option<ProfileView>, XrpcError> {
        let url = self.xrpc_url("app.bsky.actor.getProfile")?;

        let request = self.client.get(url).query(&[("actor", actor)]);

        nullable(handle_response(request.send().await?).await)
    }

    /// `com.atproto.repo.createRecord` on behalf of an authenticated repo.
    pub async fn create_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: Option<&str>,
        record: &serde_json::Value,
        access_jwt: &str,
    ) -> Result<CreatedRecord, XrpcError> {
        #[derive(Serialize)]
        struct CreateRecordRequest<'a> {
            repo: &'a str,
            collection: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            rkey: Option<&'a str>,
            record: &'a serde_json::Value,
        }

        let url = self.xrpc_url("com.atproto.repo.createRecord")?;

        let request = self
            .client
            .post(url)
            .bearer_auth(access_jwt)
            .json(&CreateRecordRequest {
                repo,
                collection,
                rkey,
                record,
            });

        handle_response(request.send().await?).await
    }

    /// `com.atproto.repo.uploadBlob`; returns the content-addressed ref.
    pub async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str, access_jwt: &str) -> Result<Blob, XrpcError> {
        #[derive(Deserialize)]
        struct UploadBlobResponse {
            blob: Blob,
        }

        let url = self.xrpc_url("com.atproto.repo.uploadBlob")?;

        let request = self
            .client
            .post(url)
            .bearer_auth(access_jwt)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes);

        let response: UploadBlobResponse = handle_response(request.send().await?).await?;
        Ok(response.blob)
    }

    /// `com.atproto.server.createSession`.
    pub async fn create_session(&self, identifier: &str, password: &str) -> Result<Session, XrpcError> {
        #[derive(Serialize)]
        struct CreateSessionRequest<'a> {
            identifier: &'a str,
            password: &'a str,
        }

        let url = self.xrpc_url("com.atproto.server.createSession")?;

        let request = self.client.post(url).json(&CreateSessionRequest { identifier, password });

        handle_response(request.send().await?).await
    }

    /// `com.atproto.server.refreshSession`, authenticated with the refresh
    /// token.
    pub async fn refresh_session(&self, refresh_jwt: &str) -> Result<TokenPair, XrpcError> {
        let url = self.xrpc_url("com.atproto.server.refreshSession")?;

        let request = self.client.post(url).bearer_auth(refresh_jwt);

        handle_response(request.send().await?).await
    }

    /// `com.atproto.server.createInviteCode` with admin credentials.
    pub async fn create_invite_code(&self, admin_token: &str) -> Result<String, XrpcError> {
        #[derive(Serialize)]
        struct CreateInviteCodeRequest {
            #[serde(rename = "useCount")]
            use_count: u32,
        }

        #[derive(Deserialize)]
        struct CreateInviteCodeResponse {
            code: String,
        }

        let url = self.xrpc_url("com.atproto.server.createInviteCode")?;

        let credentials = base64::engine::general_purpose::STANDARD.encode(format!("admin:{admin_token}"));

        let request = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {credentials}"))
            .json(&CreateInviteCodeRequest { use_count: 1 });

        let response: CreateInviteCodeResponse = handle_response(request.send().await?).await?;
        Ok(response.code)
    }

    /// `com.atproto.server.createAccount`.
    pub async fn create_account(
        &self,
        handle: &str,
        password: &str,
        invite_code: Option<&str>,
    ) -> Result<Session, XrpcError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct CreateAccountRequest<'a> {
            handle: &'a str,
            password: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            invite_code: Option<&'a str>,
        }

        let url = self.xrpc_url("com.atproto.server.createAccount")?;

        let request = self.client.post(url).json(&CreateAccountRequest {
            handle,
            password,
            invite_code,
        });

        handle_response(request.send().await?).await
    }

    /// Pure URL synthesis for a blob served by the PDS; performs no I/O.
    pub fn get_blob_url(&self, did: &str, cid: &str) -> String {
        format!(
            "{}xrpc/com.atproto.sync.getBlob?did={did}&cid={cid}",
            ensure_trailing_slash(self.base_url.as_str())
        )
    }
}

fn ensure_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_owned()
    } else {
        format!("{base}/")
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, XrpcError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.json::<XrpcErrorBody>().await.unwrap_or(XrpcErrorBody {
        error: None,
        message: None,
    });

    Err(XrpcError::Status {
        status,
        error: body.error,
        message: body.message,
    })
}

/// Collapses the upstream's not-found responses into `Ok(None)`.
fn nullable<T>(result: Result<T, XrpcError>) -> Result<Option<T>, XrpcError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.is_not_found() => Ok(None),
        Err(error) => Err(error),
    }
}
