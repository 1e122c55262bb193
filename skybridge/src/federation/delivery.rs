//! Signing and sending outgoing activities to remote inboxes.

use std::collections::HashSet;
use std::time::SystemTime;

use anyhow::Context as _;
use base64::Engine as _;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use url::Url;

use crate::http::ACTIVITY_CONTENT_TYPE;

use super::FederationContext;
use super::keys;
use super::vocab::WithContext;

/// One remote recipient: actor id plus resolved inbox URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboxTarget {
    pub id: String,
    pub inbox: String,
}

/// Where an activity should go.
pub enum DeliveryTargets {
    /// Every follower of the given local identifier.
    FollowersOf(String),
    /// An explicit recipient list.
    Inboxes(Vec<InboxTarget>),
}

/// All info needed to send one activity to one inbox.
struct SendActivityTask<'a> {
    key_id: &'a str,
    activity: &'a [u8],
    inbox: Url,
    private_key: &'a RsaPrivateKey,
}

impl FederationContext {
    /// Signs `activity` with the identifier's RSA key and fans it out to the
    /// targets. Per-inbox failures are logged, never propagated: one dead
    /// server must not block the rest of the fan-out.
    pub async fn send_activity<A: Serialize>(
        &self,
        identifier: &str,
        targets: DeliveryTargets,
        activity: &A,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&WithContext::new(activity)).context("failed to serialize activity")?;

        let actor_keys = self.ensure_key_pairs(identifier).await?;
        let private_key = keys::import_rsa_private(&actor_keys.rsa.private_jwk)?;
        let key_id = format!("{}#main-key", self.actor_uri(identifier));

        let inboxes = match targets {
            DeliveryTargets::FollowersOf(user_did) => self.expand_followers(&user_did).await?,
            DeliveryTargets::Inboxes(inboxes) => inboxes,
        };

        let mut seen = HashSet::new();
        let deliveries = inboxes
            .into_iter()
            .filter(|target| seen.insert(target.inbox.clone()))
            .map(|target| {
                let key_id = key_id.as_str();
                let body = body.as_slice();
                let private_key = &private_key;

                async move {
                    let result = async {
                        let inbox = Url::parse(&target.inbox)
                            .with_context(|| format!("invalid inbox URL: {}", target.inbox))?;
                        self.check_url(&inbox)?;

                        let task = SendActivityTask {
                            key_id,
                            activity: body,
                            inbox,
                            private_key,
                        };
                        task.sign_and_send(self.client()).await
                    }
                    .await;

                    if let Err(error) = result {
                        warn!(
                            error = format!("{error:#}"),
                            inbox = %target.inbox,
                            "Failed to deliver activity"
                        );
                    }
                }
            })
            .collect::<Vec<_>>();

        futures::future::join_all(deliveries).await;

        Ok(())
    }

    /// Resolves the followers collection of a local user into inbox targets.
    async fn expand_followers(&self, user_did: &str) -> anyhow::Result<Vec<InboxTarget>> {
        const PAGE_SIZE: usize = 100;

        let mut targets = Vec::new();
        let mut cursor = None;

        loop {
            let page = self.store().get_follows(user_did, cursor, PAGE_SIZE).await?;

            targets.extend(page.follows.into_iter().map(|follow| InboxTarget {
                id: follow.actor_uri,
                inbox: follow.actor_inbox,
            }));

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(targets)
    }
}

impl SendActivityTask<'_> {
    async fn sign_and_send(&self, client: &reqwest::Client) -> anyhow::Result<()> {
        let host = host_with_port(&self.inbox)?;
        let date = httpdate::fmt_http_date(SystemTime::now());
        let digest = format!(
            "SHA-256={}",
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(self.activity))
        );

        let signature = build_signature_header(
            self.key_id,
            self.inbox.path(),
            &host,
            &date,
            &digest,
            self.private_key,
        )?;

        let response = client
            .post(self.inbox.clone())
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)
            .header(reqwest::header::HOST, host)
            .header(reqwest::header::DATE, date)
            .header("Digest", digest)
            .header("Signature", signature)
            .body(self.activity.to_vec())
            .send()
            .await
            .context("delivery request failed")?;

        match response.status() {
            status if status.is_success() => {
                debug!(inbox = %self.inbox, "Activity delivered");
                Ok(())
            }
            status if status.is_client_error() => {
                // The recipient rejected the activity; retrying won't help.
                debug!(inbox = %self.inbox, %status, "Activity rejected");
                Ok(())
            }
            status => anyhow::bail!("delivery to {} failed with status {status}", self.inbox),
        }
    }
}

/// Draft-cavage HTTP signature over `(request-target) host date digest`.
fn build_signature_header(
    key_id: &str,
    path: &str,
    host: &str,
    date: &str,
    digest: &str,
    private_key: &RsaPrivateKey,
) -> anyhow::Result<String> {
    let signature_string =
        format!("(request-target): post {path}\nhost: {host}\ndate: {date}\ndigest: {digest}");

    let signature = keys::sign_rsa_sha256(private_key, signature_string.as_bytes())?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(signature);

    Ok(format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date digest\",signature=\"{encoded}\""
    ))
}

fn host_with_port(url: &Url) -> anyhow::Result<String> {
    let host = url.host_str().context("inbox URL has no host")?;

    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}
