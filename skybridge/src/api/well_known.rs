//! `/.well-known` discovery endpoints.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::BridgeState;
use crate::http::ApiError;

const JRD_CONTENT_TYPE: &str = "application/jrd+json";

#[derive(Debug, serde::Deserialize)]
pub(super) struct WebfingerParams {
    resource: String,
}

#[derive(Debug, serde::Serialize)]
struct WebfingerLink {
    rel: &'static str,
    #[serde(rename = "type")]
    media_type: &'static str,
    href: String,
}

#[derive(Debug, serde::Serialize)]
struct WebfingerResponse {
    subject: String,
    aliases: Vec<String>,
    links: Vec<WebfingerLink>,
}

/// `GET /.well-known/webfinger?resource=acct:user@host`.
pub(super) async fn get_webfinger(
    State(state): State<BridgeState>,
    Query(params): Query<WebfingerParams>,
) -> Result<Response, ApiError> {
    let conf = state.conf_handle.get_conf();

    let actor_uri = match params.resource.strip_prefix("acct:") {
        Some(acct) => {
            let (username, host) = acct
                .split_once('@')
                .ok_or_else(|| ApiError::bad_request("malformed acct resource"))?;

            let our_host = conf.public_url.host_str().unwrap_or(conf.hostname.as_str());
            if host != our_host {
                return Err(ApiError::not_found("unknown host"));
            }

            let did = if username.starts_with("did:") {
                username.to_owned()
            } else {
                // Local usernames map onto PDS handles: user → user.{pds host}.
                let handle = format!("{username}.{}", conf.pds_hostname);
                state
                    .pds
                    .resolve_handle(&handle)
                    .await
                    .map_err(ApiError::internal)?
                    .ok_or_else(|| ApiError::not_found("unknown account"))?
            };

            state.federation.actor_uri(&did)
        }
        // Accept a raw actor URI as resource too.
        None => {
            let identifier = state
                .federation
                .parse_actor_uri(&params.resource)
                .ok_or_else(|| ApiError::not_found("unknown resource"))?;
            state.federation.actor_uri(&identifier)
        }
    };

    let body = WebfingerResponse {
        subject: params.resource,
        aliases: vec![actor_uri.clone()],
        links: vec![WebfingerLink {
            rel: "self",
            media_type: crate::http::ACTIVITY_CONTENT_TYPE,
            href: actor_uri,
        }],
    };

    Ok(([(header::CONTENT_TYPE, JRD_CONTENT_TYPE)], Json(body)).into_response())
}

/// `GET /.well-known/nodeinfo`: link to the NodeInfo document.
pub(super) async fn get_nodeinfo_discovery(State(state): State<BridgeState>) -> Json<serde_json::Value> {
    let base = state
        .conf_handle
        .get_conf()
        .public_url
        .as_str()
        .trim_end_matches('/')
        .to_owned();

    Json(serde_json::json!({
        "links": [{
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
            "href": format!("{base}/nodeinfo/2.1"),
        }],
    }))
}
