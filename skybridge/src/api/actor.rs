use axum::extract::{Path, State};

use crate::BridgeState;
use crate::atproto::{self, PROFILE_COLLECTION};
use crate::federation::keys;
use crate::federation::vocab::{Image, Multikey, Person, PublicKey, WithContext};
use crate::http::{ActivityJson, ApiError};

/// `GET /users/{identifier}`: the actor document for a local account.
pub(super) async fn get_actor(
    State(state): State<BridgeState>,
    Path(identifier): Path<String>,
) -> Result<ActivityJson<WithContext<Person>>, ApiError> {
    if identifier.contains('/') {
        return Err(ApiError::not_found("no such actor"));
    }

    let account = state
        .pds
        .get_account(&identifier)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("no such account"))?;

    let did = account.did;
    let actor_uri = state.federation.actor_uri(&did);

    // Profile data is decoration; a missing or broken record never hides the
    // actor itself.
    let profile = match state.pds.get_record(&did, PROFILE_COLLECTION, "self").await {
        Ok(profile) => profile.map(|record| record.value),
        Err(error) => {
            warn!(error = format!("{error:#}"), %did, "Failed to load profile record");
            None
        }
    };

    let actor_keys = state
        .federation
        .ensure_key_pairs(&did)
        .await
        .map_err(ApiError::internal)?;

    let public_key_pem = keys::rsa_public_pem(&actor_keys.rsa.public_jwk).map_err(ApiError::internal)?;
    let ed25519_multibase =
        keys::ed25519_multibase(&actor_keys.ed25519.public_jwk).map_err(ApiError::internal)?;

    let blob_image = |field: &str| -> Option<Image> {
        let blob = profile.as_ref()?.get(field)?;
        let cid = blob.pointer("/ref/$link")?.as_str()?;
        let mut image = Image::new(state.pds.get_blob_url(&did, cid));
        image.media_type = blob.get("mimeType").and_then(|mime| mime.as_str()).map(str::to_owned);
        Some(image)
    };

    let person = Person {
        kind: "Person".to_owned(),
        id: actor_uri.clone(),
        preferred_username: account
            .handle
            .split('.')
            .next()
            .unwrap_or(account.handle.as_str())
            .to_owned(),
        name: profile
            .as_ref()
            .and_then(|profile| profile.get("displayName"))
            .and_then(|name| name.as_str())
            .map(str::to_owned),
        summary: profile
            .as_ref()
            .and_then(|profile| profile.get("description"))
            .and_then(|description| description.as_str())
            .map(str::to_owned),
        icon: blob_image("avatar"),
        image: blob_image("banner"),
        url: Some(atproto::bsky_profile_url(&did)),
        inbox: state.federation.inbox_uri(&did),
        outbox: state.federation.outbox_uri(&did),
        followers: state.federation.followers_uri(&did),
        following: state.federation.following_uri(&did),
        public_key: PublicKey {
            id: format!("{actor_uri}#main-key"),
            owner: actor_uri.clone(),
            public_key_pem,
        },
        assertion_method: vec![Multikey::new(
            format!("{actor_uri}#ed25519"),
            actor_uri,
            ed25519_multibase,
        )],
    };

    Ok(ActivityJson(WithContext::new(person)))
}
