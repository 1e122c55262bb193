use axum::extract::{Path, State};

use crate::BridgeState;
use crate::atproto::AtUri;
use crate::convert::ApObject;
use crate::federation::vocab::WithContext;
use crate::http::{ActivityJson, ApiError};

/// `GET /posts/{+uri}`: a single record by URL-encoded AT-URI, rendered as
/// its ActivityPub object.
pub(super) async fn get_post(
    State(state): State<BridgeState>,
    Path(uri): Path<String>,
) -> Result<ActivityJson<WithContext<ApObject>>, ApiError> {
    let at_uri = AtUri::parse(&uri).map_err(|_| ApiError::not_found("not an AT-URI"))?;

    let converter = state
        .registry
        .get(&at_uri.collection)
        .ok_or_else(|| ApiError::not_found("unsupported collection"))?;

    let record = state
        .pds
        .get_record(&at_uri.did, &at_uri.collection, &at_uri.rkey)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("no such record"))?;

    let converted = match converter.to_activity_pub(&state.federation, &at_uri.did, &record).await {
        Ok(Some(converted)) => converted,
        Ok(None) => return Err(ApiError::not_found("record has no federated form")),
        Err(error) => {
            warn!(error = format!("{error:#}"), uri = %record.uri, "Record conversion failed");
            return Err(ApiError::not_found("record has no federated form"));
        }
    };

    Ok(ActivityJson(WithContext::new(converted.object)))
}
