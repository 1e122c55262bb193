use axum::extract::{Path, State};

use crate::BridgeState;
use crate::atproto::GRAPH_FOLLOW_COLLECTION;
use crate::federation::vocab::{OrderedCollection, WithContext};
use crate::http::{ActivityJson, ApiError};
use crate::pds::ListRecordsParams;

const FOLLOW_SCAN_LIMIT: u32 = 100;

/// `GET /users/{identifier}/following`: the user's graph follows, filtered
/// to subjects that are local accounts. Remote graph-follows have no
/// ActivityPub equivalent and are omitted.
pub(super) async fn get_following(
    State(state): State<BridgeState>,
    Path(identifier): Path<String>,
) -> Result<ActivityJson<serde_json::Value>, ApiError> {
    let following_uri = state.federation.following_uri(&identifier);

    let records = match state
        .pds
        .list_records(
            &identifier,
            GRAPH_FOLLOW_COLLECTION,
            ListRecordsParams {
                limit: Some(FOLLOW_SCAN_LIMIT),
                ..ListRecordsParams::default()
            },
        )
        .await
    {
        Ok(page) => page.records,
        Err(error) => {
            warn!(error = format!("{error:#}"), %identifier, "Failed to list graph follows");
            Vec::new()
        }
    };

    let mut ordered_items = Vec::new();

    for record in records {
        let Some(subject) = record.value.get("subject").and_then(|subject| subject.as_str()) else {
            continue;
        };

        match state.pds.get_account(subject).await {
            Ok(Some(account)) => {
                ordered_items.push(serde_json::Value::String(state.federation.actor_uri(&account.did)));
            }
            Ok(None) => {}
            Err(error) => {
                warn!(error = format!("{error:#}"), %subject, "Failed to resolve follow subject");
            }
        }
    }

    let collection = OrderedCollection {
        kind: "OrderedCollection".to_owned(),
        id: following_uri,
        total_items: ordered_items.len() as u64,
        first: None,
        ordered_items: Some(ordered_items),
    };

    let value = serde_json::to_value(WithContext::new(collection)).map_err(ApiError::internal)?;
    Ok(ActivityJson(value))
}
