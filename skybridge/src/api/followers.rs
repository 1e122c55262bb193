use axum::extract::{Path, Query, State};

use crate::BridgeState;
use crate::federation::vocab::{OrderedCollection, OrderedCollectionPage, WithContext};
use crate::http::{ActivityJson, ApiError};

#[derive(Debug, serde::Deserialize)]
pub(super) struct FollowersParams {
    #[serde(default)]
    page: Option<bool>,
    /// Opaque cursor: the `created_at` of the previous page's last row.
    #[serde(default)]
    cursor: Option<i64>,
}

const PAGE_SIZE: usize = 50;

pub(super) async fn get_followers(
    State(state): State<BridgeState>,
    Path(identifier): Path<String>,
    Query(params): Query<FollowersParams>,
) -> Result<ActivityJson<serde_json::Value>, ApiError> {
    let followers_uri = state.federation.followers_uri(&identifier);

    if params.page != Some(true) {
        let total_items = state
            .store
            .get_follows_count(&identifier)
            .await
            .map_err(ApiError::internal)?;

        let collection = OrderedCollection {
            kind: "OrderedCollection".to_owned(),
            id: followers_uri.clone(),
            total_items,
            first: Some(format!("{followers_uri}?page=true")),
            ordered_items: None,
        };

        let value = serde_json::to_value(WithContext::new(collection)).map_err(ApiError::internal)?;
        return Ok(ActivityJson(value));
    }

    let page = state
        .store
        .get_follows(&identifier, params.cursor, PAGE_SIZE)
        .await
        .map_err(ApiError::internal)?;

    let ordered_items = page
        .follows
        .into_iter()
        .map(|follow| {
            serde_json::json!({
                "id": follow.actor_uri,
                "inbox": follow.actor_inbox,
            })
        })
        .collect();

    let id = match params.cursor {
        Some(cursor) => format!("{followers_uri}?page=true&cursor={cursor}"),
        None => format!("{followers_uri}?page=true"),
    };

    let collection_page = OrderedCollectionPage {
        kind: "OrderedCollectionPage".to_owned(),
        id,
        part_of: Some(followers_uri.clone()),
        next: page
            .next_cursor
            .map(|cursor| format!("{followers_uri}?page=true&cursor={cursor}")),
        ordered_items,
    };

    let value = serde_json::to_value(WithContext::new(collection_page)).map_err(ApiError::internal)?;
    Ok(ActivityJson(value))
}
