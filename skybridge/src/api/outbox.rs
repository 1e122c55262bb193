use axum::extract::{Path, Query, State};

use crate::BridgeState;
use crate::atproto::AtUri;
use crate::federation::vocab::{OrderedCollectionPage, WithContext};
use crate::http::{ActivityJson, ApiError};
use crate::pds::{ListRecordsParams, RecordEnvelope};

const PAGE_SIZE: usize = 50;

#[derive(Debug, serde::Deserialize)]
pub(super) struct OutboxParams {
    #[serde(default)]
    cursor: Option<String>,
}

/// `GET /users/{identifier}/outbox`: the user's records across every
/// registered collection, rendered as activities, newest first.
pub(super) async fn get_outbox(
    State(state): State<BridgeState>,
    Path(identifier): Path<String>,
    Query(params): Query<OutboxParams>,
) -> Result<ActivityJson<serde_json::Value>, ApiError> {
    let outbox_uri = state.federation.outbox_uri(&identifier);

    let mut merged: Vec<(&'static str, RecordEnvelope)> = Vec::new();
    let mut next_cursor = None;

    for collection in state.registry.collections() {
        let page = match state
            .pds
            .list_records(
                &identifier,
                collection,
                ListRecordsParams {
                    limit: Some(PAGE_SIZE as u32),
                    cursor: params.cursor.as_deref(),
                    ..ListRecordsParams::default()
                },
            )
            .await
        {
            Ok(page) => page,
            Err(error) => {
                warn!(error = format!("{error:#}"), %identifier, %collection, "Failed to list records");
                continue;
            }
        };

        next_cursor = page.cursor.or(next_cursor);
        merged.extend(page.records.into_iter().map(|record| (collection, record)));
    }

    // Record keys are TIDs, so rkey order is creation order.
    merged.sort_by(|(_, a), (_, b)| rkey_of(&b.uri).cmp(&rkey_of(&a.uri)));
    merged.truncate(PAGE_SIZE);

    let mut ordered_items = Vec::new();

    for (collection, record) in merged {
        let Some(converter) = state.registry.get(collection) else {
            continue;
        };

        match converter.to_activity_pub(&state.federation, &identifier, &record).await {
            Ok(Some(converted)) => {
                if let Some(activity) = converted.activity {
                    match serde_json::to_value(&activity) {
                        Ok(value) => ordered_items.push(value),
                        Err(error) => {
                            warn!(%error, uri = %record.uri, "Failed to serialize activity");
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!(error = format!("{error:#}"), uri = %record.uri, "Record conversion failed");
            }
        }
    }

    let page = OrderedCollectionPage {
        kind: "OrderedCollectionPage".to_owned(),
        id: match &params.cursor {
            Some(cursor) => format!("{outbox_uri}?cursor={cursor}"),
            None => outbox_uri.clone(),
        },
        part_of: Some(outbox_uri.clone()),
        next: next_cursor.map(|cursor| format!("{outbox_uri}?cursor={cursor}")),
        ordered_items,
    };

    let value = serde_json::to_value(WithContext::new(page)).map_err(ApiError::internal)?;
    Ok(ActivityJson(value))
}

fn rkey_of(uri: &str) -> String {
    AtUri::parse(uri).map(|at_uri| at_uri.rkey).unwrap_or_default()
}
