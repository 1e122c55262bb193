use axum::Json;

const HOMEPAGE: &str = "https://github.com/skybridge-dev/skybridge";

/// `GET /nodeinfo/2.1`.
///
/// Usage counters are zero: the PDS surface available to the bridge has no
/// account-enumeration endpoint.
pub(super) async fn get_nodeinfo() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": "2.1",
        "software": {
            "name": "skybridge",
            "version": env!("CARGO_PKG_VERSION"),
            "homepage": HOMEPAGE,
            "repository": HOMEPAGE,
        },
        "protocols": ["activitypub"],
        "services": {"inbound": [], "outbound": []},
        "openRegistrations": false,
        "usage": {
            "users": {"total": 0},
            "localPosts": 0,
            "localComments": 0,
        },
        "metadata": {},
    }))
}
