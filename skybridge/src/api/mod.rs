pub mod actor;
pub mod followers;
pub mod following;
pub mod inbox;
pub mod nodeinfo;
pub mod outbox;
pub mod posts;
pub mod well_known;

use crate::BridgeState;

pub fn make_router<S>(state: BridgeState) -> axum::Router<S> {
    axum::Router::new()
        .route("/users/{identifier}", axum::routing::get(actor::get_actor))
        .route("/users/{identifier}/inbox", axum::routing::post(inbox::post_user_inbox))
        .route("/users/{identifier}/outbox", axum::routing::get(outbox::get_outbox))
        .route(
            "/users/{identifier}/followers",
            axum::routing::get(followers::get_followers),
        )
        .route(
            "/users/{identifier}/following",
            axum::routing::get(following::get_following),
        )
        .route("/inbox", axum::routing::post(inbox::post_shared_inbox))
        .route("/posts/{*uri}", axum::routing::get(posts::get_post))
        .route("/.well-known/webfinger", axum::routing::get(well_known::get_webfinger))
        .route("/.well-known/nodeinfo", axum::routing::get(well_known::get_nodeinfo_discovery))
        .route("/nodeinfo/2.1", axum::routing::get(nodeinfo::get_nodeinfo))
        .with_state(state)
}
