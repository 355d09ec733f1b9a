//! HTTP surfaces (spec.md §6 "External interfaces").
//!
//! Two independent [`axum::Router`]s share one [`state::AppState`]: the
//! object/render surface (bound to `PORT`) and the admin surface (bound to
//! `ADMIN_PORT`), matching the teacher's separate admin listener.

pub mod admin;
pub mod error_response;
pub mod middleware;
pub mod object;
pub mod render;
pub mod state;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::http::state::AppState;

/// The object/render surface routed against `PORT`.
pub fn object_router(state: AppState) -> Router {
    Router::new()
        .route("/object/sign/{bucket}", post(object::sign_batch))
        .route("/object/sign/{bucket}/{*key}", get(object::read_signed).post(object::sign_single))
        .route("/object/authenticated/{bucket}/{*key}", get(object::read_authenticated).head(object::head_authenticated))
        .route("/object/public/{bucket}/{*key}", get(object::read_public).head(object::head_public))
        .route("/object/copy", post(object::copy_object))
        .route("/object/move", post(object::move_object))
        .route("/object/list/{bucket}", post(object::list_objects))
        .route("/object/{bucket}", delete(object::delete_many))
        .route(
            "/object/{bucket}/{*key}",
            post(object::upload_object).put(object::replace_object).delete(object::delete_object),
        )
        .route("/render/authenticated/{bucket}/{*key}", get(render::render_authenticated))
        .route("/render/public/{bucket}/{*key}", get(render::render_public))
        .with_state(state)
}

/// The admin surface routed against `ADMIN_PORT`, gated on `apikey` rather
/// than a tenant session (spec.md §6 "Admin surface (separate port)").
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/tenants", get(admin::list_tenants).post(admin::create_tenant))
        .route(
            "/tenants/{tenant_id}",
            get(admin::get_tenant).patch(admin::patch_tenant).delete(admin::delete_tenant),
        )
        .route("/tenants/{tenant_id}/health", get(admin::tenant_health))
        .with_state(state)
}
