//! detiler-api — REST API for detiler.
//!
//! Provides axum route handlers over [`DetilerStore`].
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/kits` | List registered kits |
//! | POST | `/kits` | Register a kit |
//! | GET | `/detail` | Search tiles (cursor paged) |
//! | GET | `/detail/{z}/{x}/{y}` | One tile across kits |
//! | GET | `/detail/{kit}/{z}/{x}/{y}` | One tile of one kit |
//! | PUT | `/detail/{kit}/{z}/{x}/{y}` | Record a processing event |
//! | GET | `/cooldown` | Search cooldowns (offset paged) |
//! | POST | `/cooldown` | Create a cooldown |
//! | GET | `/liveness` | Engine ping |
//!
//! Array query parameters may be repeated as `name=v` or `name[]=v`.

pub mod handlers;
pub mod params;

use axum::Router;
use axum::routing::get;
use detiler_state::DetilerStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: DetilerStore,
}

/// Build the complete API router.
pub fn build_router(store: DetilerStore) -> Router {
    let state = ApiState { store };

    Router::new()
        .route("/kits", get(handlers::list_kits).post(handlers::create_kit))
        .route("/detail", get(handlers::query_tiles))
        .route("/detail/{z}/{x}/{y}", get(handlers::get_tile_for_kits))
        .route(
            "/detail/{kit}/{z}/{x}/{y}",
            get(handlers::get_tile).put(handlers::put_tile),
        )
        .route(
            "/cooldown",
            get(handlers::query_cooldowns).post(handlers::create_cooldown),
        )
        .route("/liveness", get(handlers::liveness))
        .with_state(state)
}
