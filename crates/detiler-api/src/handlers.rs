//! REST API handlers.
//!
//! Each handler calls into `DetilerStore` and returns the JSON body
//! directly. Failures use the `{"success": false, "error": ...}` envelope.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use detiler_core::{
    BoundingBox, CooldownCreationRequest, CooldownQuery, KitMetadata, TileDetailsPayload, TileKey,
    TileParams, TileQuery, UpsertStatus,
};
use detiler_state::StoreError;
use tracing::{error, info};

use crate::ApiState;
use crate::params::QueryParams;

#[derive(serde::Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            error: msg.to_string(),
        }),
    )
        .into_response()
}

fn bad_request(msg: &str) -> Response {
    error_response(msg, StatusCode::BAD_REQUEST)
}

pub fn status_for(e: &StoreError) -> StatusCode {
    match e {
        StoreError::Validation(_) => StatusCode::BAD_REQUEST,
        StoreError::NotFound(_) | StoreError::KitNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) | StoreError::WriteConflict { .. } => StatusCode::CONFLICT,
        StoreError::Upstream(_) | StoreError::Serialize(_) | StoreError::Deserialize(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn store_error(e: StoreError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(error = %e, "store request failed");
    }
    error_response(&e.to_string(), status)
}

fn bbox_param(params: &QueryParams, name: &str) -> Result<Option<BoundingBox>, String> {
    let values: Vec<f64> = params.parse_all(name)?;
    if values.is_empty() {
        return Ok(None);
    }
    BoundingBox::from_slice(&values)
        .map(Some)
        .map_err(|e| e.to_string())
}

fn kits_param(params: &QueryParams) -> Vec<String> {
    params.all("kits").into_iter().map(str::to_string).collect()
}

fn tile_query(params: &QueryParams) -> Result<TileQuery, String> {
    Ok(TileQuery {
        min_zoom: params.require("minZoom")?,
        max_zoom: params.require("maxZoom")?,
        min_state: params.parse("minState")?,
        max_state: params.parse("maxState")?,
        match_current_state_only: params.parse("shouldMatchCurrentState")?.unwrap_or(false),
        kits: kits_param(params),
        area: bbox_param(params, "bbox")?,
        size: params.parse("size")?,
    })
}

fn cooldown_query(params: &QueryParams) -> Result<CooldownQuery, String> {
    Ok(CooldownQuery {
        enabled: params.parse("enabled")?,
        kits: kits_param(params),
        min_zoom: params.parse("minZoom")?,
        max_zoom: params.parse("maxZoom")?,
        area: bbox_param(params, "area")?,
        from: params.parse("from")?,
        size: params.parse("size")?,
    })
}

// ── Kits ───────────────────────────────────────────────────────

/// GET /kits
pub async fn list_kits(State(state): State<ApiState>) -> Response {
    match state.store.kits.list_all() {
        Ok(kits) => Json(kits).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /kits
pub async fn create_kit(
    State(state): State<ApiState>,
    body: Result<Json<KitMetadata>, JsonRejection>,
) -> Response {
    let Json(kit) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    match state.store.kits.register(&kit) {
        Ok(()) => (StatusCode::CREATED, Json(kit)).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Tiles ──────────────────────────────────────────────────────

/// GET /detail
///
/// With `cursor`, only `cursor` and `size` are read.
pub async fn query_tiles(
    State(state): State<ApiState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = QueryParams(pairs);
    let result = if params.contains("cursor") {
        let (cursor, size) = match (params.require::<u64>("cursor"), params.parse::<usize>("size")) {
            (Ok(cursor), Ok(size)) => (cursor, size),
            (Err(msg), _) | (_, Err(msg)) => return bad_request(&msg),
        };
        state.store.tiles.read_cursor(cursor, size)
    } else {
        let query = match tile_query(&params) {
            Ok(query) => query,
            Err(msg) => return bad_request(&msg),
        };
        state.store.tiles.query(&query)
    };
    match result {
        Ok(response) => Json(response).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /detail/{z}/{x}/{y}
pub async fn get_tile_for_kits(
    State(state): State<ApiState>,
    path: Result<Path<(u32, u32, u32)>, PathRejection>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let Path((z, x, y)) = match path {
        Ok(path) => path,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    let tile = TileParams { z, x, y };
    let kits = kits_param(&QueryParams(pairs));
    let result = if kits.is_empty() {
        state.store.tiles.get_all_kits_for_tile(tile)
    } else {
        state.store.tiles.get_by_kits_and_tile(&kits, tile)
    };
    match result {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /detail/{kit}/{z}/{x}/{y}
pub async fn get_tile(
    State(state): State<ApiState>,
    path: Result<Path<(String, u32, u32, u32)>, PathRejection>,
) -> Response {
    let Path((kit, z, x, y)) = match path {
        Ok(path) => path,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    match state.store.tiles.get_by_kit_and_tile(&TileKey::new(kit, z, x, y)) {
        Ok(record) => Json(record).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /detail/{kit}/{z}/{x}/{y}
pub async fn put_tile(
    State(state): State<ApiState>,
    path: Result<Path<(String, u32, u32, u32)>, PathRejection>,
    body: Result<Json<TileDetailsPayload>, JsonRejection>,
) -> Response {
    let Path((kit, z, x, y)) = match path {
        Ok(path) => path,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    let Json(payload) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    match state.store.tiles.upsert(&TileKey::new(kit, z, x, y), &payload) {
        Ok(UpsertStatus::Inserted) => StatusCode::CREATED.into_response(),
        Ok(UpsertStatus::Updated) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error(e),
    }
}

// ── Cooldowns ──────────────────────────────────────────────────

/// GET /cooldown
pub async fn query_cooldowns(
    State(state): State<ApiState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let query = match cooldown_query(&QueryParams(pairs)) {
        Ok(query) => query,
        Err(msg) => return bad_request(&msg),
    };
    match state.store.cooldowns.query(&query) {
        Ok(cooldowns) => Json(cooldowns).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /cooldown
pub async fn create_cooldown(
    State(state): State<ApiState>,
    body: Result<Json<CooldownCreationRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };
    match state.store.cooldowns.create(&request) {
        Ok(key) => {
            info!(%key, "cooldown created via api");
            (StatusCode::CREATED, Json(serde_json::json!({ "key": key }))).into_response()
        }
        Err(e) => store_error(e),
    }
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /liveness
pub async fn liveness(State(state): State<ApiState>) -> Response {
    match state.store.engine.ping() {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => store_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detiler_core::{Outcome, TileRecord};
    use detiler_state::DetilerStore;

    fn test_state() -> ApiState {
        let store = DetilerStore::open_in_memory().unwrap();
        ApiState { store }
    }

    fn pairs(items: &[(&str, &str)]) -> Query<Vec<(String, String)>> {
        Query(
            items
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&StoreError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&StoreError::KitNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&StoreError::WriteConflict { key: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&StoreError::Upstream("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn list_kits_empty() {
        let resp = list_kits(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn create_kit_twice_conflicts() {
        let state = test_state();
        let kit = KitMetadata::new("osm");

        let resp = create_kit(State(state.clone()), Ok(Json(kit.clone()))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = create_kit(State(state), Ok(Json(kit))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("osm"));
    }

    #[tokio::test]
    async fn put_tile_statuses() {
        let state = test_state();
        state.store.kits.register(&KitMetadata::new("osm")).unwrap();
        let path = || Ok(Path(("osm".to_string(), 1, 0, 0)));

        let resp = put_tile(
            State(state.clone()),
            path(),
            Ok(Json(TileDetailsPayload::new(1000))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let payload = TileDetailsPayload::new(2000).with_outcome(Outcome::Rendered);
        let resp = put_tile(State(state.clone()), path(), Ok(Json(payload))).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = get_tile(State(state.clone()), path()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let record: TileRecord = serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(record.render_count, 1);

        let resp = put_tile(
            State(state),
            Ok(Path(("ghost".to_string(), 1, 0, 0))),
            Ok(Json(TileDetailsPayload::new(1))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_missing_tile_is_404() {
        let resp = get_tile(State(test_state()), Ok(Path(("osm".to_string(), 1, 0, 0)))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn query_tiles_requires_zoom() {
        let resp = query_tiles(State(test_state()), pairs(&[("kits", "osm")])).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_tiles_without_kits_is_400() {
        let resp = query_tiles(
            State(test_state()),
            pairs(&[("minZoom", "0"), ("maxZoom", "3")]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_tiles_with_cursor() {
        let state = test_state();
        state.store.kits.register(&KitMetadata::new("osm")).unwrap();
        for x in 0..3 {
            state
                .store
                .tiles
                .upsert(&TileKey::new("osm", 5, x, 0), &TileDetailsPayload::new(1))
                .unwrap();
        }

        let resp = query_tiles(
            State(state.clone()),
            pairs(&[("minZoom", "0"), ("maxZoom", "5"), ("kits[]", "osm"), ("size", "2")]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["tiles"].as_array().unwrap().len(), 2);
        let cursor = body["cursor"].as_u64().unwrap().to_string();

        let resp = query_tiles(State(state), pairs(&[("cursor", cursor.as_str()), ("size", "2")])).await;
        let body = body_json(resp).await;
        assert_eq!(body["tiles"].as_array().unwrap().len(), 1);
        assert!(body.get("cursor").is_none());
    }

    #[tokio::test]
    async fn unknown_cursor_is_404() {
        let resp = query_tiles(State(test_state()), pairs(&[("cursor", "77")])).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tile_for_kits_lookup() {
        let state = test_state();
        for kit in ["a", "b"] {
            state.store.kits.register(&KitMetadata::new(kit)).unwrap();
            state
                .store
                .tiles
                .upsert(&TileKey::new(kit, 2, 1, 1), &TileDetailsPayload::new(1))
                .unwrap();
        }

        let resp = get_tile_for_kits(State(state.clone()), Ok(Path((2, 1, 1))), pairs(&[])).await;
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);

        let resp = get_tile_for_kits(
            State(state),
            Ok(Path((2, 1, 1))),
            pairs(&[("kits", "b"), ("kits", "zzz")]),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["kit"], "b");
    }

    #[tokio::test]
    async fn cooldown_create_and_query() {
        let state = test_state();
        let request: CooldownCreationRequest = serde_json::from_value(serde_json::json!({
            "kits": ["a"],
            "minZoom": 0,
            "maxZoom": 10,
            "enabled": true,
            "duration": 60,
            "area": [1.0, 1.0, 5.0, 5.0]
        }))
        .unwrap();

        let resp = create_cooldown(State(state.clone()), Ok(Json(request))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let key = body_json(resp).await["key"].as_str().unwrap().to_string();
        assert!(key.starts_with("cooldown:"));

        let resp = query_cooldowns(
            State(state.clone()),
            pairs(&[
                ("kits[]", "a"),
                ("area[]", "2"),
                ("area[]", "2"),
                ("area[]", "3"),
                ("area[]", "3"),
            ]),
        )
        .await;
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = query_cooldowns(State(state), pairs(&[("area", "1"), ("area", "2")])).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn liveness_ok() {
        let resp = liveness(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
