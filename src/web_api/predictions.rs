use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};

use crate::{
    make_paths,
    prediction::{CreatePrediction, Limit},
    store::model::{as_utc, NewPrediction, Prediction},
};

use super::{ApiError, ApiState, ErrorBody, RouterBuild};

const ADMIN_KEY_HEADER: &str = "x-admin-key";

pub fn build(state: ApiState) -> RouterBuild {
    let routes = Router::new()
        .route(
            "/predictions",
            get(list_predictions)
                .post(create_prediction)
                .delete(delete_predictions),
        )
        .with_state(state);

    let schemas = vec![
        CreatePrediction::schema(),
        Prediction::schema(),
        Created::schema(),
        Listing::schema(),
        Deleted::schema(),
    ];

    let paths = make_paths!(
        __path_create_prediction,
        __path_list_predictions,
        __path_delete_predictions
    );

    (routes, schemas, paths)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct Created {
    ok: bool,
    id: i32,
    #[serde(serialize_with = "as_utc")]
    created_at: NaiveDateTime,
}

#[derive(Debug, Serialize, ToSchema)]
struct Listing {
    ok: bool,
    /// Newest first
    results: Vec<Prediction>,
}

#[derive(Debug, Serialize, ToSchema)]
struct Deleted {
    ok: bool,
    deleted: bool,
    /// Number of predictions removed
    count: usize,
}

#[utoipa::path(
    post,
    path = "/api/predictions",
    responses(
        (status = 201, description = "Stored the prediction", body = Created),
        (status = 400, description = "A field failed validation", body = ErrorBody),
        (status = 413, description = "Body larger than 10KiB", body = ErrorBody),
        (status = 500, description = "Store failure", body = ErrorBody)
    ),
    request_body = CreatePrediction
)]
async fn create_prediction(
    State(state): State<ApiState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let Json(body) = payload?;
    let prediction = NewPrediction::try_from(CreatePrediction::from_body(body)?)?;

    let stored = state.store.insert(prediction).await?;
    info!("Stored prediction {} ({})", stored.id, stored.name);

    Ok((
        StatusCode::CREATED,
        Json(Created {
            ok: true,
            id: stored.id,
            created_at: stored.created_at,
        }),
    ))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ListQuery {
    /// Page size, clamped to 1..=200, defaults to 50
    limit: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/predictions",
    responses(
        (status = 200, description = "Latest predictions, newest first", body = Listing),
        (status = 500, description = "Store failure", body = ErrorBody)
    ),
    params(ListQuery)
)]
async fn list_predictions(
    State(state): State<ApiState>,
    query: Option<Query<ListQuery>>,
) -> Result<Json<Listing>, ApiError> {
    let limit = Limit::parse(query.as_ref().and_then(|Query(q)| q.limit.as_deref()));
    let results = state.store.latest(limit.value()).await?;
    Ok(Json(Listing { ok: true, results }))
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
struct DeleteQuery {
    /// Admin secret, used when the header is absent
    admin_key: Option<String>,
}

/// The header wins over the query parameter. Without a configured secret everyone passes.
fn authorize(
    expected: Option<&str>,
    headers: &HeaderMap,
    query: Option<&DeleteQuery>,
) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .or_else(|| query.and_then(|q| q.admin_key.as_deref()));

    if provided != Some(expected) {
        warn!("Refused to delete predictions, admin key missing or wrong");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

#[utoipa::path(
    delete,
    path = "/api/predictions",
    responses(
        (status = 200, description = "Removed every prediction", body = Deleted),
        (status = 403, description = "Admin key missing or wrong", body = ErrorBody),
        (status = 500, description = "Store failure", body = ErrorBody)
    ),
    params(
        DeleteQuery,
        ("x-admin-key" = Option<String>, Header, description = "Admin secret"),
    )
)]
async fn delete_predictions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    query: Option<Query<DeleteQuery>>,
) -> Result<Json<Deleted>, ApiError> {
    authorize(
        state.admin_key.as_deref(),
        &headers,
        query.as_ref().map(|Query(q)| q),
    )?;

    let count = state.store.delete_all().await?;
    info!("Deleted {count} predictions");
    Ok(Json(Deleted {
        ok: true,
        deleted: true,
        count,
    }))
}
