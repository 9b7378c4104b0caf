use std::{any::Any, collections::btree_map::Entry, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::error;
use utoipa::{
    openapi::{Components, PathItem, RefOr, Schema},
    OpenApi, ToSchema,
};

use crate::{config::CorsOrigin, prediction::InvalidInput, store::Store, store::StoreError};

use self::rate_limit::RateLimiter;

mod middleware;
mod predictions;
pub mod rate_limit;

/// Request bodies larger than this are answered with 413
pub const BODY_LIMIT: usize = 10 * 1024;

#[derive(Clone)]
pub struct ApiState {
    store: Store,
    /// When set, bulk delete requires this exact secret
    admin_key: Option<Arc<str>>,
}

type RouterBuild = (
    Router,
    Vec<(&'static str, RefOr<Schema>)>,
    Vec<(String, PathItem)>,
);

#[macro_export]
macro_rules! make_paths {
    ($($path:tt),*) => {
        {
            use utoipa::Path;
            vec![
                $(
                    (
                        $path::path(),
                        $path::path_item(None)
                    ),
                )*
            ]
        }
    };
}

/// Builds the full application: `/api` routes, the JSON fallback and the middleware stack
pub fn get_api_router(
    store: Store,
    admin_key: Option<String>,
    cors_origin: &CorsOrigin,
    limiter: RateLimiter,
) -> Router {
    #[derive(OpenApi)]
    #[openapi(
        paths(health),
        components(schemas(Health, ErrorBody)),
        tags(
            (name = "crate", description = "Prediction board API")
        )
    )]
    struct ApiDoc;

    let mut openapi = ApiDoc::openapi();

    let state = ApiState {
        store,
        admin_key: admin_key.map(Arc::from),
    };
    let predictions = predictions::build(state);

    // several methods share one path, so operations are merged rather than replaced
    for (path, item) in predictions.2 {
        match openapi.paths.paths.entry(path) {
            Entry::Occupied(mut existing) => existing.get_mut().operations.extend(item.operations),
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }
    }
    let components = openapi.components.get_or_insert_with(Components::new);
    for s in predictions.1 {
        components.schemas.insert(s.0.to_owned(), s.1);
    }

    let openapi = Arc::new(openapi);
    let api = Router::new()
        .route("/health", get(health))
        .route(
            "/openapi.json",
            get(move || {
                let openapi = openapi.clone();
                async move { Json(openapi.as_ref().clone()) }
            }),
        )
        .merge(predictions.0);

    let router = Router::new()
        .nest("/api", api)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(axum::middleware::from_fn_with_state(
            Arc::new(limiter),
            rate_limit::limit,
        ))
        .layer(middleware::cors(cors_origin));

    middleware::security_headers(router)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
}

#[derive(Debug, Serialize, ToSchema)]
struct Health {
    ok: bool,
    /// Current server time, RFC3339
    time: String,
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is up", body = Health)
    )
)]
async fn health() -> Json<Health> {
    Json(Health {
        ok: true,
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    ApiError::InternalError(format!("Handler panicked: {detail}")).into_response()
}

/// Body of every non-2xx response
#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
    /// Offending request field, only for validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    InvalidInput(#[from] InvalidInput),
    #[error("Forbidden")]
    Forbidden,
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Too many requests, please try again later.")]
    RateLimited,
    #[error("Not found")]
    NotFound,
    #[error("Internal server error {0}")]
    InternalError(String),
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        ApiError::InternalError(value.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        if value.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::InvalidInput(InvalidInput("body"))
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, field) = match &self {
            ApiError::InvalidInput(InvalidInput(field)) => (StatusCode::BAD_REQUEST, Some(*field)),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, None),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, None),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, None),
            ApiError::InternalError(detail) => {
                // the cause stays in the logs, callers only get a generic message
                error!("{detail}");
                let body = ErrorBody {
                    error: "Server error".to_owned(),
                    field: None,
                };
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
        };

        let body = ErrorBody {
            error: self.to_string(),
            field: field.map(str::to_owned),
        };
        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod test {
    use color_eyre::eyre::Result;
    use rstest::rstest;
    use serde_json::Value;

    use crate::testing::{server, TestServer};

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn health_reports_time(#[future] server: TestServer) -> Result<()> {
        let server = server.await;
        let res = server.client.get(server.url("/api/health")).send().await?;
        assert_eq!(res.status(), StatusCode::OK.as_u16());

        let body: Value = res.json().await?;
        assert_eq!(body["ok"], true);
        let time = body["time"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_routes_get_json_404(#[future] server: TestServer) -> Result<()> {
        let server = server.await;
        let res = server.client.get(server.url("/api/nope")).send().await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND.as_u16());
        let body: Value = res.json().await?;
        assert_eq!(body["error"], "Not found");
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn security_headers_on_every_response(#[future] server: TestServer) -> Result<()> {
        let server = server.await;
        for path in ["/api/health", "/missing"] {
            let res = server.client.get(server.url(path)).send().await?;
            let headers = res.headers();
            assert_eq!(headers["x-content-type-options"], "nosniff");
            assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
            assert_eq!(headers["referrer-policy"], "no-referrer");
            assert!(headers.contains_key("content-security-policy"));
            assert!(headers.contains_key("strict-transport-security"));
        }
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn cors_allows_any_origin_by_default(#[future] server: TestServer) -> Result<()> {
        let server = server.await;
        let res = server
            .client
            .get(server.url("/api/health"))
            .header("origin", "https://example.com")
            .send()
            .await?;
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn openapi_lists_every_operation(#[future] server: TestServer) -> Result<()> {
        let server = server.await;
        let doc: Value = server
            .client
            .get(server.url("/api/openapi.json"))
            .send()
            .await?
            .json()
            .await?;

        let predictions = &doc["paths"]["/api/predictions"];
        for method in ["get", "post", "delete"] {
            assert!(predictions.get(method).is_some(), "missing {method}");
        }
        assert!(doc["paths"]["/api/health"].get("get").is_some());
        assert!(doc["components"]["schemas"].get("Prediction").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak() -> Result<()> {
        let res = ApiError::InternalError("disk on fire at /var/db".to_owned()).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await?;
        assert!(!String::from_utf8_lossy(&bytes).contains("disk on fire"));
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body, serde_json::json!({ "error": "Server error" }));
        Ok(())
    }

    #[tokio::test]
    async fn panics_become_generic_500() -> Result<()> {
        let res = panic_response(Box::new("boom"));
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body, serde_json::json!({ "error": "Server error" }));
        Ok(())
    }
}
