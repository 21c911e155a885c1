//! HTTP API for applications.
//!
//! Every route under `/apps/{app_id}` requires the application's key, sent
//! as `Authorization: Bearer <key>` or as the `auth_key` query parameter.

use crate::handlers::AppState;
use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use herald_core::{ChannelKind, PresenceError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("User list is only possible for Presence Channels")]
    NotPresenceChannel,

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::FORBIDDEN,
            ApiError::NotPresenceChannel => StatusCode::BAD_REQUEST,
            ApiError::Presence(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Query routes. Mount them under [`require_app_key`].
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/apps/:app_id/status", get(status_handler))
        .route("/apps/:app_id/channels", get(channels_handler))
        .route("/apps/:app_id/channels/:channel_name", get(channel_handler))
        .route(
            "/apps/:app_id/channels/:channel_name/users",
            get(channel_users_handler),
        )
}

/// Reject requests whose key does not match their application.
pub async fn require_app_key(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = app_id(request.uri().path())
        .zip(request_key(&request, &query))
        .is_some_and(|(app_id, key)| state.config.client_key(app_id) == Some(key));

    if !authorized {
        debug!(path = %request.uri().path(), "Rejected API request");
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}

fn app_id(path: &str) -> Option<&str> {
    path.strip_prefix("/apps/")?
        .split('/')
        .next()
        .filter(|id| !id.is_empty())
}

fn request_key<'a>(request: &'a Request, query: &'a HashMap<String, String>) -> Option<&'a str> {
    if let Some(header) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return Some(header.strip_prefix("Bearer ").unwrap_or(header));
    }

    query.get("auth_key").map(String::as_str)
}

/// Parse the configured extra headers, skipping invalid ones.
pub fn response_headers(headers: &BTreeMap<String, String>) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    warn!(header = %name, "Ignoring invalid response header");
                    None
                }
            }
        })
        .collect()
}

/// Add the configured extra headers to a response.
pub async fn add_headers(
    State(headers): State<Arc<Vec<(HeaderName, HeaderValue)>>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    for (name, value) in headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.router.stats();
    Json(json!({
        "subscription_count": stats.total_subscriptions,
        "connection_count": stats.connection_count,
        "channel_count": stats.channel_count,
        "uptime": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct ChannelsQuery {
    filter_by_prefix: Option<String>,
}

async fn channels_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChannelsQuery>,
) -> Json<Value> {
    let prefix = query.filter_by_prefix.unwrap_or_default();

    let mut channels = Map::new();
    for name in state.router.channel_names() {
        if !name.starts_with(&prefix) {
            continue;
        }
        let subscription_count = state.router.subscriber_count(&name);
        if subscription_count > 0 {
            channels.insert(
                name,
                json!({ "subscription_count": subscription_count, "occupied": true }),
            );
        }
    }

    Json(json!({ "channels": channels }))
}

async fn channel_handler(
    State(state): State<Arc<AppState>>,
    Path((_app_id, channel_name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let subscription_count = state.router.subscriber_count(&channel_name);
    let mut body = json!({
        "subscription_count": subscription_count,
        "occupied": subscription_count > 0,
    });

    if ChannelKind::of(&channel_name).is_presence() {
        let members = state.presence.members(&channel_name).await?;
        body["user_count"] = json!(members.len());
    }

    Ok(Json(body))
}

async fn channel_users_handler(
    State(state): State<Arc<AppState>>,
    Path((_app_id, channel_name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    if !ChannelKind::of(&channel_name).is_presence() {
        return Err(ApiError::NotPresenceChannel);
    }

    let users: Vec<Value> = state
        .presence
        .members(&channel_name)
        .await?
        .into_iter()
        .map(|member| json!({ "id": member.user_id }))
        .collect();

    Ok(Json(json!({ "users": users })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Config};
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use axum::middleware::from_fn_with_state;
    use herald_core::MemoryMemberStore;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let config = Config {
            clients: vec![ClientConfig {
                app_id: "app-1".to_string(),
                key: "secret".to_string(),
            }],
            ..Config::default()
        };
        Arc::new(AppState::new(config, Arc::new(MemoryMemberStore::new())))
    }

    fn app(state: &Arc<AppState>) -> Router {
        routes()
            .with_state(Arc::clone(state))
            .route_layer(from_fn_with_state(Arc::clone(state), require_app_key))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                HttpRequest::get(uri)
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_app_id_from_path() {
        assert_eq!(app_id("/apps/app-1/status"), Some("app-1"));
        assert_eq!(app_id("/apps/app-1"), Some("app-1"));
        assert_eq!(app_id("/apps//status"), None);
        assert_eq!(app_id("/health"), None);
    }

    #[tokio::test]
    async fn test_wrong_key_forbidden() {
        let state = state();

        for request in [
            HttpRequest::get("/apps/app-1/status").body(Body::empty()).unwrap(),
            HttpRequest::get("/apps/app-1/status?auth_key=wrong")
                .body(Body::empty())
                .unwrap(),
            HttpRequest::get("/apps/app-2/status")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        ] {
            let response = app(&state).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body, json!({ "error": "Unauthorized" }));
        }
    }

    #[tokio::test]
    async fn test_query_key_accepted() {
        let state = state();
        let response = app(&state)
            .oneshot(
                HttpRequest::get("/apps/app-1/status?auth_key=secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_channels_listing() {
        let state = state();
        let _inbox = state.router.register("c_1");
        state.router.subscribe("c_1", "orders").unwrap();
        state.router.subscribe("c_1", "private-user.7").unwrap();

        let (status, body) = get_json(app(&state), "/apps/app-1/channels").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["channels"]["orders"]["subscription_count"], 1);
        assert_eq!(body["channels"]["private-user.7"]["occupied"], true);

        let (_, body) = get_json(
            app(&state),
            "/apps/app-1/channels?filter_by_prefix=private-",
        )
        .await;
        let channels = body["channels"].as_object().unwrap();
        assert_eq!(channels.len(), 1);
        assert!(channels.contains_key("private-user.7"));

        let (_, body) = get_json(app(&state), "/apps/app-1/status").await;
        assert_eq!(body["subscription_count"], 2);
        assert_eq!(body["connection_count"], 1);
    }

    #[tokio::test]
    async fn test_presence_channel_users() {
        let state = state();
        for conn in ["c_1", "c_2", "c_3"] {
            let _ = state.router.register(conn);
            state.router.subscribe(conn, "presence-room").unwrap();
        }
        for (conn, user) in [("c_1", 1), ("c_2", 1), ("c_3", 2)] {
            state
                .presence
                .join(
                    "presence-room",
                    conn,
                    Some(json!(user)),
                    Some(json!({ "name": format!("user-{user}") })),
                )
                .await
                .unwrap();
        }

        let (status, body) = get_json(app(&state), "/apps/app-1/channels/presence-room").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscription_count"], 3);
        assert_eq!(body["user_count"], 2);

        let (status, body) =
            get_json(app(&state), "/apps/app-1/channels/presence-room/users").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "users": [{ "id": 2 }, { "id": 1 }] }));
    }

    #[tokio::test]
    async fn test_users_of_public_channel_rejected() {
        let state = state();
        let (status, body) = get_json(app(&state), "/apps/app-1/channels/orders/users").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({ "error": "User list is only possible for Presence Channels" })
        );
    }

    #[tokio::test]
    async fn test_configured_headers_added() {
        let mut configured = BTreeMap::new();
        configured.insert("Access-Control-Allow-Origin".to_string(), "*".to_string());
        configured.insert("bad header".to_string(), "x".to_string());
        let headers = Arc::new(response_headers(&configured));
        assert_eq!(headers.len(), 1);

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .layer(from_fn_with_state(headers, add_headers));
        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            HeaderValue::from_static("*")
        );
    }
}
