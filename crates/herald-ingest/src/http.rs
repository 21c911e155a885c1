//! HTTP push adapter.
//!
//! Producers `POST` a JSON body to `/apps/{app_id}/events`:
//!
//! ```json
//! { "channels": ["orders", "private-user.7"], "name": "OrderShipped",
//!   "data": "{\"id\":5}", "socket_id": "c_12" }
//! ```
//!
//! The adapter only validates and dispatches. Checking the application key
//! is left to the layer the routes are mounted under.

use crate::traits::{DispatchSlot, IngestAdapter, IngestError};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use herald_core::envelope::decode_payload;
use herald_core::{Dispatcher, EventEnvelope};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Route the adapter listens on.
pub const EVENTS_PATH: &str = "/apps/:app_id/events";

const INVALID_EVENT: &str = "Event must include channel, event name and data";

/// Body of a publish request.
#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub socket_id: Option<String>,
}

impl PublishRequest {
    /// Validate the request and build its envelope.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidEvent`] unless a channel, an event name
    /// and data are all present.
    pub fn into_envelope(self) -> Result<EventEnvelope, IngestError> {
        let channels = match (self.channels, self.channel) {
            (Some(channels), _) if !channels.is_empty() => channels,
            (_, Some(channel)) => vec![channel],
            _ => Vec::new(),
        };
        let channels: Vec<String> = channels.into_iter().filter(|c| !c.is_empty()).collect();

        let name = self.name.filter(|n| !n.is_empty());
        let data = self.data.filter(|d| match d {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        });

        let (Some(name), Some(data)) = (name, data) else {
            return Err(IngestError::InvalidEvent(INVALID_EVENT.to_string()));
        };

        EventEnvelope::for_channels(channels, name, decode_payload(data))
            .map(|envelope| envelope.with_origin(self.socket_id))
            .ok_or_else(|| IngestError::InvalidEvent(INVALID_EVENT.to_string()))
    }
}

struct Shared {
    slot: DispatchSlot,
    dev_mode: bool,
}

/// Push listener for events published over HTTP.
pub struct HttpAdapter {
    shared: Arc<Shared>,
}

impl HttpAdapter {
    /// Create a new HTTP adapter. `dev_mode` logs every event at info level.
    #[must_use]
    pub fn new(dev_mode: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: DispatchSlot::default(),
                dev_mode,
            }),
        }
    }

    /// Routes to mount on the server.
    ///
    /// While the adapter is unsubscribed the route answers `404`.
    pub fn routes(&self) -> Router {
        Router::new()
            .route(EVENTS_PATH, post(publish_handler))
            .with_state(Arc::clone(&self.shared))
    }
}

#[async_trait]
impl IngestAdapter for HttpAdapter {
    async fn subscribe(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), IngestError> {
        self.shared.slot.set(dispatcher);
        info!("Listening for http events...");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), IngestError> {
        self.shared.slot.clear();
        info!("Stopped listening for http events");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }

    fn is_subscribed(&self) -> bool {
        self.shared.slot.get().is_some()
    }
}

async fn publish_handler(State(shared): State<Arc<Shared>>, body: Bytes) -> Response {
    let Some(dispatcher) = shared.slot.get() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let request: PublishRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Unparseable event body");
            return bad_request(INVALID_EVENT);
        }
    };

    let envelope = match request.into_envelope() {
        Ok(envelope) => envelope,
        Err(e) => return bad_request(&invalid_message(e)),
    };

    if shared.dev_mode {
        info!(channels = %envelope.channels.join(", "), event = %envelope.event, "HTTP event");
    } else {
        trace!(channels = ?envelope.channels, event = %envelope.event, "HTTP event");
    }

    for (channel, envelope) in envelope.split() {
        dispatcher.dispatch(channel, envelope);
    }

    Json(json!({ "message": "ok" })).into_response()
}

fn invalid_message(error: IngestError) -> String {
    match error {
        IngestError::InvalidEvent(message) => message,
        other => other.to_string(),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    type Seen = Arc<Mutex<Vec<(String, EventEnvelope)>>>;

    async fn subscribed_adapter() -> (HttpAdapter, Seen) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let adapter = HttpAdapter::new(false);
        adapter
            .subscribe(Arc::new(move |channel: String, envelope: EventEnvelope| {
                sink.lock().unwrap().push((channel, envelope));
            }))
            .await
            .unwrap();
        (adapter, seen)
    }

    async fn post_event(adapter: &HttpAdapter, body: Value) -> (StatusCode, Value) {
        let response = adapter
            .routes()
            .oneshot(
                Request::post("/apps/app-1/events")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_missing_data_rejected() {
        let (adapter, seen) = subscribed_adapter().await;

        let (status, body) =
            post_event(&adapter, json!({ "channel": "orders", "name": "OrderShipped" })).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": INVALID_EVENT }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_channels_dispatched_separately() {
        let (adapter, seen) = subscribed_adapter().await;

        let (status, body) = post_event(
            &adapter,
            json!({
                "channels": ["orders", "private-user.7"],
                "name": "OrderShipped",
                "data": "{\"id\":5}",
                "socket_id": "c_12"
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "ok" }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "orders");
        assert_eq!(seen[1].0, "private-user.7");
        assert_eq!(seen[0].1.channels, vec!["orders".to_string()]);
        assert_eq!(seen[1].1.channels, vec!["private-user.7".to_string()]);
        for (_, envelope) in seen.iter() {
            assert_eq!(envelope.event, "OrderShipped");
            assert_eq!(envelope.data, json!({ "id": 5 }));
            assert_eq!(envelope.origin_connection_id.as_deref(), Some("c_12"));
        }
    }

    #[tokio::test]
    async fn test_raw_string_data_kept() {
        let (adapter, seen) = subscribed_adapter().await;

        let (status, _) = post_event(
            &adapter,
            json!({ "channel": "news", "name": "Flash", "data": "plain text" }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen.lock().unwrap()[0].1.data, json!("plain text"));
    }

    #[tokio::test]
    async fn test_unparseable_body_rejected() {
        let (adapter, seen) = subscribed_adapter().await;

        let response = adapter
            .routes()
            .oneshot(
                Request::post("/apps/app-1/events")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_route_not_found() {
        let (adapter, seen) = subscribed_adapter().await;
        adapter.unsubscribe().await.unwrap();
        assert!(!adapter.is_subscribed());

        let (status, _) = post_event(
            &adapter,
            json!({ "channel": "news", "name": "Flash", "data": "x" }),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_channels_take_precedence() {
        let request = PublishRequest {
            channel: Some("single".into()),
            channels: Some(vec!["a".into(), "b".into()]),
            name: Some("e".into()),
            data: Some(json!({})),
            socket_id: None,
        };
        let envelope = request.into_envelope().unwrap();
        assert_eq!(envelope.channels, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_empty_name_rejected() {
        let request = PublishRequest {
            channel: Some("news".into()),
            name: Some(String::new()),
            data: Some(json!({})),
            ..Default::default()
        };
        assert!(matches!(
            request.into_envelope(),
            Err(IngestError::InvalidEvent(_))
        ));
    }
}
