// Request-trial handler
//
// POST body -> identifier -> TrialGrantService -> TrialResponse

use std::net::SocketAddr;

use axum::{
    extract::{rejection::BytesRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use tracing::{debug, error, warn};

use super::AppState;
use crate::error::{TrialError, TrialResponse};
use crate::models::trial::{format_timestamp, TrialDecision};
use crate::trial::{RequestOrigin, TrialRequestBody};

pub const MSG_GRANTED: &str = "Trial access granted for 24 hours.";
pub const MSG_ALREADY_ACTIVE: &str = "Trial already active for this client.";

/// POST /api/request-trial
pub async fn handle_request_trial(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let expose = state.expose_error_details;
    match request_trial(&state, peer.map(|ConnectInfo(addr)| addr), &headers, body).await {
        Ok(decision) => decision_response(&decision),
        Err(e) => {
            match &e {
                TrialError::Configuration(reason) => {
                    error!("[Trial] Refusing request, store not configured: {}", reason)
                }
                TrialError::InvalidInput(reason) => debug!("[Trial] Rejected request: {}", reason),
                _ => {}
            }
            e.to_response(expose)
        }
    }
}

/// Any method other than POST on the trial paths.
pub async fn handle_method_not_allowed() -> Response {
    TrialError::MethodNotAllowed.into_response()
}

async fn request_trial(
    state: &AppState,
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<TrialDecision, TrialError> {
    // Configuration is checked before the body is even looked at
    let service = state.trials.service()?;

    let raw = body.map_err(body_rejection)?;
    let body = parse_body(&raw)?;
    let origin = RequestOrigin::from_parts(headers, peer);
    let identifier = state.identifier_source.derive(&body, &origin)?;

    service.request_trial(&identifier, state.now()).await
}

/// Body extraction failures still answer with a `TrialResponse`.
fn body_rejection(rejection: BytesRejection) -> TrialError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("[Trial] Rejected oversized body");
        TrialError::PayloadTooLarge
    } else {
        TrialError::InvalidInput(format!(
            "Failed to read request body: {}",
            rejection.body_text()
        ))
    }
}

/// Empty body reads as `{}`; anything else must be a JSON object.
pub fn parse_body(raw: &[u8]) -> Result<TrialRequestBody, TrialError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(TrialRequestBody::default());
    }

    let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| {
        warn!("[Trial] Malformed JSON body: {}", e);
        TrialError::InvalidInput("Invalid JSON body.".to_string())
    })?;
    if !value.is_object() {
        return Err(TrialError::InvalidInput(
            "Request body must be a JSON object.".to_string(),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| TrialError::InvalidInput(format!("Invalid request body: {}", e)))
}

fn decision_response(decision: &TrialDecision) -> Response {
    let (success, message) = match decision {
        TrialDecision::Granted { .. } => (true, MSG_GRANTED),
        TrialDecision::AlreadyActive { .. } => (false, MSG_ALREADY_ACTIVE),
    };
    let body = TrialResponse {
        success,
        message: message.to_string(),
        expires_at: Some(format_timestamp(&decision.expires_at())),
        error_details: None,
    };
    (StatusCode::OK, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use crate::server::handlers::ServiceSlot;
    use crate::trial::service::tests::{ts, ScriptedStore};
    use crate::trial::{IdentifierSource, TrialGrantService, TrialServiceOptions};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use axum::Router;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tower::ServiceExt;

    const PATH: &str = "/api/request-trial";

    struct Harness {
        store: Arc<ScriptedStore>,
        now: Arc<Mutex<DateTime<Utc>>>,
        router: Router,
    }

    impl Harness {
        fn with_store(store: ScriptedStore, source: IdentifierSource, expose: bool) -> Self {
            let store = Arc::new(store);
            let service = TrialGrantService::new(store.clone(), TrialServiceOptions::default());
            let now = Arc::new(Mutex::new(ts("2024-01-01T00:00:00Z")));
            let clock_now = now.clone();
            let state = AppState::new(ServiceSlot::Ready(Arc::new(service)), source)
                .with_error_details(expose)
                .with_clock(Arc::new(move || *clock_now.lock()));
            Self {
                store,
                now,
                router: build_router(state, 16 * 1024),
            }
        }

        fn new() -> Self {
            Self::with_store(ScriptedStore::default(), IdentifierSource::Hybrid, false)
        }

        fn set_now(&self, raw: &str) {
            *self.now.lock() = ts(raw);
        }

        async fn post(&self, body: &str) -> (StatusCode, TrialResponse) {
            self.send(Method::POST, PATH, body).await
        }

        async fn send(&self, method: Method, path: &str, body: &str) -> (StatusCode, TrialResponse) {
            let request = Request::builder()
                .method(method)
                .uri(path)
                .header("content-type", "application/json")
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                .body(Body::from(body.to_string()))
                .unwrap();
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap())
        }
    }

    // ---- Timeline ----

    #[tokio::test]
    async fn test_trial_timeline() {
        let h = Harness::new();

        let (status, body) = h.post(r#"{"client_id":"abc"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.message, MSG_GRANTED);
        assert_eq!(body.expires_at.as_deref(), Some("2024-01-02T00:00:00.000Z"));

        h.set_now("2024-01-01T12:00:00Z");
        let (status, body) = h.post(r#"{"client_id":"abc"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.success);
        assert_eq!(body.message, MSG_ALREADY_ACTIVE);
        assert_eq!(body.expires_at.as_deref(), Some("2024-01-02T00:00:00.000Z"));

        h.set_now("2024-01-02T00:00:01Z");
        let (status, body) = h.post(r#"{"client_id":"abc"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.expires_at.as_deref(), Some("2024-01-03T00:00:01.000Z"));
    }

    #[tokio::test]
    async fn test_legacy_path_and_user_id_alias() {
        let h = Harness::new();
        let (status, body) = h
            .send(Method::POST, "/.netlify/functions/request-trial", r#"{"userId":"abc"}"#)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert!(h.store.inner.get("abc").is_some());
    }

    #[tokio::test]
    async fn test_hybrid_falls_back_to_forwarded_address() {
        let h = Harness::new();
        let (status, body) = h.post("").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert!(h.store.inner.get("203.0.113.9").is_some());
    }

    // ---- Rejections ----

    #[tokio::test]
    async fn test_missing_client_id_is_400_without_store_calls() {
        let h = Harness::with_store(ScriptedStore::default(), IdentifierSource::ClientId, false);
        let (status, body) = h.post("{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert_eq!(body.message, "client_id is required.");
        assert!(body.expires_at.is_none());
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_non_object_bodies_are_400() {
        let h = Harness::new();
        for raw in ["{not json", "[1,2]", "\"abc\"", r#"{"client_id": 42}"#] {
            let (status, body) = h.post(raw).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {:?}", raw);
            assert!(!body.success);
        }
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_other_methods_are_405() {
        let h = Harness::new();
        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let (status, body) = h.send(method, PATH, "").await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert!(!body.success);
            assert_eq!(body.message, "Method Not Allowed");
        }
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_gets_json_413() {
        let state = AppState::new(
            ServiceSlot::Ready(Arc::new(TrialGrantService::new(
                Arc::new(ScriptedStore::default()),
                TrialServiceOptions::default(),
            ))),
            IdentifierSource::Hybrid,
        );
        let router = build_router(state, 64);
        let big = format!(r#"{{"client_id":"{}"}}"#, "a".repeat(200));
        let request = Request::builder()
            .method(Method::POST)
            .uri(PATH)
            .header("content-type", "application/json")
            .body(Body::from(big))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: TrialResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!body.success);
        assert_eq!(body.message, crate::error::MSG_PAYLOAD_TOO_LARGE);
        assert!(body.expires_at.is_none());
    }

    // ---- Faults ----

    #[tokio::test]
    async fn test_lookup_fault_is_500_without_expiry() {
        let store = ScriptedStore {
            fail_lookup: true,
            ..Default::default()
        };
        let h = Harness::with_store(store, IdentifierSource::Hybrid, false);
        let (status, body) = h.post(r#"{"client_id":"abc"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.success);
        assert_eq!(body.message, crate::error::MSG_INTERNAL);
        assert!(body.expires_at.is_none());
        assert!(body.error_details.is_none());
        assert_eq!(h.store.writes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_diagnostic_mode_echoes_store_cause() {
        let store = ScriptedStore {
            fail_write: true,
            ..Default::default()
        };
        let h = Harness::with_store(store, IdentifierSource::Hybrid, true);
        let (status, body) = h.post(r#"{"client_id":"abc"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.success);
        assert!(body.error_details.unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_misconfigured_store_is_500_before_parsing() {
        let state = AppState::new(
            ServiceSlot::from_result(Err(TrialError::Configuration(
                "SUPABASE_URL is not set".to_string(),
            ))),
            IdentifierSource::Hybrid,
        );
        let router = build_router(state, 1024);
        let request = Request::builder()
            .method(Method::POST)
            .uri(PATH)
            .body(Body::from("{not json"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: TrialResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.message, crate::error::MSG_CONFIGURATION);
        assert!(!String::from_utf8_lossy(&bytes).contains("SUPABASE_URL"));
    }

    #[test]
    fn test_parse_body_whitespace_is_empty_object() {
        let body = parse_body(b"  \n").unwrap();
        assert!(body.client_id.is_none());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let body = parse_body(br#"{"client_id":"abc","extra":true}"#).unwrap();
        assert_eq!(body.client_id.as_deref(), Some("abc"));
    }
}
