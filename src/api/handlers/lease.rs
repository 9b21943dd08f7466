//! Lease operation handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::api::server::AppState;
use crate::error::{NestError, Result};
use crate::models::ProxyFilter;

/// Body of a reservation request
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub instance_id: String,
    pub country_code: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub require_healthy: bool,
}

/// Body of a refresh request
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub instance_id: String,
}

/// Query identifying the releasing instance
#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub instance_id: String,
}

/// Reserve a proxy for an instance
pub async fn reserve(
    State(state): State<AppState>,
    Json(req): Json<ReserveRequest>,
) -> Result<impl IntoResponse> {
    if req.instance_id.trim().is_empty() {
        return Err(NestError::InvalidRequest(
            "instance_id is required".to_string(),
        ));
    }

    let filter = ProxyFilter {
        country_code: req.country_code,
        tags: req.tags,
        require_healthy: req.require_healthy,
    };

    let proxy = state.manager.reserve(&req.instance_id, &filter).await?;

    info!(proxy_id = %proxy.id, instance_id = %req.instance_id, "Reserved proxy");
    Ok((StatusCode::CREATED, Json(proxy)))
}

/// Extend an instance's reservation on a proxy
pub async fn refresh(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse> {
    let proxy = state.manager.refresh(id, &req.instance_id).await?;
    Ok(Json(proxy))
}

/// Release one proxy held by an instance
pub async fn release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ReleaseQuery>,
) -> Result<impl IntoResponse> {
    let released = state.manager.release(id, &query.instance_id).await?;

    if released {
        info!(proxy_id = %id, instance_id = %query.instance_id, "Released proxy");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Release every proxy held by an instance
pub async fn release_all(
    State(state): State<AppState>,
    Query(query): Query<ReleaseQuery>,
) -> Result<impl IntoResponse> {
    let released = state.manager.release_all(&query.instance_id).await?;

    info!(
        instance_id = %query.instance_id,
        count = released.len(),
        "Released all proxies for instance"
    );
    Ok(Json(json!({ "released": released })))
}

/// Clear every reservation in the pool
pub async fn reset_all(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let cleared = state.manager.reset_all().await?;

    info!(count = cleared, "Reset all reservations");
    Ok(Json(json!({ "cleared": cleared })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::create_router;
    use crate::lease::{ReservationManager, ReservationManagerConfig};
    use crate::models::{Proxy, ProxyProtocol};
    use crate::store::MemoryProxyStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app_with(proxies: impl IntoIterator<Item = Proxy>) -> (axum::Router, Arc<MemoryProxyStore>) {
        let store = Arc::new(MemoryProxyStore::with_proxies(proxies));
        let manager = Arc::new(ReservationManager::new(
            store.clone(),
            ReservationManagerConfig::default(),
        ));
        let state = AppState::new(store.clone(), manager);
        (create_router(state), store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_returns_created_with_reservation() {
        let proxy = Proxy::new("10.0.0.1", 3128, ProxyProtocol::Http);
        let (app, _store) = app_with([proxy]);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/leases")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instance_id":"worker-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["reservation"]["instance_id"], "worker-1");
        // Credentials never leave the API.
        assert!(body.get("password").is_none());
    }

    #[tokio::test]
    async fn test_reserve_empty_pool_returns_service_unavailable() {
        let (app, _store) = app_with([]);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/leases")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instance_id":"worker-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let proxy = Proxy::new("10.0.0.1", 3128, ProxyProtocol::Http);
        let id = proxy.id;
        let (app, _store) = app_with([proxy]);

        // Releasing an unleased proxy is a no-op, not an error.
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/leases/{}?instance_id=worker-1", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_refresh_without_reservation_is_not_found() {
        let proxy = Proxy::new("10.0.0.1", 3128, ProxyProtocol::Http);
        let id = proxy.id;
        let (app, _store) = app_with([proxy]);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/leases/{}/refresh", id))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instance_id":"worker-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_reports_cleared_count() {
        let proxy = Proxy::new("10.0.0.1", 3128, ProxyProtocol::Http);
        let (app, _store) = app_with([proxy]);

        let reserve = Request::builder()
            .method("POST")
            .uri("/api/leases")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"instance_id":"worker-1"}"#))
            .unwrap();
        let response = app.clone().oneshot(reserve).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let reset = Request::builder()
            .method("POST")
            .uri("/api/leases/reset")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(reset).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cleared"], 1);
    }
}
