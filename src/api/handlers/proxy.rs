//! Pool management handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;
use uuid::Uuid;

use crate::api::server::AppState;
use crate::error::{NestError, Result};
use crate::models::{CreateProxyRequest, Proxy, UpdateProxyRequest};

/// List all proxies
pub async fn list_proxies(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let proxies = state.store.list().await?;
    Ok(Json(proxies))
}

/// Get a single proxy
pub async fn get_proxy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    match state.store.get(id).await? {
        Some(p) => Ok(Json(p)),
        None => Err(NestError::ProxyNotFound { id }),
    }
}

/// Register a new proxy
pub async fn create_proxy(
    State(state): State<AppState>,
    Json(req): Json<CreateProxyRequest>,
) -> Result<impl IntoResponse> {
    if req.address.trim().is_empty() {
        return Err(NestError::InvalidRequest("address is required".to_string()));
    }
    if req.port == 0 {
        return Err(NestError::InvalidRequest(
            "port must be non-zero".to_string(),
        ));
    }

    let mut proxy = Proxy::new(req.address, req.port, req.protocol);
    proxy.username = req.username;
    proxy.password = req.password;
    proxy.tags = req.tags;

    let proxy = state.store.insert(proxy).await?;

    info!(id = %proxy.id, address = %proxy.socket_addr(), "Registered proxy");
    Ok((StatusCode::CREATED, Json(proxy)))
}

/// Update a proxy's connection fields
pub async fn update_proxy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateProxyRequest>,
) -> Result<impl IntoResponse> {
    match state.store.update_fields(id, &req).await? {
        Some(p) => {
            info!(id = %p.id, address = %p.socket_addr(), "Updated proxy");
            Ok(Json(p))
        }
        None => Err(NestError::ProxyNotFound { id }),
    }
}

/// Remove a proxy from the pool
pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    if state.store.delete(id).await? {
        info!(id = %id, "Deleted proxy");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(NestError::ProxyNotFound { id })
    }
}
