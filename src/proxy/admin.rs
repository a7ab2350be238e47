//! Per-client rate limit administration under `/ratelimit/:client_id`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

use super::ReverseProxy;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::ratelimit::{AdmissionController, UserLimits};

#[derive(Debug, Serialize)]
pub struct LimitsView {
    pub client_id: String,
    pub rate: f64,
    pub burst: u32,
    /// False when the client inherits the defaults
    pub custom: bool,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            timestamp: chrono::Utc::now(),
        }
    }
}

fn limiter(proxy: &ReverseProxy) -> ProxyResult<&Arc<AdmissionController>> {
    proxy
        .limiter()
        .ok_or_else(|| ProxyError::NotFound("rate limiter is disabled".to_string()))
}

fn view(limiter: &AdmissionController, client_id: String) -> LimitsView {
    let limits = limiter.get_user_limits(&client_id);
    LimitsView {
        custom: limiter.has_user_limits(&client_id),
        client_id,
        rate: limits.rate,
        burst: limits.burst,
    }
}

fn body(payload: Result<Json<UserLimits>, JsonRejection>) -> ProxyResult<UserLimits> {
    payload
        .map(|Json(limits)| limits)
        .map_err(|rejection| ProxyError::BadRequest(rejection.body_text()))
}

pub async fn get_limits(
    State(proxy): State<Arc<ReverseProxy>>,
    Path(client_id): Path<String>,
) -> ProxyResult<impl IntoResponse> {
    let limiter = limiter(&proxy)?;
    Ok(Json(ApiResponse::success(view(limiter, client_id))))
}

pub async fn create_limits(
    State(proxy): State<Arc<ReverseProxy>>,
    Path(client_id): Path<String>,
    payload: Result<Json<UserLimits>, JsonRejection>,
) -> ProxyResult<impl IntoResponse> {
    let limiter = limiter(&proxy)?;
    limiter.create_user_limits(&client_id, body(payload)?)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(view(limiter, client_id)))))
}

pub async fn update_limits(
    State(proxy): State<Arc<ReverseProxy>>,
    Path(client_id): Path<String>,
    payload: Result<Json<UserLimits>, JsonRejection>,
) -> ProxyResult<impl IntoResponse> {
    let limiter = limiter(&proxy)?;
    limiter.replace_user_limits(&client_id, body(payload)?)?;
    Ok(Json(ApiResponse::success(view(limiter, client_id))))
}

pub async fn delete_limits(
    State(proxy): State<Arc<ReverseProxy>>,
    Path(client_id): Path<String>,
) -> ProxyResult<StatusCode> {
    limiter(&proxy)?.remove_user_limits(&client_id)?;
    Ok(StatusCode::NO_CONTENT)
}
