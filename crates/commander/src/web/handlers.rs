use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use common::Mission;
use tracing::warn;

use super::types::*;
use crate::error::MissionError;
use crate::metrics::Metrics;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

pub async fn api_missions_submit(
    State(state): State<WebState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::invalid_json(e.body_text()))?;
    let mission_id = state
        .dispatcher
        .submit(request.payload, &request.target_worker)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { mission_id })))
}

pub async fn api_missions_list(State(state): State<WebState>) -> Json<Vec<Mission>> {
    Json(state.dispatcher.list_all().await)
}

pub async fn api_missions_get(
    State(state): State<WebState>,
    Path(mission_id): Path<String>,
) -> Result<Json<Mission>, ApiError> {
    Ok(Json(state.dispatcher.lookup(&mission_id).await?))
}

pub async fn api_missions_history(
    State(state): State<WebState>,
    Path(mission_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let events = state.dispatcher.history(&mission_id).await?;
    Ok(Json(HistoryResponse { mission_id, events }))
}

pub async fn api_refresh_token(
    State(state): State<WebState>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, ApiError> {
    let secret = header_value(&headers, SECRET_HEADER);
    let soldier = header_value(&headers, SOLDIER_HEADER);
    match state.authority.rotate(soldier, secret).await {
        Ok(token) => {
            Metrics::inc(&state.metrics.tokens_rotated_total);
            Ok(Json(TokenResponse { token }))
        }
        Err(MissionError::Forbidden) => {
            warn!(soldier=%soldier, "token rotation refused: bad secret");
            Metrics::inc(&state.metrics.rotations_forbidden_total);
            Err(MissionError::Forbidden.into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn api_soldier_token(
    State(state): State<WebState>,
    Path(soldier): Path<String>,
) -> Result<Json<DigestResponse>, ApiError> {
    let token = state.authority.digest_of(&soldier).await?;
    Ok(Json(DigestResponse { soldier, token }))
}

pub async fn api_metrics(State(state): State<WebState>) -> impl IntoResponse {
    let tracked = state.ledger.mission_count().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(tracked),
    )
}

pub async fn fallback() -> ApiError {
    MissionError::NotFound("no such route".to_string()).into()
}
