mod handlers;
mod types;

pub use handlers::*;
pub use types::*;

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

pub fn create_app(state: WebState) -> Router {
    Router::new()
        // Missions
        .route("/missions", get(api_missions_list).post(api_missions_submit))
        .route("/missions/:mission_id", get(api_missions_get))
        .route("/missions/:mission_id/history", get(api_missions_history))
        // Token authority
        .route("/auth/refresh_token", post(api_refresh_token))
        .route("/soldiers/:soldier/token", get(api_soldier_token))
        .route("/metrics", get(api_metrics))
        .fallback(fallback)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Serve the commander API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: SocketAddr,
    state: WebState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr=%listener.local_addr()?, "commander API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("commander API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthority;
    use crate::dispatcher::Dispatcher;
    use crate::ledger::MissionLedger;
    use crate::metrics::Metrics;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use common::{Broker, MemoryBroker, Mission, MissionStatus};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "super_secret";

    fn state(broker: MemoryBroker) -> WebState {
        let ledger = Arc::new(MissionLedger::new());
        let metrics = Arc::new(Metrics::new());
        WebState {
            dispatcher: Arc::new(Dispatcher::new(
                "commander1".to_string(),
                Arc::new(broker),
                ledger.clone(),
                metrics.clone(),
            )),
            authority: Arc::new(TokenAuthority::new(SECRET)),
            ledger,
            metrics,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        (status, body.to_vec())
    }

    fn json_post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn refresh_req(secret: Option<&str>, soldier: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/auth/refresh_token");
        if let Some(s) = secret {
            builder = builder.header("X-SECRET", s);
        }
        if let Some(s) = soldier {
            builder = builder.header("X-SOLDIER", s);
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn submit_then_lookup_and_history() {
        let broker = MemoryBroker::new();
        let app = create_app(state(broker.clone()));

        let (status, body) = send(
            &app,
            json_post("/missions", json!({"payload": "scout", "target_worker": "soldier1"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let submitted: SubmitResponse = serde_json::from_slice(&body).unwrap();
        assert!(broker
            .queue_names()
            .await
            .contains(&"orders_commander1_soldier1".to_string()));

        let (status, body) = send(&app, get_req(&format!("/missions/{}", submitted.mission_id))).await;
        assert_eq!(status, StatusCode::OK);
        let mission: Mission = serde_json::from_slice(&body).unwrap();
        assert_eq!(mission.status, MissionStatus::Queued);
        assert_eq!(mission.payload, "scout");

        let (status, body) = send(
            &app,
            get_req(&format!("/missions/{}/history", submitted.mission_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let history: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(history["mission_id"], submitted.mission_id.as_str());
        assert_eq!(history["events"][0]["status"], "QUEUED");
        assert_eq!(history["events"][0]["message"], "Mission received and queued");
        assert!(history["events"][0].get("worker").is_none());

        let (status, body) = send(&app, get_req("/missions")).await;
        assert_eq!(status, StatusCode::OK);
        let all: Vec<Mission> = serde_json::from_slice(&body).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn legacy_target_field_is_accepted() {
        let app = create_app(state(MemoryBroker::new()));
        let (status, _) = send(
            &app,
            json_post("/missions", json!({"payload": "p", "target_soldier": "soldier2"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn submit_errors_map_to_status_codes() {
        let broker = MemoryBroker::new();
        let app = create_app(state(broker.clone()));

        let (status, body) = send(&app, json_post("/missions", json!({"payload": "p"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.code, "validation_error");
        assert!(broker.queue_names().await.is_empty());

        let req = Request::builder()
            .method("POST")
            .uri("/missions")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.code, "invalid_json");
    }

    #[tokio::test]
    async fn unknown_mission_is_404() {
        let app = create_app(state(MemoryBroker::new()));
        let (status, body) = send(&app, get_req("/missions/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.code, "not_found");
        let (status, _) = send(&app, get_req("/missions/nope/history")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn refresh_token_checks_secret_then_soldier() {
        let app = create_app(state(MemoryBroker::new()));

        let (status, _) = send(&app, refresh_req(Some("wrong"), Some("soldier1"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, refresh_req(None, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, refresh_req(Some(SECRET), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get_req("/soldiers/soldier1/token")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, refresh_req(Some(SECRET), Some("soldier1"))).await;
        assert_eq!(status, StatusCode::OK);
        let issued: TokenResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(issued.token.len(), 64);

        let (status, body) = send(&app, get_req("/soldiers/soldier1/token")).await;
        assert_eq!(status, StatusCode::OK);
        let digest: DigestResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(digest.soldier, "soldier1");
        assert_eq!(digest.token, common::sha256_hex(issued.token.as_bytes()));
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_counters() {
        let app = create_app(state(MemoryBroker::new()));
        send(
            &app,
            json_post("/missions", json!({"payload": "p", "target_worker": "soldier1"})),
        )
        .await;
        send(&app, refresh_req(Some("wrong"), Some("soldier1"))).await;
        let (status, body) = send(&app, get_req("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("commander_missions_submitted_total 1\n"));
        assert!(text.contains("commander_rotations_forbidden_total 1\n"));
        assert!(text.contains("commander_missions_tracked 1\n"));
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let app = create_app(state(MemoryBroker::new()));
        let (status, body) = send(&app, get_req("/nowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.code, "not_found");
    }

    #[tokio::test]
    async fn declared_queue_survives_for_later_consumer() {
        let broker = MemoryBroker::new();
        let app = create_app(state(broker.clone()));
        send(
            &app,
            json_post("/missions", json!({"payload": "p", "target_worker": "soldier9"})),
        )
        .await;
        let consumer = broker.consume("orders_commander1_soldier9").await.unwrap();
        let order: Mission = common::deserialize_message(&consumer.next().await.unwrap()).unwrap();
        assert_eq!(order.target_worker, "soldier9");
    }
}
