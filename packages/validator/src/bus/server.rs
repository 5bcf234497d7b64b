//! Inbound HTTP endpoint of the message bus.
//!
//! One axum server per party, listening on `base_port + party_id`:
//! `POST /message` accepts the JSON envelope behind the shared-secret
//! header, `GET /health` reports liveness, `GET /metrics` serves the
//! Prometheus registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::{info, warn};

use super::{Envelope, MessageBus, AUTH_HEADER};

#[derive(Serialize)]
struct HealthResponse {
    party_id: u16,
    status: &'static str,
}

async fn receive_message(
    State(bus): State<Arc<MessageBus>>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    let authorized = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == bus.shared_secret());
    if !authorized {
        warn!("Rejecting unauthenticated bus message");
        return StatusCode::UNAUTHORIZED;
    }

    bus.deliver(envelope);
    StatusCode::OK
}

async fn health(State(bus): State<Arc<MessageBus>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        party_id: bus.party_id(),
        status: "ok",
    })
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

fn router(bus: Arc<MessageBus>) -> Router {
    Router::new()
        .route("/message", post(receive_message))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(bus)
}

/// Run the bus server. Never returns under normal operation.
pub async fn start_server(bus: Arc<MessageBus>, port: u16) -> eyre::Result<()> {
    let app = router(bus);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "Bus server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::msg_type;
    use crate::config::BusConfig;
    use std::time::Duration;

    async fn spawn_test_server() -> (Arc<MessageBus>, String) {
        let config = BusConfig {
            peer_hosts: vec!["127.0.0.1".into(); 3],
            base_port: 0,
            shared_secret: "test-secret".into(),
        };
        let bus = Arc::new(MessageBus::new(1, 3, &config).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(bus.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (bus, format!("http://{addr}"))
    }

    fn envelope() -> Envelope {
        Envelope {
            sender_id: 0,
            session_id: "SIGN_evm_1".to_string(),
            msg_type: msg_type::RESPONSE.to_string(),
            data: serde_json::json!({"accept": true}),
        }
    }

    #[tokio::test]
    async fn authenticated_message_is_delivered() {
        let (bus, url) = spawn_test_server().await;

        let status = reqwest::Client::new()
            .post(format!("{url}/message"))
            .header(AUTH_HEADER, "test-secret")
            .json(&envelope())
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::OK);

        let got = bus
            .wait_for(
                msg_type::RESPONSE,
                &["SIGN_evm_1".to_string()],
                Duration::from_millis(200),
            )
            .await;
        assert_eq!(got.unwrap().sender_id, 0);
    }

    #[tokio::test]
    async fn missing_or_wrong_secret_is_rejected() {
        let (bus, url) = spawn_test_server().await;
        let client = reqwest::Client::new();

        let no_header = client
            .post(format!("{url}/message"))
            .json(&envelope())
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(no_header, reqwest::StatusCode::UNAUTHORIZED);

        let wrong = client
            .post(format!("{url}/message"))
            .header(AUTH_HEADER, "wrong")
            .json(&envelope())
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(wrong, reqwest::StatusCode::UNAUTHORIZED);

        // Nothing reached the buffers.
        let got = bus
            .wait_for(
                msg_type::RESPONSE,
                &["SIGN_evm_1".to_string()],
                Duration::from_millis(50),
            )
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn health_reports_party_id() {
        let (_bus, url) = spawn_test_server().await;

        let body: serde_json::Value = reqwest::get(format!("{url}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["party_id"], 1);
        assert_eq!(body["status"], "ok");
    }
}
