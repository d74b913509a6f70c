use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::constants::VERSION;
use crate::peer::PeerRecord;
use crate::servent::{Servent, ServentStatus};

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub servent: ServentStatus,
    pub version: String,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerRecord>,
    pub count: usize,
    pub shared_files: Vec<String>,
}

#[derive(Serialize)]
pub struct SignalResponse {
    pub added: bool,
}

pub async fn status_handler(State(servent): State<Arc<Servent>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        servent: servent.status().await,
        version: VERSION.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn peers_handler(State(servent): State<Arc<Servent>>) -> Json<PeersResponse> {
    let peers = servent.connected_peers().await;
    Json(PeersResponse {
        count: peers.len(),
        peers,
        shared_files: servent.shared_files(),
    })
}

// Directory callback: a subscribed directory reports a newly reliable servent.
async fn signal_handler(
    State(servent): State<Arc<Servent>>,
    Json(record): Json<PeerRecord>,
) -> Json<SignalResponse> {
    let added = servent.signal_reliable_servent(record).await;
    Json(SignalResponse { added })
}

pub fn router(servent: Arc<Servent>) -> Router {
    Router::new()
        .route("/v1/status", get(status_handler))
        .route("/v1/peers", get(peers_handler))
        .route("/v1/signal", post(signal_handler))
        .with_state(servent)
}

pub async fn serve(servent: Arc<Servent>, listener: TcpListener, halt: CancellationToken) {
    let app = router(servent);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { halt.cancelled().await })
        .await;
    if let Err(e) = served {
        log::warn!("HTTP API stopped: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::linked_servent;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_status_reports_links() {
        let (servent, _files, _) = linked_servent(4, false, &["foo.txt"], &[(2, 6000)]).await;
        let response = router(servent)
            .oneshot(Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["connections"], 1);
        assert_eq!(json["connections_limit"], 4);
        assert_eq!(json["state"], "Created");
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_peers_lists_links_and_files() {
        let (servent, _files, _) = linked_servent(4, false, &["foo.txt"], &[(2, 6000), (3, 6000)]).await;
        let response = router(servent)
            .oneshot(Request::builder().uri("/v1/peers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["count"], 2);
        assert_eq!(json["shared_files"][0], "foo.txt");
    }

    #[tokio::test]
    async fn test_signal_adds_unknown_peer() {
        let (servent, _files, _) = linked_servent(1, false, &[], &[(2, 6000)]).await;
        let app = router(Arc::clone(&servent));
        let signal = |body: &str| {
            Request::builder()
                .method("POST")
                .uri("/v1/signal")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(signal(r#"{"address":"10.0.0.8","data_port":6000,"discovery_port":6001}"#))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"added":true}"#);
        assert_eq!(servent.cache_len().await, 2);

        let response = app
            .oneshot(signal(r#"{"address":"10.0.0.8","data_port":6000}"#))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"added":false}"#);
    }
}
