use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use git_ssh::Circuit;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Both probes report whether the SSH listener is accepting connections.
pub fn build_health_router(circuit: Arc<Circuit>) -> Router {
    Router::new()
        .route("/healthz", get(probe))
        .route("/readyz", get(probe))
        .with_state(circuit)
}

async fn probe(State(circuit): State<Arc<Circuit>>) -> (StatusCode, &'static str) {
    if circuit.is_closed() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "SSH listener not accepting connections")
    }
}

pub async fn run_health(
    listener: TcpListener,
    circuit: Arc<Circuit>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "health endpoint listening");
    axum::serve(listener, build_health_router(circuit))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status_of(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_probes_fail_until_listener_accepts() {
        let circuit = Arc::new(Circuit::new());
        let router = build_health_router(circuit.clone());

        let (status, _) = status_of(router.clone(), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        assert!(circuit.close());
        for uri in ["/healthz", "/readyz"] {
            let (status, body) = status_of(router.clone(), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "OK");
        }
    }

    #[tokio::test]
    async fn test_probes_fail_after_shutdown() {
        let circuit = Arc::new(Circuit::new());
        circuit.close();
        circuit.open();

        let (status, _) = status_of(build_health_router(circuit), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let router = build_health_router(Arc::new(Circuit::new()));
        let (status, _) = status_of(router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
