/// HTTP metrics endpoint
///
/// `GET /metrics` serves the Prometheus text exposition, `GET /stats` the JSON
/// metrics snapshot. Anything else is a 404.
use crate::errors::{DaemonError, DaemonResult};
use agentlink_core::Hub;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Bind the endpoint and serve it until the shutdown channel fires.
pub fn spawn(
    addr: SocketAddr,
    hub: Arc<Hub>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> DaemonResult<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_conn| {
        let hub = hub.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let hub = hub.clone();
                handle_request(req, hub)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| DaemonError::Server(format!("Failed to bind metrics endpoint {}: {}", addr, e)))?
        .serve(make_svc);
    let local_addr = server.local_addr();
    info!("Metrics endpoint listening on http://{}", local_addr);

    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });
    let handle = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            error!("Metrics server error: {}", e);
        }
    });
    Ok((local_addr, handle))
}

async fn handle_request(req: Request<Body>, hub: Arc<Hub>) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match hub.gather_metrics() {
            Ok(body) => text_response(StatusCode::OK, body, "text/plain; version=0.0.4"),
            Err(e) => {
                error!("Failed to gather metrics: {:?}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to gather metrics".to_string(),
                    "text/plain",
                )
            }
        },
        (&Method::GET, "/stats") => match serde_json::to_string(&hub.metrics_snapshot(true)) {
            Ok(body) => text_response(StatusCode::OK, body, "application/json"),
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "text/plain"),
        },
        _ => text_response(StatusCode::NOT_FOUND, "Not found".to_string(), "text/plain"),
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: String, content_type: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentlink_core::{HubConfig, MemoryStore};

    #[tokio::test]
    async fn test_routes() {
        let hub = Hub::new(Arc::new(MemoryStore::new()), HubConfig::default()).unwrap();

        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let resp = handle_request(req, hub.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("agentlink_messages_total"));

        let req = Request::get("/stats").body(Body::empty()).unwrap();
        let resp = handle_request(req, hub.clone()).await.unwrap();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["clients"]["total"], 0);

        let req = Request::get("/nope").body(Body::empty()).unwrap();
        let resp = handle_request(req, hub).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
