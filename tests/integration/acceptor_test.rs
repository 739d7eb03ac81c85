// HTTP status mapping of the acceptor router.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use profile_relay::acceptor::{router, MAX_BODY_BYTES, RETRY_AFTER_SECS};
use profile_relay::rabbitmq::mock::MockBroker;
use profile_relay::rabbitmq::{Publisher, RabbitMQError, Result};
use support::manager;
use tower::ServiceExt;

const PROFILE: &[u8] = br#"{"Name":"a","URL":"b"}"#;

/// Publisher whose outcome is fixed up front.
struct FixedPublisher {
    outcome: Result<()>,
    calls: AtomicUsize,
}

impl FixedPublisher {
    fn new(outcome: Result<()>) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for FixedPublisher {
    async fn publish(&self, _data: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    fn is_ready(&self) -> bool {
        self.outcome.is_ok()
    }
}

fn request(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap()
}

async fn status_of(app: Router, req: Request<Body>) -> StatusCode {
    app.oneshot(req).await.unwrap().status()
}

#[tokio::test]
async fn test_valid_post_is_published_verbatim() {
    let broker = MockBroker::new();
    let manager = manager(&broker, None).await;
    let app = router(Arc::new(manager));

    let status = status_of(app, request(Method::POST, "/put", PROFILE)).await;

    assert_eq!(status, StatusCode::OK);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, PROFILE.to_vec());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let publisher = FixedPublisher::new(Ok(()));
    let app = router(publisher.clone());

    assert_eq!(
        status_of(app.clone(), request(Method::POST, "/put", "42")).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        status_of(app, request(Method::POST, "/put", "{\"Name\":")).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(publisher.calls(), 0);
}

#[tokio::test]
async fn test_wrong_method_is_not_implemented() {
    let publisher = FixedPublisher::new(Ok(()));
    let app = router(publisher.clone());

    assert_eq!(
        status_of(app.clone(), request(Method::PUT, "/put", PROFILE)).await,
        StatusCode::NOT_IMPLEMENTED
    );
    assert_eq!(
        status_of(app, request(Method::GET, "/put", Body::empty())).await,
        StatusCode::NOT_IMPLEMENTED
    );
    assert_eq!(publisher.calls(), 0);
}

#[tokio::test]
async fn test_not_ready_core_is_service_unavailable() {
    let broker = MockBroker::new();
    let manager = manager(&broker, None).await;
    manager.shutdown().await;
    let app = router(Arc::new(manager));

    let response = app
        .oneshot(request(Method::POST, "/put", PROFILE))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get(header::RETRY_AFTER).unwrap(),
        RETRY_AFTER_SECS
    );
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_publish_error_is_service_unavailable() {
    let publisher = FixedPublisher::new(Err(RabbitMQError::publish("channel closed")));
    let app = router(publisher.clone());

    let response = app
        .oneshot(request(Method::POST, "/put", PROFILE))
        .await
        .unwrap();

    // Not a reconnect, so no retry hint.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().get(header::RETRY_AFTER).is_none());
    assert_eq!(publisher.calls(), 1);
}

#[tokio::test]
async fn test_unreadable_body_is_internal_error() {
    let publisher = FixedPublisher::new(Ok(()));
    let app = router(publisher.clone());

    let broken = Body::from_stream(futures::stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"{\"Name\"")),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
    ]));
    assert_eq!(
        status_of(app.clone(), request(Method::POST, "/put", broken)).await,
        StatusCode::INTERNAL_SERVER_ERROR
    );

    let oversized = vec![b' '; MAX_BODY_BYTES + 1];
    assert_eq!(
        status_of(app, request(Method::POST, "/put", oversized)).await,
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(publisher.calls(), 0);
}

#[tokio::test]
async fn test_readiness_endpoint_tracks_core() {
    let broker = MockBroker::new();
    let manager = manager(&broker, None).await;
    let app = router(Arc::new(manager.clone()));

    assert_eq!(
        status_of(app.clone(), request(Method::GET, "/ready", Body::empty())).await,
        StatusCode::OK
    );

    manager.shutdown().await;
    assert_eq!(
        status_of(app, request(Method::GET, "/ready", Body::empty())).await,
        StatusCode::SERVICE_UNAVAILABLE
    );
}
