use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use kudzu_rs::delegate::{
    callback_router, MemoryResultStorage, ResultError, ResultStorage, StorageKey,
    CONFIG_HASH_HEADER,
};
use tower::ServiceExt;

fn storage_and_router() -> (Arc<MemoryResultStorage>, axum::Router) {
    let storage = Arc::new(MemoryResultStorage::default());
    let router = callback_router(storage.clone());
    (storage, router)
}

async fn body_string(body: Body) -> String {
    let bytes = to_bytes(body, usize::MAX).await.expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn accepted_callback_lands_in_storage() {
    let (storage, router) = storage_and_router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/callbacks/api/1234/result")
        .header(CONFIG_HASH_HEADER, "empty")
        .body(Body::from(r#"{"items":[]}"#))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_string(response.into_body()).await, "Result saved\n");

    let key = StorageKey {
        kind: "api".to_string(),
        uid: "1234".to_string(),
    };
    let data = storage.pop(&key, "empty").unwrap();
    assert_eq!(data, br#"{"items":[]}"#);
}

#[tokio::test]
async fn missing_fingerprint_header_is_rejected() {
    let (storage, router) = storage_and_router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/callbacks/api/1234/result")
        .body(Body::from("{}"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_string(response.into_body()).await,
        "Missing Kudzu-Config-Hash header\n"
    );

    let key = StorageKey {
        kind: "api".to_string(),
        uid: "1234".to_string(),
    };
    assert!(matches!(
        storage.pop(&key, "empty"),
        Err(ResultError::NotFound)
    ));
}

#[tokio::test]
async fn stale_generation_never_reaches_a_consumer() {
    let (storage, router) = storage_and_router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/callbacks/api/1234/result")
        .header(CONFIG_HASH_HEADER, "sha256:old")
        .body(Body::from(r#"{"items":[]}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let key = StorageKey {
        kind: "api".to_string(),
        uid: "1234".to_string(),
    };

    // a consumer expecting the current generation drops the stale payload
    assert!(matches!(
        storage.pop(&key, "sha256:new"),
        Err(ResultError::NotFound)
    ));
    assert!(matches!(
        storage.pop(&key, "sha256:old"),
        Err(ResultError::NotFound)
    ));
}
