//! HTTP API surface: routing, status mapping, JSON bodies.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use stevedore::api::router;
use stevedore::capacity::Resources;
use stevedore::container::Container;

use common::{container, start_agent, test_config};

async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn ping_answers_ok() {
    let fixture = start_agent(test_config()).await;
    let app = router(fixture.agent.clone());

    let response = app
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn allocate_round_trips_the_container() {
    let fixture = start_agent(test_config()).await;
    let app = router(fixture.agent.clone());

    let request_body = serde_json::to_vec(&container("ignored-guid")).unwrap();
    let response = app
        .oneshot(
            Request::post("/containers/from-path")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request_body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let allocated: Container = body_json(response.into_body()).await;
    // The path guid wins over whatever the body carried.
    assert_eq!(allocated.guid, "from-path");
}

#[tokio::test]
async fn double_allocate_maps_to_conflict() {
    let fixture = start_agent(test_config()).await;

    fixture.agent.allocate(container("taken")).unwrap();

    let request_body = serde_json::to_vec(&container("taken")).unwrap();
    let response = router(fixture.agent.clone())
        .oneshot(
            Request::post("/containers/taken")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request_body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_container_maps_to_not_found() {
    let fixture = start_agent(test_config()).await;

    let response = router(fixture.agent.clone())
        .oneshot(Request::get("/containers/ghost").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resources_report_total_and_remaining() {
    let fixture = start_agent(test_config()).await;
    fixture.agent.allocate(container("claimer")).unwrap();

    let total_response = router(fixture.agent.clone())
        .oneshot(Request::get("/resources/total").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let total: Resources = body_json(total_response.into_body()).await;
    assert_eq!(total, Resources::new(1024, 1024, 10));

    let remaining_response = router(fixture.agent.clone())
        .oneshot(
            Request::get("/resources/remaining")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let remaining: Resources = body_json(remaining_response.into_body()).await;
    assert_eq!(remaining, Resources::new(960, 960, 9));
}

#[tokio::test]
async fn list_filters_by_query_tags() {
    let fixture = start_agent(test_config()).await;

    let mut tagged = container("blue-one");
    tagged.tags.insert("team".to_string(), "blue".to_string());
    fixture.agent.allocate(tagged).unwrap();
    fixture.agent.allocate(container("untagged")).unwrap();

    let response = router(fixture.agent.clone())
        .oneshot(
            Request::get("/containers?team=blue")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let listed: Vec<Container> = body_json(response.into_body()).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].guid, "blue-one");
}

#[tokio::test]
async fn files_endpoint_streams_sandbox_contents() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;

    agent.allocate(container("filer")).unwrap();
    agent.initialize("filer").await.unwrap();

    let sandbox = fixture.runtime.sandbox("filer").unwrap();
    sandbox
        .stream_out_data
        .lock()
        .unwrap()
        .insert("/var/log/app.log".to_string(), b"streamed".to_vec());

    let response = router(fixture.agent.clone())
        .oneshot(
            Request::get("/containers/filer/files?source=/var/log/app.log")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"streamed");
}
