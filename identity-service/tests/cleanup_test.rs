//! Reaper integration tests: expired rows are removed in bounded batches and
//! live rows are left alone.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use identity_service::flow::random_token;
use identity_service::models::{CodeKind, Container, Flow, FlowKind, OneTimeCode};

fn expired_flow(nid: uuid::Uuid) -> Flow {
    Flow::new(
        nid,
        "http://localhost/self-service/login/api",
        random_token(),
        Duration::minutes(-10),
    )
}

#[tokio::test]
async fn expired_containers_are_swept_in_batches() {
    let Some(app) = TestApp::spawn().await else { return };

    for _ in 0..3 {
        let mut container = Container::new("stale", None, Duration::minutes(1), None).unwrap();
        container.expires_at = Utc::now() - Duration::minutes(5);
        app.state
            .store
            .save_container(app.nid, &container)
            .await
            .unwrap();
    }
    let live = Container::new("live", None, Duration::minutes(10), None).unwrap();
    app.state.store.save_container(app.nid, &live).await.unwrap();

    // Batch size 1 forces the sweep to loop.
    let removed = app
        .state
        .store
        .delete_expired_containers(Utc::now(), 1)
        .await
        .unwrap();
    assert!(removed >= 3, "removed {removed}");

    assert!(app.state.store.get_container(app.nid, live.id).await.is_ok());
}

#[tokio::test]
async fn expired_flows_cascade_into_their_codes() {
    let Some(app) = TestApp::spawn().await else { return };
    let store = &app.state.store;

    let stale = expired_flow(app.nid);
    store.create_flow(FlowKind::Login, &stale).await.unwrap();
    let code = OneTimeCode::new(app.nid, stale.id, "ab".repeat(32), Duration::minutes(10));
    store.create_code(CodeKind::Login, &code).await.unwrap();

    let live = Flow::new(
        app.nid,
        "http://localhost/self-service/login/api",
        random_token(),
        Duration::minutes(10),
    );
    store.create_flow(FlowKind::Login, &live).await.unwrap();

    let removed = store
        .delete_expired_flows(FlowKind::Login, Utc::now(), 2)
        .await
        .unwrap();
    assert!(removed >= 1, "removed {removed}");

    assert!(store.get_flow(FlowKind::Login, app.nid, stale.id).await.is_err());
    assert!(store.get_flow(FlowKind::Login, app.nid, live.id).await.is_ok());
}

#[tokio::test]
async fn expired_codes_are_swept_without_touching_the_flow() {
    let Some(app) = TestApp::spawn().await else { return };
    let store = &app.state.store;

    let flow = Flow::new(
        app.nid,
        "http://localhost/self-service/recovery/api",
        random_token(),
        Duration::minutes(10),
    );
    store.create_flow(FlowKind::Recovery, &flow).await.unwrap();

    let mut stale = OneTimeCode::new(app.nid, flow.id, "cd".repeat(32), Duration::minutes(1));
    stale.expires_at = Utc::now() - Duration::minutes(1);
    store.create_code(CodeKind::Recovery, &stale).await.unwrap();

    let removed = store
        .delete_expired_codes(CodeKind::Recovery, Utc::now(), 10)
        .await
        .unwrap();
    assert!(removed >= 1, "removed {removed}");
    assert!(store.get_flow(FlowKind::Recovery, app.nid, flow.id).await.is_ok());
}

#[tokio::test]
async fn consumed_exchangers_are_swept() {
    let Some(app) = TestApp::spawn().await else { return };
    let store = &app.state.store;

    let flow = app
        .state
        .flows
        .create_flow(FlowKind::Login, app.nid, "http://localhost/login", true)
        .await
        .unwrap();
    let exchanger = store.get_exchanger_by_flow(app.nid, flow.id).await.unwrap();
    store
        .try_consume_exchanger(app.nid, &exchanger.code)
        .await
        .unwrap()
        .expect("first consume wins");

    let removed = store
        .delete_consumed_exchangers(Utc::now() + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert!(removed >= 1, "removed {removed}");
    assert!(store.get_exchanger_by_flow(app.nid, flow.id).await.is_err());
}
