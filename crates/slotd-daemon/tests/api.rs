//! Control API precondition behaviors: status codes and envelopes
//! that must hold before anything has ever been deployed.

mod common;

use common::{launch, Opts, TestEnv};

#[tokio::test]
async fn root_reports_ok() {
    let env = TestEnv::new(1);
    let daemon = launch(&env, &Opts::default()).await;

    let body: serde_json::Value = daemon
        .client
        .get(format!("{}/", daemon.api))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    daemon.stop().await;
}

#[tokio::test]
async fn status_is_empty_before_any_deploy() {
    let env = TestEnv::new(1);
    let daemon = launch(&env, &Opts::default()).await;

    let status = daemon.status().await;
    assert_eq!(status.live_slot, "");
    assert_eq!(status.live_commit, "");
    assert_eq!(status.previous_slot, "");
    assert_eq!(status.previous_commit, "");
    assert_eq!(status.staging_dir, "slot-staging");
    assert_eq!(status.last_deploy_time, "");
    assert!(!status.healthy);

    daemon.stop().await;
}

#[tokio::test]
async fn deploy_requires_a_commit() {
    let env = TestEnv::new(1);
    let daemon = launch(&env, &Opts::default()).await;

    // No body at all.
    let response = daemon
        .client
        .post(format!("{}/deploy", daemon.api))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Empty commit.
    let (status, body) = daemon.deploy("").await;
    assert_eq!(status, 400);
    assert!(!body.success);
    assert_eq!(body.error, "missing commit");

    // Body that is not JSON.
    let response = daemon
        .client
        .post(format!("{}/deploy", daemon.api))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    daemon.stop().await;
}

#[tokio::test]
async fn rollback_without_previous_is_rejected() {
    let env = TestEnv::new(1);
    let daemon = launch(&env, &Opts::default()).await;

    let (status, body) = daemon.rollback().await;
    assert_eq!(status, 400);
    assert!(!body.success);
    assert_eq!(body.error, "no previous slot");

    daemon.stop().await;
}

#[tokio::test]
async fn unknown_paths_are_404() {
    let env = TestEnv::new(1);
    let daemon = launch(&env, &Opts::default()).await;

    let response = daemon
        .client
        .get(format!("{}/nope", daemon.api))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    daemon.stop().await;
}

#[tokio::test]
async fn deploy_of_an_unknown_commit_is_a_500() {
    let env = TestEnv::new(1);
    let daemon = launch(&env, &Opts::default()).await;

    let (status, body) = daemon
        .deploy("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
        .await;
    assert_eq!(status, 500);
    assert!(!body.success);
    assert!(!body.error.is_empty());

    // Old state untouched.
    let status = daemon.status().await;
    assert_eq!(status.live_commit, "");

    daemon.stop().await;
}
