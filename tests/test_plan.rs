use httpmock::Method::GET;
use httpmock::MockServer;
use serial_test::serial;

mod common;

use surge::metrics::{ITERATIONS, REQUESTS, REQUEST_TIME};
use surge::prelude::*;

const INDEX_PATH: &str = "/";

pub async fn get_index(user: &mut SurgeUser) -> ScenarioResult {
    let _response = user.get(INDEX_PATH).await?;
    Ok(())
}

/// Ramp up, hold, and ramp down over an explicit test plan.
#[tokio::test]
#[serial]
async fn test_ramp_and_hold() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    // Ramp to 2 users over 1s, hold 1s, then ramp down over 1s.
    let configuration =
        common::build_configuration(&server, vec!["--test-plan", "2,1s;2,1s;0,1s"]);
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(get_index))
        .execute()
        .await
        .unwrap();

    // The load test ran to the end of the plan.
    assert!(run_result.metrics.duration >= 2);
    // Two users ran at peak, and no more than two were ever spawned.
    assert_eq!(run_result.metrics.maximum_users, 2);
    assert_eq!(run_result.metrics.total_users, 2);

    // The users iterated and made requests.
    let hits = index_mock.hits_async().await;
    assert!(hits > 0);
    assert!(run_result.metrics.counter(ITERATIONS).unwrap().total > 0);
    // Every request the helpers made was counted and timed.
    assert_eq!(run_result.metrics.counter(REQUESTS).unwrap().total, hits);
    assert_eq!(run_result.metrics.trend(REQUEST_TIME).unwrap().counter, hits);
    // The scenario's own trend was recorded under its name.
    assert!(run_result.metrics.trend("get_index").is_some());
}

/// A mid-plan target of 0 drains every user, and a following ramp spawns
/// replacements.
#[tokio::test]
#[serial]
async fn test_drain_and_respawn() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    let configuration =
        common::build_configuration(&server, vec!["--test-plan", "2,1s;0,1s;2,1s"]);
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(get_index))
        .execute()
        .await
        .unwrap();

    assert!(index_mock.hits_async().await > 0);
    // Draining to 0 retires the original users, the final ramp spawns fresh
    // ones: more users were spawned in total than ever ran at once.
    assert_eq!(run_result.metrics.maximum_users, 2);
    assert!(run_result.metrics.total_users >= 3);
}

/// The --users/--hatch-rate/--run-time conveniences build a ramp-hold-stop
/// plan without an explicit --test-plan.
#[tokio::test]
#[serial]
async fn test_users_and_run_time() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    let configuration = common::build_configuration(
        &server,
        vec!["--users", "2", "--hatch-rate", "4", "--run-time", "1"],
    );
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(get_index))
        .execute()
        .await
        .unwrap();

    assert!(index_mock.hits_async().await > 0);
    assert_eq!(run_result.metrics.maximum_users, 2);
    assert_eq!(run_result.metrics.total_users, 2);
    // The run ends once the plan is exhausted, without being canceled.
    assert!(run_result.passed);
}
