use httpmock::Method::GET;
use httpmock::MockServer;
use serial_test::serial;

mod common;

use surge::prelude::*;

const INDEX_PATH: &str = "/";

pub async fn get_index(user: &mut SurgeUser) -> ScenarioResult {
    let _response = user.get(INDEX_PATH).await?;
    Ok(())
}

/// A run whose aggregates stay inside every threshold passes.
#[tokio::test]
#[serial]
async fn test_passing_thresholds() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    let configuration = common::build_configuration(&server, vec![]);
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(get_index))
        // The mock server always returns success.
        .register_threshold("request_success: rate >= 1".parse().unwrap())
        .register_threshold("iterations: count >= 1".parse().unwrap())
        .execute()
        .await
        .unwrap();

    assert!(index_mock.hits_async().await > 0);
    assert_eq!(run_result.thresholds.len(), 2);
    for threshold_result in &run_result.thresholds {
        assert!(threshold_result.passed);
        assert!(threshold_result.observed.is_some());
    }
    assert!(run_result.passed);
}

/// A threshold failure fails the verdict without interrupting the run.
#[tokio::test]
#[serial]
async fn test_failing_threshold_completes() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    // Thresholds can also be configured as run-time options.
    let configuration = common::build_configuration(
        &server,
        vec!["--threshold", "request_time: max < 0"],
    );
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(get_index))
        .execute()
        .await
        .unwrap();

    // The run completed and generated load.
    assert!(index_mock.hits_async().await > 0);
    // No observed duration can be negative, so the threshold failed.
    assert_eq!(run_result.thresholds.len(), 1);
    assert!(!run_result.thresholds[0].passed);
    assert!(!run_result.passed);
}

/// A threshold naming a metric nothing recorded fails with a reason.
#[tokio::test]
#[serial]
async fn test_missing_metric_threshold() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let _index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    let configuration = common::build_configuration(&server, vec![]);
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(get_index))
        .register_threshold("claims_created: count >= 1".parse().unwrap())
        .execute()
        .await
        .unwrap();

    // The gate can not silently pass when its metric was never observed.
    assert!(!run_result.passed);
    assert!(run_result.thresholds[0].observed.is_none());
    assert!(run_result.thresholds[0].reason.is_some());
}

/// Scenarios can record custom metrics that thresholds then gate on.
#[tokio::test]
#[serial]
async fn test_custom_metric_thresholds() {
    // Start the mock server.
    let server = MockServer::start_async().await;

    let _index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path(INDEX_PATH);
            then.status(200);
        })
        .await;

    async fn checked_index(user: &mut SurgeUser) -> ScenarioResult {
        let response = user.get(INDEX_PATH).await?;
        user.check("index responds", response.status().is_success());
        user.increment_counter("claims_searched", 1);
        Ok(())
    }

    let configuration = common::build_configuration(&server, vec![]);
    let run_result = SurgeAttack::initialize_with_config(configuration)
        .unwrap()
        .register_scenario(scenario!(checked_index))
        .register_threshold("checks: rate >= 1".parse().unwrap())
        .register_threshold("claims_searched: count >= 1".parse().unwrap())
        .execute()
        .await
        .unwrap();

    assert!(run_result.passed);
    assert!(run_result.metrics.counter("claims_searched").unwrap().total >= 1);
    assert_eq!(run_result.metrics.rate("checks").unwrap().rate(), 1.0);
}
