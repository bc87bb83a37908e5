use rand::Rng;
use std::sync::Arc;
use std::time::{self, Duration};

use crate::metrics;
use crate::surge::{DispatchTable, SurgeUser};

/// Commands sent from the parent to a running virtual user.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UserCommand {
    /// Tell the user to stop at the next iteration boundary.
    Exit,
}

pub(crate) async fn user_main(
    user_number: usize,
    dispatch: Arc<DispatchTable>,
    mut user: SurgeUser,
    receiver: flume::Receiver<UserCommand>,
) {
    info!("launching user {}...", user_number);

    // Loop until the parent tells us to stop, running at most one scenario
    // per iteration.
    'iterations: loop {
        // Draw in a dedicated statement so the non-Send `ThreadRng`
        // temporary is dropped here, rather than being held across the
        // `.await` below (which would make this future non-Send).
        let scenario = dispatch.select(&mut rand::rng());
        if let Some(scenario) = scenario {
            debug!(
                "user {}: launching {} scenario",
                user_number, scenario.name
            );
            let started = time::Instant::now();
            let result = (scenario.function)(&mut user).await;
            let elapsed = started.elapsed();

            // A failure inside a scenario marks the iteration failed, it never
            // terminates the user.
            if let Err(e) = &result {
                debug!(
                    "user {}: scenario {} failed: {}",
                    user_number, scenario.name, e
                );
            }
            user.record_trend(metrics::ITERATION_TIME, elapsed);
            user.record_trend(&scenario.name, elapsed);
            user.record_rate(metrics::ITERATION_SUCCESS, result.is_ok());
            user.increment_counter(metrics::ITERATIONS, 1);
        }
        // A draw landing in the unweighted remainder runs nothing this
        // iteration.

        // Cancellation is cooperative, and only takes effect at iteration
        // boundaries or while sleeping, never mid-scenario.
        if received_exit(&receiver) {
            break 'iterations;
        }

        if let Some((min, max)) = user.think_time {
            // Total time left to sleep before the next iteration.
            let mut think_time = rand::rng().random_range(min..=max).as_millis();
            // Never sleep more than 500 milliseconds at once, allowing a
            // sleeping user to shut down quickly when the load test ends.
            let maximum_sleep_time = 500;

            while think_time > 0 {
                // Exit immediately if message received from parent.
                if received_exit(&receiver) {
                    break 'iterations;
                }

                // Wake regularly to detect if the load test has shut down.
                let sleep_duration = if think_time > maximum_sleep_time {
                    think_time -= maximum_sleep_time;
                    Duration::from_millis(maximum_sleep_time as u64)
                } else {
                    let sleep_duration = Duration::from_millis(think_time as u64);
                    think_time = 0;
                    sleep_duration
                };

                debug!("user {} sleeping {:?} ...", user_number, sleep_duration);
                tokio::time::sleep(sleep_duration).await;
            }
        } else {
            // Without a think time, yield between iterations so a user whose
            // draw ran no scenario can't monopolize the executor.
            tokio::task::yield_now().await;
        }
    }

    info!("exiting user {}...", user_number);
}

// Determine if the parent has sent a UserCommand::Exit message.
fn received_exit(receiver: &flume::Receiver<UserCommand>) -> bool {
    matches!(receiver.try_recv(), Ok(UserCommand::Exit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    use crate::config::SurgeConfiguration;
    use crate::metrics::SurgeMetrics;
    use crate::surge::{Scenario, ScenarioError, ScenarioFunction};

    // Build a scenario that counts its invocations.
    fn counting_scenario(
        name: &str,
        probability: f64,
        invocations: Arc<AtomicUsize>,
        fail: bool,
    ) -> Scenario {
        let function: ScenarioFunction = Arc::new(move |_user| {
            let invocations = invocations.clone();
            Box::pin(async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(ScenarioError::Check {
                        tag: "always fails".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
        });
        Scenario::new(name, function)
            .set_probability(probability)
            .unwrap()
    }

    fn build_user(
        think_time: Option<(Duration, Duration)>,
    ) -> (SurgeUser, flume::Receiver<crate::metrics::SurgeMetric>) {
        let configuration = SurgeConfiguration::default();
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let mut user = SurgeUser::new(
            1,
            Url::parse("http://127.0.0.1:1/").unwrap(),
            think_time,
            &configuration,
        )
        .unwrap();
        user.metrics_tx = Some(metrics_tx);
        (user, metrics_rx)
    }

    fn drain_metrics(metrics_rx: &flume::Receiver<crate::metrics::SurgeMetric>) -> SurgeMetrics {
        let mut metrics = SurgeMetrics::default();
        while let Ok(metric) = metrics_rx.try_recv() {
            metrics.record(metric);
        }
        metrics
    }

    #[tokio::test]
    async fn cancel_during_think_time() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatch = Arc::new(
            DispatchTable::new(vec![counting_scenario(
                "count",
                1.0,
                invocations.clone(),
                false,
            )])
            .unwrap(),
        );

        // A think time much longer than the test, the user must wake early.
        let think_time = Some((Duration::from_secs(10), Duration::from_secs(10)));
        let (user, metrics_rx) = build_user(think_time);
        let (parent_tx, receiver) = flume::unbounded();
        let handle = tokio::spawn(user_main(1, dispatch, user, receiver));

        // Give the user time to run its first iteration and enter think-time.
        tokio::time::sleep(Duration::from_millis(300)).await;
        parent_tx.send(UserCommand::Exit).unwrap();

        // A user canceled while sleeping terminates without starting another
        // iteration.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("canceled user did not exit promptly")
            .unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // Exactly one full iteration was observed, nothing partial.
        let metrics = drain_metrics(&metrics_rx);
        assert_eq!(metrics.counter(crate::metrics::ITERATIONS).unwrap().total, 1);
        assert_eq!(
            metrics
                .rate(crate::metrics::ITERATION_SUCCESS)
                .unwrap()
                .total_count,
            1
        );
    }

    #[tokio::test]
    async fn scenario_failures_do_not_terminate() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let dispatch = Arc::new(
            DispatchTable::new(vec![counting_scenario(
                "flaky",
                1.0,
                invocations.clone(),
                true,
            )])
            .unwrap(),
        );

        let think_time = Some((Duration::from_millis(1), Duration::from_millis(5)));
        let (user, metrics_rx) = build_user(think_time);
        let (parent_tx, receiver) = flume::unbounded();
        let handle = tokio::spawn(user_main(1, dispatch, user, receiver));

        // Let the user fail through a number of iterations.
        tokio::time::sleep(Duration::from_millis(250)).await;
        parent_tx.send(UserCommand::Exit).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("user did not exit promptly")
            .unwrap();

        // The user kept iterating through failures, and every failure was
        // recorded.
        let total = invocations.load(Ordering::SeqCst);
        assert!(total > 1);
        let metrics = drain_metrics(&metrics_rx);
        let success = metrics.rate(crate::metrics::ITERATION_SUCCESS).unwrap();
        assert_eq!(success.total_count, total);
        assert_eq!(success.pass_count, 0);
        assert_eq!(success.rate(), 0.0);
    }

    #[tokio::test]
    async fn dead_zone_runs_nothing() {
        let invocations = Arc::new(AtomicUsize::new(0));
        // A tiny probability leaves a 99.9% dead zone; over a short window
        // almost every draw runs nothing, and nothing is recorded for those
        // iterations.
        let dispatch = Arc::new(
            DispatchTable::new(vec![counting_scenario(
                "rare",
                0.001,
                invocations.clone(),
                false,
            )])
            .unwrap(),
        );

        let think_time = Some((Duration::from_millis(1), Duration::from_millis(2)));
        let (user, metrics_rx) = build_user(think_time);
        let (parent_tx, receiver) = flume::unbounded();
        let handle = tokio::spawn(user_main(1, dispatch, user, receiver));

        tokio::time::sleep(Duration::from_millis(100)).await;
        parent_tx.send(UserCommand::Exit).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("user did not exit promptly")
            .unwrap();

        // Iterations are only recorded when a scenario actually ran.
        let metrics = drain_metrics(&metrics_rx);
        let recorded = match metrics.counter(crate::metrics::ITERATIONS) {
            Some(counter) => counter.total,
            None => 0,
        };
        assert_eq!(recorded, invocations.load(Ordering::SeqCst));
    }
}
