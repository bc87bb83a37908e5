//! Test plan structures and functions.
//!
//! Internally, Surge represents all load tests as a series of test plan steps,
//! each defining a target number of users and the time to reach it. The target
//! concurrency at any instant is the linear interpolation between the previous
//! step's target and the current step's target.

use chrono::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use std::time;

use crate::config::SurgeConfiguration;
use crate::util;
use crate::{AttackPhase, SurgeAttack, SurgeAttackRunState, SurgeError};

/// Internal data structure representing a test plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    // A test plan is a vector of tuples each indicating a # of users and milliseconds.
    pub(crate) steps: Vec<(usize, usize)>,
    // Which step of the test_plan is currently running.
    pub(crate) current: usize,
}

/// Automatically represent all load tests internally as a test plan.
///
/// Load tests launched using `--users`, `--startup-time`, `--hatch-rate`, and/or
/// `--run-time` are automatically converted to a `Vec<(usize, usize)>` test plan.
impl TestPlan {
    /// Create a new, empty TestPlan structure.
    pub(crate) fn new() -> TestPlan {
        TestPlan {
            steps: Vec::new(),
            current: 0,
        }
    }

    /// Build a test plan from current configuration.
    pub(crate) fn build(configuration: &SurgeConfiguration) -> TestPlan {
        if let Some(test_plan) = configuration.test_plan.as_ref() {
            // Test plan was manually defined, clone and return as is.
            test_plan.clone()
        } else {
            let mut steps: Vec<(usize, usize)> = Vec::new();

            // Build a simple test plan from configured options if possible.
            if let Some(users) = configuration.users {
                if configuration.startup_time != "0" {
                    // Load test is configured with --startup-time.
                    steps.push((
                        users,
                        util::parse_timespan(&configuration.startup_time) * 1_000,
                    ));
                } else {
                    // Load test is configured with --hatch-rate.
                    let hatch_rate = util::get_float_from_string(configuration.hatch_rate.clone())
                        .unwrap_or(1.0);
                    // Convert hatch_rate to milliseconds.
                    let ms_hatch_rate = 1.0 / hatch_rate * 1_000.0;
                    // Finally, multiply the hatch rate by the number of users to hatch.
                    let total_time = ms_hatch_rate * users as f32;
                    steps.push((users, total_time as usize));
                }

                // A run-time is set, configure the load plan to run for the specified
                // time then shut down.
                if configuration.run_time != "0" {
                    // Maintain the configured number of users for the configured run-time.
                    steps.push((users, util::parse_timespan(&configuration.run_time) * 1_000));
                    // Then shut down the load test as quickly as possible.
                    steps.push((0, 0));
                }
            }

            // Define test plan from options.
            TestPlan { steps, current: 0 }
        }
    }

    // Determine the total number of users spawned across the entire test plan.
    pub(crate) fn total_users(&self) -> usize {
        let mut total_users: usize = 0;
        let mut previous: usize = 0;
        for step in &self.steps {
            // Add to total_users every time there is an increase.
            if step.0 > previous {
                total_users += step.0 - previous;
            }
            previous = step.0
        }
        total_users
    }

    // Determine the largest number of users running at any one time.
    pub(crate) fn maximum_users(&self) -> usize {
        self.steps.iter().map(|step| step.0).max().unwrap_or(0)
    }

    // Total configured duration of the test plan, in milliseconds.
    pub(crate) fn total_duration(&self) -> usize {
        self.steps.iter().map(|step| step.1).sum()
    }

    /// Determine the instantaneous target concurrency a given number of
    /// milliseconds into the test plan.
    ///
    /// Each step ramps linearly from the previous step's target (0 before the
    /// first step) to its own target over its duration; a step with identical
    /// start and end targets is a hold. Once the final step's duration has
    /// elapsed the test plan is exhausted and the target is 0.
    pub(crate) fn target_users_at(&self, elapsed: usize) -> usize {
        let mut previous_users: usize = 0;
        let mut step_started: usize = 0;
        for (users, duration) in &self.steps {
            let step_ends = step_started + duration;
            if elapsed < step_ends {
                let progress = (elapsed - step_started) as f64 / *duration as f64;
                let delta = *users as f64 - previous_users as f64;
                return (previous_users as f64 + delta * progress).round() as usize;
            }
            previous_users = *users;
            step_started = step_ends;
        }
        // The test plan is exhausted, all users are retired.
        0
    }
}

/// Implement [`FromStr`] to convert `"users,timespan"` string formatted test plans to
/// Surge's internal representation of Vec<(usize, usize)>.
///
/// Users are represented simply as an integer.
///
/// Time span can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating "hours",
/// "minutes", and "seconds". Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
impl FromStr for TestPlan {
    type Err = SurgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Convert string into a TestPlan.
        let mut steps: Vec<(usize, usize)> = Vec::new();
        // Each line of the test plan must be in the format "{users},{timespan}",
        // white space is ignored.
        let re = Regex::new(r"^\s*(\d+)\s*,\s*(\d+|((\d+?)h)?((\d+?)m)?((\d+?)s)?)\s*$").unwrap();
        // A test plan can have multiple lines split by the semicolon ";".
        let lines = s.split(';');
        for line in lines {
            if let Some(cap) = re.captures(line) {
                let left = cap[1]
                    .parse::<usize>()
                    .expect("failed to convert \\d to usize");
                let right = util::parse_timespan(&cap[2]) * 1_000;
                steps.push((left, right));
            } else {
                // Logger isn't initialized yet, provide helpful debug output.
                eprintln!("ERROR: invalid `configuration.test_plan` value: '{}'", line);
                eprintln!("  Expected format: --test-plan \"{{users}},{{timespan}};{{users}},{{timespan}}\"");
                eprintln!("    {{users}} must be an integer, ie \"100\"");
                eprintln!("    {{timespan}} can be integer seconds or \"30s\", \"20m\", \"3h\", \"1h30m\", etc");
                return Err(SurgeError::InvalidOption {
                    option: "`configuration.test_plan".to_string(),
                    value: line.to_string(),
                    detail: "invalid `configuration.test_plan` value.".to_string(),
                });
            }
        }
        // The steps are only valid if the logic gets this far.
        Ok(TestPlan { steps, current: 0 })
    }
}

/// A test plan is a series of steps performing one of the following actions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TestPlanStepAction {
    /// A test plan step that is increasing the number of virtual users.
    Increasing,
    /// A test plan step that is maintaining the number of virtual users.
    Maintaining,
    /// A test plan step that is decreasing the number of virtual users.
    Decreasing,
    /// A step canceling all virtual users before the plan completed.
    Canceling,
    /// The final step indicating that the load test is finished.
    Finished,
}

/// A historical record of a single test plan step, used to annotate the final
/// run summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestPlanHistory {
    /// What action happened in this step.
    pub action: TestPlanStepAction,
    /// A timestamp of when the step started.
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
    /// The target number of users when the step started.
    pub users: usize,
}
impl TestPlanHistory {
    /// A helper to record a new test plan step in the historical record.
    pub(crate) fn step(action: TestPlanStepAction, users: usize) -> TestPlanHistory {
        TestPlanHistory {
            action,
            timestamp: Some(Utc::now()),
            users,
        }
    }
}

impl SurgeAttack {
    // Advance the active load test to the next test plan step.
    pub(crate) fn advance_test_plan(&mut self, run_state: &mut SurgeAttackRunState) {
        // Record the instant this new step starts, for use with timers.
        self.step_started = Some(time::Instant::now());

        if self.test_plan.current >= self.test_plan.steps.len() {
            // The final step's duration has elapsed, the load test is in its
            // terminal state.
            self.set_attack_phase(run_state, AttackPhase::Stopping);
            self.metrics
                .history
                .push(TestPlanHistory::step(TestPlanStepAction::Finished, 0));
            return;
        }

        // Determine the ramp direction by comparing the previous step's target
        // (0 before the first step) to the target of the step now starting.
        let previous_users = if self.test_plan.current == 0 {
            0
        } else {
            self.test_plan.steps[self.test_plan.current - 1].0
        };
        let action = match previous_users.cmp(&self.test_plan.steps[self.test_plan.current].0) {
            Ordering::Less => {
                self.set_attack_phase(run_state, AttackPhase::Increase);
                TestPlanStepAction::Increasing
            }
            Ordering::Greater => {
                self.set_attack_phase(run_state, AttackPhase::Decrease);
                TestPlanStepAction::Decreasing
            }
            Ordering::Equal => {
                self.set_attack_phase(run_state, AttackPhase::Maintain);
                TestPlanStepAction::Maintaining
            }
        };

        // Record details about the new test plan step that is starting.
        self.metrics.history.push(TestPlanHistory::step(
            action,
            self.test_plan.steps[self.test_plan.current].0,
        ));

        // Always advance the test plan step.
        self.test_plan.current += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_test_plan() {
        let test_plan: TestPlan = "4,10s;4,30s;0,10s".parse().unwrap();
        assert_eq!(
            test_plan.steps,
            vec![(4, 10_000), (4, 30_000), (0, 10_000)]
        );

        // Integers with no unit are seconds.
        let test_plan: TestPlan = "10,30".parse().unwrap();
        assert_eq!(test_plan.steps, vec![(10, 30_000)]);

        // White space is ignored.
        let test_plan: TestPlan = " 5 , 1m ; 0 , 0 ".parse().unwrap();
        assert_eq!(test_plan.steps, vec![(5, 60_000), (0, 0)]);

        // Compound timespans are valid.
        let test_plan: TestPlan = "100,1h30m".parse().unwrap();
        assert_eq!(test_plan.steps, vec![(100, 5_400_000)]);

        // Missing fields are invalid.
        assert!("10".parse::<TestPlan>().is_err());
        // Negative users are invalid.
        assert!("-1,30s".parse::<TestPlan>().is_err());
        // Non-numeric users are invalid.
        assert!("five,30s".parse::<TestPlan>().is_err());
    }

    #[test]
    fn interpolate_targets() {
        // Ramp to 4 users over 10s, hold 30s, ramp down to 0 over 10s.
        let test_plan: TestPlan = "4,10s;4,30s;0,10s".parse().unwrap();

        // Halfway up the initial ramp, half the users are running.
        assert_eq!(test_plan.target_users_at(5_000), 2);
        // Holding steady.
        assert_eq!(test_plan.target_users_at(20_000), 4);
        // Halfway down the final ramp.
        assert_eq!(test_plan.target_users_at(45_000), 2);
        // The plan is exhausted.
        assert_eq!(test_plan.target_users_at(50_000), 0);
        assert_eq!(test_plan.target_users_at(500_000), 0);

        // Step boundaries belong to the following step.
        assert_eq!(test_plan.target_users_at(0), 0);
        assert_eq!(test_plan.target_users_at(10_000), 4);
        assert_eq!(test_plan.target_users_at(40_000), 4);

        // A zero-duration step is an instant jump.
        let test_plan: TestPlan = "10,0;10,5s".parse().unwrap();
        assert_eq!(test_plan.target_users_at(0), 10);
        assert_eq!(test_plan.target_users_at(2_500), 10);

        // A target of 0 mid-plan drains all users.
        let test_plan: TestPlan = "8,4s;0,4s;8,4s".parse().unwrap();
        assert_eq!(test_plan.target_users_at(6_000), 4);
        assert_eq!(test_plan.target_users_at(8_000), 0);
        assert_eq!(test_plan.target_users_at(10_000), 4);
    }

    #[test]
    fn plan_totals() {
        let test_plan: TestPlan = "4,10s;4,30s;0,10s".parse().unwrap();
        assert_eq!(test_plan.total_users(), 4);
        assert_eq!(test_plan.maximum_users(), 4);
        assert_eq!(test_plan.total_duration(), 50_000);

        // Users retired and then relaunched are spawned twice.
        let test_plan: TestPlan = "8,4s;0,4s;8,4s".parse().unwrap();
        assert_eq!(test_plan.total_users(), 16);
        assert_eq!(test_plan.maximum_users(), 8);
        assert_eq!(test_plan.total_duration(), 12_000);

        let empty = TestPlan::new();
        assert_eq!(empty.total_users(), 0);
        assert_eq!(empty.maximum_users(), 0);
        assert_eq!(empty.total_duration(), 0);
    }
}
