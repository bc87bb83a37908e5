//! # Surge
//!
//! Surge is a staged load testing engine. Traffic is defined with standard
//! Rust code: each traffic flow is an async scenario function, weighted with
//! the share of iterations it should receive, and a test plan ramps a pool of
//! virtual users up and down over the life of the run. Metrics stream into
//! name-keyed counter, rate and trend aggregates, and configured thresholds
//! turn the final aggregates into a pass/fail verdict.
//!
//! Surge uses [`reqwest`](https://docs.rs/reqwest/) to provide a convenient
//! HTTP client, though scenario functions are free to drive any client they
//! close over.
//!
//! ## Creating a load test
//!
//! Add the following boilerplate `use` declaration at the top of your
//! `src/main.rs`:
//!
//! ```rust
//! use surge::prelude::*;
//! ```
//!
//! Scenario functions must be async, accept a mutable reference to a
//! [`SurgeUser`](./surge/struct.SurgeUser.html), and return a
//! [`ScenarioResult`](./surge/type.ScenarioResult.html). For example:
//!
//! ```rust
//! use surge::prelude::*;
//!
//! async fn search_claims(user: &mut SurgeUser) -> ScenarioResult {
//!     let _response = user.get("/claims/search?status=open").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Register the scenarios, weight them, and gate the run on thresholds:
//!
//! ```rust,no_run
//! use surge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SurgeError> {
//!     let run_result = SurgeAttack::initialize()?
//!         // 70% of iterations run the search flow.
//!         .register_scenario(scenario!(search_claims).set_probability(0.7)?)
//!         // 30% of iterations fetch a single claim.
//!         .register_scenario(scenario!(fetch_claim).set_probability(0.3)?)
//!         // The run fails unless the 95th percentile stays under a second.
//!         .register_threshold("request_time: p95 < 1000".parse()?)
//!         .register_threshold("request_success: rate >= 0.99".parse()?)
//!         .execute()
//!         .await?;
//!
//!     // Exit code 0 only when setup succeeded and every threshold passed.
//!     if !run_result.passed {
//!         std::process::exit(1);
//!     }
//!     Ok(())
//! }
//!
//! async fn search_claims(user: &mut SurgeUser) -> ScenarioResult {
//!     let _response = user.get("/claims/search?status=open").await?;
//!
//!     Ok(())
//! }
//!
//! async fn fetch_claim(user: &mut SurgeUser) -> ScenarioResult {
//!     let _response = user.get_named("/claims/1001", "GET /claims/:id").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Running the load test
//!
//! The target host and the load shape are configured at run time:
//!
//! ```bash
//! $ cargo run --release -- --host http://dev.local -u 8 -t 5m
//! ```
//!
//! ramps to 8 users and runs for five minutes, while
//!
//! ```bash
//! $ cargo run --release -- --host http://dev.local --test-plan "20,30s;20,10m;0,30s"
//! ```
//!
//! ramps to 20 users over 30 seconds, holds them for ten minutes, and ramps
//! back down. Pass `-h` to see all run-time options.
//!
//! When the final stage's duration has elapsed the remaining users drain, the
//! aggregates freeze, and Surge prints the metric tables and per-threshold
//! outcomes before returning the
//! [`RunResult`](./threshold/struct.RunResult.html).
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0
//! (<http://www.apache.org/licenses/LICENSE-2.0>). Distributed on an "AS IS"
//! BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND.

#[macro_use]
extern crate log;

pub mod config;
pub mod metrics;
pub mod plan;
pub mod prelude;
pub mod surge;
pub mod threshold;
mod user;
pub mod util;

use chrono::prelude::*;
use gumdrop::Options;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{self, Duration};
use std::{fmt, io};
use url::Url;

use crate::config::{SurgeConfiguration, SurgeDefaults};
use crate::metrics::{SurgeMetric, SurgeMetrics};
use crate::plan::{TestPlan, TestPlanHistory, TestPlanStepAction};
use crate::surge::{DispatchTable, Scenario, SurgeUser};
use crate::threshold::{RunResult, Threshold};
use crate::user::UserCommand;

/// How often the parent loop converges the active user set on the test plan's
/// target, in milliseconds.
const SCHEDULER_TICK: u64 = 250;

/// An enumeration of all errors a [`SurgeAttack`](./struct.SurgeAttack.html) can return.
#[derive(Debug)]
pub enum SurgeError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid think time specified.
    InvalidThinkTime {
        // The specified minimum think time, in milliseconds.
        min: usize,
        // The specified maximum think time, in milliseconds.
        max: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid scenario probability specified.
    InvalidProbability {
        // The specified (or accumulated) probability.
        probability: f64,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid threshold expression specified.
    InvalidThreshold {
        /// The invalid threshold expression that caused this error.
        threshold: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`SurgeAttack`](./struct.SurgeAttack.html) has no [`Scenario`](./surge/struct.Scenario.html) defined.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
    /// The test_start scenario failed, aborting the load test before any
    /// virtual user spawned.
    SetupFailed {
        /// An explanation of the failure.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl SurgeError {
    fn describe(&self) -> &str {
        match *self {
            SurgeError::Io(_) => "io::Error",
            SurgeError::Reqwest(_) => "reqwest::Error",
            SurgeError::TokioJoin(_) => "tokio::task::JoinError",
            SurgeError::InvalidHost { .. } => "failed to parse hostname",
            SurgeError::InvalidOption { .. } => "invalid option or value specified",
            SurgeError::InvalidThinkTime { .. } => "invalid think time specified",
            SurgeError::InvalidProbability { .. } => "invalid scenario probability specified",
            SurgeError::InvalidThreshold { .. } => "invalid threshold expression specified",
            SurgeError::NoScenarios { .. } => "no scenarios defined",
            SurgeError::SetupFailed { .. } => "test_start scenario failed",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for SurgeError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SurgeError::Io(ref source) => write!(f, "SurgeError: {} ({})", self.describe(), source),
            SurgeError::Reqwest(ref source) => {
                write!(f, "SurgeError: {} ({})", self.describe(), source)
            }
            SurgeError::TokioJoin(ref source) => {
                write!(f, "SurgeError: {} ({})", self.describe(), source)
            }
            SurgeError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "SurgeError: {} ({})", self.describe(), parse_error),
            SurgeError::SetupFailed { ref detail } => {
                write!(f, "SurgeError: {} ({})", self.describe(), detail)
            }
            _ => write!(f, "SurgeError: {}", self.describe()),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for SurgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            SurgeError::Io(ref source) => Some(source),
            SurgeError::Reqwest(ref source) => Some(source),
            SurgeError::TokioJoin(ref source) => Some(source),
            SurgeError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for SurgeError {
    fn from(err: reqwest::Error) -> SurgeError {
        SurgeError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for SurgeError {
    fn from(err: io::Error) -> SurgeError {
        SurgeError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for SurgeError {
    fn from(err: tokio::task::JoinError) -> SurgeError {
        SurgeError::TokioJoin(err)
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A [`SurgeAttack`](./struct.SurgeAttack.html) load test moves through each
/// of the following phases as its test plan steps begin and end.
pub enum AttackPhase {
    /// No load test is running.
    Idle,
    /// The current test plan step is ramping the number of users up.
    Increase,
    /// The current test plan step is holding the number of users steady.
    Maintain,
    /// The current test plan step is ramping the number of users down.
    Decrease,
    /// The test plan is exhausted or canceled and all users are draining.
    Stopping,
    /// Exiting the load test.
    Shutdown,
}

// Internal run state for an active load test.
pub(crate) struct SurgeAttackRunState {
    /// This variable accounts for time spent doing things which is then
    /// subtracted from the time sleeping to avoid an unintentional drift in
    /// events that are supposed to happen regularly.
    drift_timer: tokio::time::Instant,
    /// Unbounded sender cloned into every virtual user to report metrics to
    /// the parent.
    all_threads_metrics_tx: flume::Sender<SurgeMetric>,
    /// Unbounded receiver used by the parent to fold metrics into aggregates.
    metrics_rx: flume::Receiver<SurgeMetric>,
    /// Collection of all virtual user threads so they can be joined later.
    users: Vec<tokio::task::JoinHandle<()>>,
    /// All unbounded senders to allow communication with virtual user
    /// threads. The parent loop is the only mutator of this set.
    user_channels: Vec<flume::Sender<UserCommand>>,
    /// A counter tracking which virtual user is being spawned.
    spawn_user_counter: usize,
    /// Timer tracking when to display running metrics, if enabled.
    running_metrics_timer: time::Instant,
    /// The host being load tested, parsed once at startup.
    base_url: Url,
    /// Thread-safe boolean flag indicating if the load test has been canceled.
    canceled: Arc<AtomicBool>,
}

/// Global internal state for the load test.
pub struct SurgeAttack {
    /// An optional scenario run one time before the first test plan step.
    test_start_scenario: Option<Scenario>,
    /// An optional scenario run one time after all users have drained.
    test_stop_scenario: Option<Scenario>,
    /// Every scenario registered with this load test, in declaration order.
    scenarios: Vec<Scenario>,
    /// Every threshold the final aggregates are evaluated against.
    thresholds: Vec<Threshold>,
    /// The randomized pause between each user's iterations, if configured.
    think_time: Option<(Duration, Duration)>,
    /// Optional default values for Surge run-time options.
    pub(crate) defaults: SurgeDefaults,
    /// Configuration object holding options set when launching the load test.
    pub(crate) configuration: SurgeConfiguration,
    /// The ramp steps driving this load test.
    pub(crate) test_plan: TestPlan,
    /// Which phase the load test is currently operating in.
    attack_phase: AttackPhase,
    /// When the load test started.
    pub(crate) started: Option<time::Instant>,
    /// When the current test plan step started.
    pub(crate) step_started: Option<time::Instant>,
    /// All metrics merged together.
    pub(crate) metrics: SurgeMetrics,
}
/// Surge's internal global state.
impl SurgeAttack {
    /// Load configuration from command line and initialize a
    /// [`SurgeAttack`](./struct.SurgeAttack.html).
    ///
    /// # Example
    /// ```rust
    /// use surge::prelude::*;
    ///
    /// let surge_attack = SurgeAttack::initialize();
    /// ```
    pub fn initialize() -> Result<SurgeAttack, SurgeError> {
        Ok(SurgeAttack {
            test_start_scenario: None,
            test_stop_scenario: None,
            scenarios: Vec::new(),
            thresholds: Vec::new(),
            think_time: None,
            defaults: SurgeDefaults::default(),
            configuration: SurgeConfiguration::parse_args_default_or_exit(),
            test_plan: TestPlan::new(),
            attack_phase: AttackPhase::Idle,
            started: None,
            step_started: None,
            metrics: SurgeMetrics::default(),
        })
    }

    /// Initialize a [`SurgeAttack`](./struct.SurgeAttack.html) with an
    /// already loaded configuration.
    ///
    /// This is generally used by tests.
    pub fn initialize_with_config(
        configuration: SurgeConfiguration,
    ) -> Result<SurgeAttack, SurgeError> {
        Ok(SurgeAttack {
            test_start_scenario: None,
            test_stop_scenario: None,
            scenarios: Vec::new(),
            thresholds: Vec::new(),
            think_time: None,
            defaults: SurgeDefaults::default(),
            configuration,
            test_plan: TestPlan::new(),
            attack_phase: AttackPhase::Idle,
            started: None,
            step_started: None,
            metrics: SurgeMetrics::default(),
        })
    }

    /// A load test must contain one or more [`Scenario`](./surge/struct.Scenario.html)s.
    ///
    /// # Example
    /// ```rust
    /// use surge::prelude::*;
    ///
    /// fn main() -> Result<(), SurgeError> {
    ///     let surge_attack = SurgeAttack::initialize()?
    ///         .register_scenario(scenario!(browse).set_probability(0.9)?)
    ///         .register_scenario(scenario!(checkout).set_probability(0.1)?);
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn browse(user: &mut SurgeUser) -> ScenarioResult {
    ///     let _response = user.get("/catalog").await?;
    ///
    ///     Ok(())
    /// }
    ///
    /// async fn checkout(user: &mut SurgeUser) -> ScenarioResult {
    ///     let _response = user.post("/cart/checkout", "{}".to_string()).await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn register_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Gate the run's verdict on a [`Threshold`](./threshold/struct.Threshold.html).
    ///
    /// Thresholds can also be configured at run time with
    /// `--threshold "metric: statistic comparator limit"`.
    pub fn register_threshold(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    /// Define a scenario to run one time before the first test plan step.
    ///
    /// If the scenario returns an error the entire load test aborts with
    /// [`SurgeError::SetupFailed`] before any virtual user spawns.
    pub fn test_start(mut self, scenario: Scenario) -> Self {
        self.test_start_scenario = Some(scenario);
        self
    }

    /// Define a scenario to run one time after the last user has drained.
    ///
    /// A failure in this scenario is logged but never affects the verdict.
    pub fn test_stop(mut self, scenario: Scenario) -> Self {
        self.test_stop_scenario = Some(scenario);
        self
    }

    /// Configure how long each user pauses between iterations, drawn
    /// uniformly from the min..=max range.
    ///
    /// Can also be configured at run time with `--think-time-min` and
    /// `--think-time-max` (in milliseconds); this programmatic value wins.
    pub fn set_think_time(mut self, min: Duration, max: Duration) -> Result<Self, SurgeError> {
        if min > max {
            return Err(SurgeError::InvalidThinkTime {
                min: min.as_millis() as usize,
                max: max.as_millis() as usize,
                detail: "minimum think time can not be larger than maximum think time".to_string(),
            });
        }
        self.think_time = Some((min, max));
        Ok(self)
    }

    // Change the attack phase, resetting the drift timer.
    pub(crate) fn set_attack_phase(
        &mut self,
        run_state: &mut SurgeAttackRunState,
        phase: AttackPhase,
    ) {
        // There's nothing to do if already in the specified phase.
        if self.attack_phase == phase {
            return;
        }
        // The drift timer starts at 0 any time the phase changes.
        run_state.drift_timer = tokio::time::Instant::now();
        info!("entering {:?} phase", phase);
        self.attack_phase = phase;
    }

    // If metrics are being displayed, update how long the load test has run.
    pub(crate) fn update_duration(&mut self) {
        if let Some(started) = self.started {
            self.metrics.duration = started.elapsed().as_secs() as usize;
        }
    }

    /// Execute the load test, consuming the builder and returning the
    /// [`RunResult`](./threshold/struct.RunResult.html) exactly once at
    /// shutdown.
    ///
    /// Configuration validation failures and a failing test_start scenario
    /// abort before any user spawns; threshold failures do not error, they
    /// fail the returned verdict.
    pub async fn execute(mut self) -> Result<RunResult, SurgeError> {
        // If version flag is set, display the version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // Merge programmatic defaults into the configuration.
        self.configuration.configure(&self.defaults);

        // Initialize the logger as early as possible so validation failures
        // are visible.
        self.configuration.initialize_logger();

        // At least one scenario is required to generate load.
        if self.scenarios.is_empty() {
            return Err(SurgeError::NoScenarios {
                detail: "No scenarios are registered.".to_string(),
            });
        }

        // Reject invalid and contradictory options before anything starts.
        self.configuration.validate()?;

        // Thresholds configured as strings join programmatic registrations.
        let mut configured_thresholds = self.configuration.thresholds()?;
        self.thresholds.append(&mut configured_thresholds);

        // The programmatic think time wins over the configured one.
        if self.think_time.is_none() {
            self.think_time = self.configuration.think_time();
        }

        // Fall back to one user per available CPU when nothing defines the
        // user count.
        if self.configuration.users.is_none() && self.configuration.test_plan.is_none() {
            let users = std::thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(1);
            info!("concurrent users defaulted to {} (number of CPUs)", users);
            self.configuration.users = Some(users);
        }

        // Convert the configuration to the internal test plan representation.
        self.test_plan = TestPlan::build(&self.configuration);
        if self.test_plan.steps.is_empty() {
            return Err(SurgeError::InvalidOption {
                option: "--test-plan".to_string(),
                value: "".to_string(),
                detail: "A test plan must be defined via the --test-plan option, or --users together with --startup-time, --hatch-rate and/or --run-time.".to_string(),
            });
        }
        info!(
            "test plan: {} steps over {} seconds, {} maximum users",
            self.test_plan.steps.len(),
            self.test_plan.total_duration() / 1_000,
            self.test_plan.maximum_users(),
        );

        // Build the dispatch table once, validating scenario probabilities.
        let dispatch = Arc::new(DispatchTable::new(self.scenarios.clone())?);

        let mut run_state = self.initialize_attack()?;
        info!("host configured: {}", run_state.base_url);

        // Run the test_start scenario; a failure aborts the entire run before
        // any virtual user spawns.
        self.run_test_start(&run_state).await?;

        // Record when the load test officially started.
        self.started = Some(time::Instant::now());
        self.metrics.started = Some(Local::now());
        self.advance_test_plan(&mut run_state);

        // The parent loop runs until the test plan is exhausted or the load
        // test is canceled.
        loop {
            match self.attack_phase {
                AttackPhase::Increase | AttackPhase::Maintain | AttackPhase::Decrease => {
                    self.update_duration();
                    // Converge the active user set on the interpolated target.
                    self.converge_users(&dispatch, &mut run_state)?;

                    // Advance to the next step once this one's duration elapses.
                    let step_duration = self.test_plan.steps[self.test_plan.current - 1].1;
                    if let Some(step_started) = self.step_started {
                        if util::ms_timer_expired(step_started, step_duration) {
                            self.advance_test_plan(&mut run_state);
                        }
                    }

                    run_state.drift_timer = util::sleep_minus_drift(
                        Duration::from_millis(SCHEDULER_TICK),
                        run_state.drift_timer,
                    )
                    .await;
                }
                AttackPhase::Stopping => {
                    self.update_duration();
                    // Tell all running users to stop, and wait for them to
                    // finish their current iteration and exit.
                    self.stop_running_users(&mut run_state).await;
                    self.set_attack_phase(&mut run_state, AttackPhase::Shutdown);
                }
                // By reaching the Shutdown phase, break out of the loop.
                AttackPhase::Shutdown => break,
                AttackPhase::Idle => {
                    // The test plan advanced out of Idle before the loop started.
                    unreachable!("load test can not idle mid-run");
                }
            }

            // Fold in any metrics sent since the last tick.
            self.receive_metrics(&mut run_state);

            // If enabled, periodically print interim metrics.
            if let Some(running_metrics) = self.configuration.running_metrics {
                if util::timer_expired(run_state.running_metrics_timer, running_metrics) {
                    run_state.running_metrics_timer = time::Instant::now();
                    info!(
                        "printing running metrics after {} seconds...",
                        self.metrics.duration
                    );
                    println!("{}", self.metrics);
                }
            }

            // Gracefully stop the load test if ctrl-c was caught.
            if self.attack_phase != AttackPhase::Shutdown
                && run_state.canceled.load(Ordering::SeqCst)
            {
                self.metrics
                    .history
                    .push(TestPlanHistory::step(TestPlanStepAction::Canceling, 0));
                self.set_attack_phase(&mut run_state, AttackPhase::Stopping);
            }
        }

        self.update_duration();
        self.metrics.stopped = Some(Local::now());

        // Teardown runs after the full drain and never affects the verdict.
        self.run_test_stop(&run_state).await;
        self.receive_metrics(&mut run_state);

        // The aggregates are final: freeze them into the run result and
        // evaluate the configured thresholds.
        let run_result = RunResult::new(std::mem::take(&mut self.metrics), &self.thresholds);

        if !self.configuration.no_print_metrics {
            println!("{}", run_result);
        }

        // If enabled, write a json report of the run.
        self.write_report_file(&run_result).await?;

        Ok(run_result)
    }

    // Create a SurgeAttackRunState and do all initialization required to
    // start the load test.
    fn initialize_attack(&mut self) -> Result<SurgeAttackRunState, SurgeError> {
        trace!("initialize_attack");

        // Create a single channel used by all virtual users to send metrics
        // to the parent.
        let (all_threads_metrics_tx, metrics_rx): (
            flume::Sender<SurgeMetric>,
            flume::Receiver<SurgeMetric>,
        ) = flume::unbounded();

        // The host is read once and parsed once.
        let base_url =
            Url::parse(&self.configuration.host).map_err(|parse_error| SurgeError::InvalidHost {
                host: self.configuration.host.clone(),
                detail: "Invalid host.".to_string(),
                parse_error,
            })?;

        let run_state = SurgeAttackRunState {
            drift_timer: tokio::time::Instant::now(),
            all_threads_metrics_tx,
            metrics_rx,
            users: Vec::new(),
            user_channels: Vec::new(),
            spawn_user_counter: 0,
            running_metrics_timer: time::Instant::now(),
            base_url,
            canceled: Arc::new(AtomicBool::new(false)),
        };

        // Catch ctrl-c to allow clean shutdown and a final summary.
        util::setup_ctrlc_handler(&run_state.canceled);

        Ok(run_state)
    }

    // Spawn or retire virtual users until the active set matches the test
    // plan's interpolated target. This is the only place the active user set
    // is mutated.
    fn converge_users(
        &mut self,
        dispatch: &Arc<DispatchTable>,
        run_state: &mut SurgeAttackRunState,
    ) -> Result<(), SurgeError> {
        let elapsed = match self.started {
            Some(started) => started.elapsed().as_millis() as usize,
            None => 0,
        };
        let target = self.test_plan.target_users_at(elapsed);
        let active = run_state.user_channels.len();

        if target > active {
            for _ in 0..(target - active) {
                // We number users from 1 as they're human-visible in the logs.
                run_state.spawn_user_counter += 1;

                let mut user = SurgeUser::new(
                    run_state.spawn_user_counter,
                    run_state.base_url.clone(),
                    self.think_time,
                    &self.configuration,
                )?;
                // Copy the user-to-parent sender channel, used by all users.
                user.metrics_tx = Some(run_state.all_threads_metrics_tx.clone());

                // Create a per-user channel allowing the parent to control the user.
                let (parent_sender, user_receiver): (
                    flume::Sender<UserCommand>,
                    flume::Receiver<UserCommand>,
                ) = flume::unbounded();
                run_state.user_channels.push(parent_sender);

                // Launch a new user.
                run_state.users.push(tokio::spawn(user::user_main(
                    run_state.spawn_user_counter,
                    Arc::clone(dispatch),
                    user,
                    user_receiver,
                )));
                self.metrics.total_users += 1;
            }
            // Track the largest number of users running at any one time.
            if run_state.user_channels.len() > self.metrics.maximum_users {
                self.metrics.maximum_users = run_state.user_channels.len();
            }
        } else if active > target {
            // Retire the most recently spawned users first. Cancellation is
            // cooperative: each user finishes its current iteration.
            for _ in 0..(active - target) {
                if let Some(send_to_user) = run_state.user_channels.pop() {
                    match send_to_user.send(UserCommand::Exit) {
                        Ok(_) => debug!("telling a user to exit"),
                        Err(e) => info!("failed to tell a user to exit: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    // Tell all remaining users to exit, and wait for every spawned user to
    // finish its current iteration and drain.
    async fn stop_running_users(&mut self, run_state: &mut SurgeAttackRunState) {
        info!("stopping after {} seconds...", self.metrics.duration);
        for (index, send_to_user) in run_state.user_channels.iter().enumerate() {
            match send_to_user.send(UserCommand::Exit) {
                Ok(_) => {
                    debug!("telling user {} to exit", index);
                }
                Err(e) => {
                    info!("failed to tell user {} to exit: {}", index, e);
                }
            }
        }
        run_state.user_channels.clear();
        info!("waiting for users to exit");

        // Take the users vector out of the run state so it can be consumed by
        // futures::future::join_all().
        let users = std::mem::take(&mut run_state.users);
        futures::future::join_all(users).await;
        debug!("all users exited");
    }

    // Fold all queued metric messages into the aggregates.
    fn receive_metrics(&mut self, run_state: &mut SurgeAttackRunState) {
        while let Ok(message) = run_state.metrics_rx.try_recv() {
            self.metrics.record(message);
        }
    }

    // Invoke the test_start scenario, if defined. A failure aborts the run.
    async fn run_test_start(&self, run_state: &SurgeAttackRunState) -> Result<(), SurgeError> {
        match &self.test_start_scenario {
            Some(scenario) => {
                info!("running test_start scenario {}", scenario.name);
                // Create a one-time-use user to run the test_start scenario.
                let mut user = SurgeUser::single(run_state.base_url.clone(), &self.configuration)?;
                user.metrics_tx = Some(run_state.all_threads_metrics_tx.clone());
                let function = &scenario.function;
                if let Err(e) = function(&mut user).await {
                    return Err(SurgeError::SetupFailed {
                        detail: format!("test_start scenario {} failed: {}", scenario.name, e),
                    });
                }
            }
            // No test_start scenario defined, nothing to do.
            None => (),
        }

        Ok(())
    }

    // Invoke the test_stop scenario, if defined. Failures are logged and
    // never affect the verdict.
    async fn run_test_stop(&self, run_state: &SurgeAttackRunState) {
        match &self.test_stop_scenario {
            Some(scenario) => {
                info!("running test_stop scenario {}", scenario.name);
                // Create a one-time-use user to run the test_stop scenario.
                let user = SurgeUser::single(run_state.base_url.clone(), &self.configuration);
                match user {
                    Ok(mut user) => {
                        user.metrics_tx = Some(run_state.all_threads_metrics_tx.clone());
                        let function = &scenario.function;
                        if let Err(e) = function(&mut user).await {
                            warn!("test_stop scenario {} failed: {}", scenario.name, e);
                        }
                    }
                    Err(e) => {
                        warn!("failed to build user for test_stop scenario: {}", e);
                    }
                }
            }
            // No test_stop scenario defined, nothing to do.
            None => (),
        }
    }

    // If enabled, write a json-formatted report of the run result.
    async fn write_report_file(&self, run_result: &RunResult) -> Result<(), SurgeError> {
        if self.configuration.report_file.is_empty() {
            return Ok(());
        }

        let report = serde_json::to_string_pretty(run_result).map_err(|e| {
            SurgeError::InvalidOption {
                option: "--report-file".to_string(),
                value: self.configuration.report_file.clone(),
                detail: format!("failed to serialize report: {}", e),
            }
        })?;
        tokio::fs::write(&self.configuration.report_file, report).await?;
        info!("wrote report file: {}", self.configuration.report_file);

        Ok(())
    }
}
