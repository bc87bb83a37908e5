//! Functions and structures related to configuring a Surge load test.
//!
//! Surge can be configured at run time by passing in the options and flags
//! defined by the [`SurgeConfiguration`] structure, and programmatically with
//! [`SurgeDefaultType::set_default`]. Run-time options always win over
//! programmatic defaults.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::time::Duration;

use crate::plan::TestPlan;
use crate::threshold::Threshold;
use crate::util;
use crate::{SurgeAttack, SurgeError};

/// Runtime options available when launching a Surge load test.
///
/// Surge leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the help
/// displayed with `-h` from the structure below.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Surge is a staged load testing engine: scenarios are weighted traffic flows,
a test plan ramps virtual users up and down, and thresholds gate the verdict.

The following runtime options are available when launching a Surge load test:"#
)]
pub struct SurgeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Sets an opaque API key scenarios can read from their configuration
    #[options(no_short, meta = "KEY")]
    pub api_key: Option<String>,
    /// Sets concurrent users (default: number of CPUs)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Starts users for up to (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "s", meta = "TIME")]
    pub startup_time: String,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Defines ramp steps explicitly ("users,timespan;users,timespan")
    #[options(no_short, meta = "PLAN")]
    pub test_plan: Option<TestPlan>,
    /// Sets minimum milliseconds users pause between iterations
    #[options(no_short, meta = "MS")]
    pub think_time_min: Option<usize>,
    /// Sets maximum milliseconds users pause between iterations
    #[options(no_short, meta = "MS")]
    pub think_time_max: Option<usize>,
    /// Sets per-request timeout, in seconds
    #[options(no_short, meta = "VALUE")]
    pub timeout: Option<String>,
    /// Adds a pass/fail threshold ("metric: statistic comparator limit")
    #[options(no_short, meta = "EXPR")]
    pub threshold: Vec<String>,

    /// How often to optionally print running metrics, in seconds
    #[options(no_short, meta = "TIME")]
    pub running_metrics: Option<usize>,
    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Create a json-formatted report file of the run result
    #[options(no_short, meta = "NAME")]
    pub report_file: String,
    /// Enables Surge log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub surge_log: String,
    /// Increases Surge log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Surge verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases Surge verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// All run-time options that can be configured with custom defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurgeDefault {
    /// An optional default host to run this load test against.
    Host,
    /// An optional default API key made available to scenarios.
    ApiKey,
    /// An optional default number of users to simulate.
    Users,
    /// An optional default number of users to start per second.
    HatchRate,
    /// An optional default timespan for starting users.
    StartupTime,
    /// An optional default timespan for how long the load test runs.
    RunTime,
    /// An optional default test plan.
    TestPlan,
    /// An optional default minimum think time, in milliseconds.
    ThinkTimeMin,
    /// An optional default maximum think time, in milliseconds.
    ThinkTimeMax,
    /// An optional default per-request timeout, in seconds.
    Timeout,
    /// An optional default threshold expression; repeatable.
    Threshold,
    /// An optional default for how often to print running metrics.
    RunningMetrics,
    /// An optional default for not displaying metrics at the end.
    NoPrintMetrics,
    /// An optional default name for a json report file.
    ReportFile,
    /// An optional default name for the Surge log file.
    SurgeLog,
    /// An optional default log level for the Surge log file.
    LogLevel,
    /// An optional default to reduce console verbosity.
    Quiet,
    /// An optional default to increase console verbosity.
    Verbose,
}

/// Programmatic defaults, merged into the configuration for every option not
/// set at run time.
#[derive(Debug, Clone, Default)]
pub struct SurgeDefaults {
    host: Option<String>,
    api_key: Option<String>,
    users: Option<usize>,
    hatch_rate: Option<String>,
    startup_time: Option<String>,
    run_time: Option<String>,
    test_plan: Option<TestPlan>,
    think_time_min: Option<usize>,
    think_time_max: Option<usize>,
    timeout: Option<String>,
    thresholds: Option<Vec<String>>,
    running_metrics: Option<usize>,
    no_print_metrics: Option<bool>,
    report_file: Option<String>,
    surge_log: Option<String>,
    log_level: Option<u8>,
    quiet: Option<u8>,
    verbose: Option<u8>,
}

/// A helper trait to set multiple types of programmatic defaults.
///
/// # Example
/// ```rust
/// use surge::prelude::*;
///
/// fn main() -> Result<(), SurgeError> {
///     let surge_attack = SurgeAttack::initialize()?
///         .set_default(SurgeDefault::Host, "http://dev.local/")?
///         .set_default(SurgeDefault::Users, 10)?
///         .set_default(SurgeDefault::RunTime, "5m")?;
///
///     Ok(())
/// }
/// ```
pub trait SurgeDefaultType<T> {
    /// Store a default value for the option named by `key`.
    fn set_default(self, key: SurgeDefault, value: T) -> Result<Box<Self>, SurgeError>;
}

impl SurgeDefaultType<&str> for SurgeAttack {
    fn set_default(mut self, key: SurgeDefault, value: &str) -> Result<Box<Self>, SurgeError> {
        match key {
            SurgeDefault::Host => self.defaults.host = Some(value.to_string()),
            SurgeDefault::ApiKey => self.defaults.api_key = Some(value.to_string()),
            SurgeDefault::HatchRate => self.defaults.hatch_rate = Some(value.to_string()),
            SurgeDefault::StartupTime => self.defaults.startup_time = Some(value.to_string()),
            SurgeDefault::RunTime => self.defaults.run_time = Some(value.to_string()),
            SurgeDefault::TestPlan => self.defaults.test_plan = Some(value.parse()?),
            SurgeDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            SurgeDefault::Threshold => {
                // Validate now so a bad default fails at configuration time.
                value.parse::<Threshold>()?;
                self.defaults
                    .thresholds
                    .get_or_insert_with(Vec::new)
                    .push(value.to_string());
            }
            SurgeDefault::ReportFile => self.defaults.report_file = Some(value.to_string()),
            SurgeDefault::SurgeLog => self.defaults.surge_log = Some(value.to_string()),
            _ => {
                return Err(SurgeError::InvalidOption {
                    option: format!("SurgeDefault::{:?}", key),
                    value: value.to_string(),
                    detail: format!("`SurgeDefault::{:?}` can not be set to a &str.", key),
                })
            }
        }
        Ok(Box::new(self))
    }
}

impl SurgeDefaultType<usize> for SurgeAttack {
    fn set_default(mut self, key: SurgeDefault, value: usize) -> Result<Box<Self>, SurgeError> {
        match key {
            SurgeDefault::Users => self.defaults.users = Some(value),
            SurgeDefault::ThinkTimeMin => self.defaults.think_time_min = Some(value),
            SurgeDefault::ThinkTimeMax => self.defaults.think_time_max = Some(value),
            SurgeDefault::RunningMetrics => self.defaults.running_metrics = Some(value),
            SurgeDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            SurgeDefault::Quiet => self.defaults.quiet = Some(value as u8),
            SurgeDefault::Verbose => self.defaults.verbose = Some(value as u8),
            _ => {
                return Err(SurgeError::InvalidOption {
                    option: format!("SurgeDefault::{:?}", key),
                    value: value.to_string(),
                    detail: format!("`SurgeDefault::{:?}` can not be set to a usize.", key),
                })
            }
        }
        Ok(Box::new(self))
    }
}

impl SurgeDefaultType<bool> for SurgeAttack {
    fn set_default(mut self, key: SurgeDefault, value: bool) -> Result<Box<Self>, SurgeError> {
        match key {
            SurgeDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            _ => {
                return Err(SurgeError::InvalidOption {
                    option: format!("SurgeDefault::{:?}", key),
                    value: value.to_string(),
                    detail: format!("`SurgeDefault::{:?}` can not be set to a bool.", key),
                })
            }
        }
        Ok(Box::new(self))
    }
}

impl SurgeConfiguration {
    /// Merge programmatic defaults into every option not set at run time.
    pub(crate) fn configure(&mut self, defaults: &SurgeDefaults) {
        if self.host.is_empty() {
            if let Some(host) = defaults.host.clone() {
                self.host = host;
            }
        }
        if self.api_key.is_none() {
            self.api_key = defaults.api_key.clone();
        }
        if self.users.is_none() {
            self.users = defaults.users;
        }
        if self.hatch_rate.is_none() {
            self.hatch_rate = defaults.hatch_rate.clone();
        }
        if self.startup_time.is_empty() {
            self.startup_time = defaults
                .startup_time
                .clone()
                .unwrap_or_else(|| "0".to_string());
        }
        if self.run_time.is_empty() {
            self.run_time = defaults.run_time.clone().unwrap_or_else(|| "0".to_string());
        }
        if self.test_plan.is_none() {
            self.test_plan = defaults.test_plan.clone();
        }
        if self.think_time_min.is_none() {
            self.think_time_min = defaults.think_time_min;
        }
        if self.think_time_max.is_none() {
            self.think_time_max = defaults.think_time_max;
        }
        if self.timeout.is_none() {
            self.timeout = defaults.timeout.clone();
        }
        if self.threshold.is_empty() {
            if let Some(thresholds) = defaults.thresholds.clone() {
                self.threshold = thresholds;
            }
        }
        if self.running_metrics.is_none() {
            self.running_metrics = defaults.running_metrics;
        }
        if !self.no_print_metrics {
            self.no_print_metrics = defaults.no_print_metrics.unwrap_or(false);
        }
        if self.report_file.is_empty() {
            if let Some(report_file) = defaults.report_file.clone() {
                self.report_file = report_file;
            }
        }
        if self.surge_log.is_empty() {
            if let Some(surge_log) = defaults.surge_log.clone() {
                self.surge_log = surge_log;
            }
        }
        if self.log_level == 0 {
            self.log_level = defaults.log_level.unwrap_or(0);
        }
        if self.quiet == 0 {
            self.quiet = defaults.quiet.unwrap_or(0);
        }
        if self.verbose == 0 {
            self.verbose = defaults.verbose.unwrap_or(0);
        }
    }

    /// Resolve the configured think time range, if any.
    ///
    /// Setting only a minimum pauses a fixed amount; setting only a maximum
    /// draws from 0 up to that maximum.
    pub(crate) fn think_time(&self) -> Option<(Duration, Duration)> {
        match (self.think_time_min, self.think_time_max) {
            (None, None) => None,
            (min, max) => {
                let min = min.unwrap_or(0);
                let max = max.unwrap_or(min);
                Some((
                    Duration::from_millis(min as u64),
                    Duration::from_millis(max as u64),
                ))
            }
        }
    }

    /// Parse every `--threshold` expression, rejecting invalid ones before
    /// the load test starts.
    pub(crate) fn thresholds(&self) -> Result<Vec<Threshold>, SurgeError> {
        self.threshold.iter().map(|spec| spec.parse()).collect()
    }

    /// Reject invalid and contradictory options before the load test starts.
    pub(crate) fn validate(&self) -> Result<(), SurgeError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(SurgeError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // A host is always required: scenarios and hooks make requests
        // against it.
        if self.host.is_empty() {
            return Err(SurgeError::InvalidOption {
                option: "`configuration.host`".to_string(),
                value: "".to_string(),
                detail:
                    "A host must be defined via the --host option or `SurgeDefault::Host`."
                        .to_string(),
            });
        }
        util::is_valid_host(&self.host)?;

        // If set, hatch rate must be non-zero.
        if let Some(hatch_rate) = self.hatch_rate.as_ref() {
            match util::get_float_from_string(self.hatch_rate.clone()) {
                Some(value) if value > 0.0 => (),
                _ => {
                    return Err(SurgeError::InvalidOption {
                        option: "`configuration.hatch_rate`".to_string(),
                        value: hatch_rate.to_string(),
                        detail: "`configuration.hatch_rate` must be a number greater than 0."
                            .to_string(),
                    })
                }
            }
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match util::get_float_from_string(self.timeout.clone()) {
                Some(value) if value > 0.0 => (),
                _ => {
                    return Err(SurgeError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be a number greater than 0."
                            .to_string(),
                    })
                }
            }
        }

        // Validate `users`.
        if let Some(users) = self.users.as_ref() {
            if users == &0 {
                return Err(SurgeError::InvalidOption {
                    option: "configuration.users".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` must be set to at least 1.".to_string(),
                });
            }
        }

        // Validate `startup_time`.
        if self.startup_time != "0" && self.hatch_rate.is_some() {
            return Err(SurgeError::InvalidOption {
                option: "`configuration.startup_time`".to_string(),
                value: self.startup_time.to_string(),
                detail:
                    "`configuration.startup_time` can not be set with `configuration.hatch_rate`."
                        .to_string(),
            });
        }

        // Validate `test_plan`.
        if self.test_plan.is_some() {
            // The --users option isn't compatible with --test-plan.
            if let Some(users) = self.users.as_ref() {
                return Err(SurgeError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` can not be set with `configuration.test_plan`."
                        .to_string(),
                });
            }
            // The --startup-time option isn't compatible with --test-plan.
            if self.startup_time != "0" {
                return Err(SurgeError::InvalidOption {
                    option: "`configuration.startup_time`".to_string(),
                    value: self.startup_time.to_string(),
                    detail: "`configuration.startup_time` can not be set with `configuration.test_plan`.".to_string(),
                });
            }
            // The --hatch-rate option isn't compatible with --test-plan.
            if let Some(hatch_rate) = self.hatch_rate.as_ref() {
                return Err(SurgeError::InvalidOption {
                    option: "`configuration.hatch_rate`".to_string(),
                    value: hatch_rate.to_string(),
                    detail:
                        "`configuration.hatch_rate` can not be set with `configuration.test_plan`."
                            .to_string(),
                });
            }
            // The --run-time option isn't compatible with --test-plan.
            if self.run_time != "0" {
                return Err(SurgeError::InvalidOption {
                    option: "`configuration.run_time`".to_string(),
                    value: self.run_time.to_string(),
                    detail:
                        "`configuration.run_time` can not be set with `configuration.test_plan`."
                            .to_string(),
                });
            }
        }

        // Validate the think time range.
        if let (Some(min), Some(max)) = (self.think_time_min, self.think_time_max) {
            if min > max {
                return Err(SurgeError::InvalidThinkTime {
                    min,
                    max,
                    detail:
                        "`configuration.think_time_min` can not be larger than `configuration.think_time_max`."
                            .to_string(),
                });
            }
        }

        // Reject unparseable threshold expressions now, not at run end.
        self.thresholds()?;

        Ok(())
    }

    /// Configure the simplelog-backed logger: console verbosity is keyed off
    /// `-v`/`-q`, and an optional log file is enabled with `-G` at the level
    /// keyed off `-g`.
    pub(crate) fn initialize_logger(&self) {
        // Configure console output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let surge_log: Option<PathBuf> = if !self.surge_log.is_empty() {
            Some(PathBuf::from(&self.surge_log))
        // Otherwise disable the log.
        } else {
            None
        };

        if let Some(log_to_file) = surge_log {
            match CombinedLogger::init(vec![
                SimpleLogger::new(debug_level, Config::default()),
                WriteLogger::new(
                    log_level,
                    Config::default(),
                    std::fs::File::create(&log_to_file).unwrap(),
                ),
            ]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
            info!("Writing to log file: {}", log_to_file.display());
        } else {
            match CombinedLogger::init(vec![SimpleLogger::new(debug_level, Config::default())]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
