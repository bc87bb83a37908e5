//! Pass/fail criteria evaluated against the final metric aggregates.
//!
//! Thresholds are declared before the load test starts, either
//! programmatically or as `--threshold "name: statistic comparator limit"`
//! expressions, and are evaluated once against the frozen aggregates after
//! the terminal stage. The run passes only if every threshold passes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

use crate::metrics::{MetricAggregate, SurgeMetrics};
use crate::SurgeError;

/// The statistic a threshold extracts from a metric aggregate.
///
/// Percentiles, `min`, `max` and `mean` read trend metrics; `rate` reads rate
/// metrics; `count` reads any kind.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Statistic {
    /// Median duration of a trend, in milliseconds.
    P50,
    /// 90th percentile duration of a trend, in milliseconds.
    P90,
    /// 95th percentile duration of a trend, in milliseconds.
    P95,
    /// 99th percentile duration of a trend, in milliseconds.
    P99,
    /// Fastest observation of a trend, in milliseconds.
    Min,
    /// Slowest observation of a trend, in milliseconds.
    Max,
    /// Mean duration of a trend, in milliseconds.
    Mean,
    /// The pass ratio of a rate, 0.0 through 1.0.
    Rate,
    /// Total observations of any metric kind.
    Count,
}
impl Statistic {
    // Read this statistic out of an aggregate, if the kinds are compatible.
    fn extract(&self, aggregate: &MetricAggregate) -> Option<f64> {
        match aggregate {
            MetricAggregate::Trend(trend) => match self {
                Statistic::P50 => Some(trend.percentile(0.5) as f64),
                Statistic::P90 => Some(trend.percentile(0.9) as f64),
                Statistic::P95 => Some(trend.percentile(0.95) as f64),
                Statistic::P99 => Some(trend.percentile(0.99) as f64),
                Statistic::Min => Some(trend.min_time as f64),
                Statistic::Max => Some(trend.max_time as f64),
                Statistic::Mean => Some(trend.mean()),
                Statistic::Count => Some(trend.counter as f64),
                Statistic::Rate => None,
            },
            MetricAggregate::Rate(rate) => match self {
                Statistic::Rate => Some(rate.rate()),
                Statistic::Count => Some(rate.total_count as f64),
                _ => None,
            },
            MetricAggregate::Counter(counter) => match self {
                Statistic::Count => Some(counter.total as f64),
                _ => None,
            },
        }
    }
}

/// How an observed statistic is compared against a threshold's limit.
///
/// Comparisons are exact: a statistic exactly equal to the limit fails the
/// strict comparators and passes the non-strict ones.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Display, EnumString)]
pub enum Comparator {
    /// The statistic must be strictly less than the limit.
    #[strum(serialize = "<")]
    LessThan,
    /// The statistic must be less than or equal to the limit.
    #[strum(serialize = "<=")]
    LessThanOrEqual,
    /// The statistic must be strictly greater than the limit.
    #[strum(serialize = ">")]
    GreaterThan,
    /// The statistic must be greater than or equal to the limit.
    #[strum(serialize = ">=")]
    GreaterThanOrEqual,
}
impl Comparator {
    fn compare(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparator::LessThan => observed < limit,
            Comparator::LessThanOrEqual => observed <= limit,
            Comparator::GreaterThan => observed > limit,
            Comparator::GreaterThanOrEqual => observed >= limit,
        }
    }
}

/// A single pass/fail criterion over an aggregate metric statistic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// The name of the metric the threshold reads.
    pub metric: String,
    /// Which statistic of the aggregate is compared.
    pub statistic: Statistic,
    /// How the statistic is compared against the limit.
    pub comparator: Comparator,
    /// The configured limit.
    pub limit: f64,
}
impl Threshold {
    /// Define a new threshold.
    ///
    /// # Example
    /// ```rust
    /// use surge::threshold::{Comparator, Statistic, Threshold};
    ///
    /// let threshold = Threshold::new(
    ///     "request_time",
    ///     Statistic::P95,
    ///     Comparator::LessThan,
    ///     1_000.0,
    /// );
    ///
    /// // The string form parses to the same threshold.
    /// assert_eq!(threshold, "request_time: p95 < 1000".parse().unwrap());
    /// ```
    pub fn new(metric: &str, statistic: Statistic, comparator: Comparator, limit: f64) -> Self {
        Threshold {
            metric: metric.to_string(),
            statistic,
            comparator,
            limit,
        }
    }

    // Evaluate this threshold against the final aggregates.
    pub(crate) fn evaluate(&self, metrics: &SurgeMetrics) -> ThresholdResult {
        let aggregate = match metrics.aggregates.get(&self.metric) {
            Some(aggregate) => aggregate,
            // A gate on a metric nothing recorded must not silently pass.
            None => {
                return ThresholdResult::failed(
                    self.clone(),
                    "no samples were recorded for this metric",
                )
            }
        };
        let observed = match self.statistic.extract(aggregate) {
            Some(observed) => observed,
            None => {
                return ThresholdResult::failed(
                    self.clone(),
                    &format!(
                        "the {} statistic can not be read from a {} metric",
                        self.statistic,
                        aggregate.kind()
                    ),
                )
            }
        };

        ThresholdResult {
            passed: self.comparator.compare(observed, self.limit),
            threshold: self.clone(),
            observed: Some(observed),
            reason: None,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {} {} {}",
            self.metric, self.statistic, self.comparator, self.limit
        )
    }
}

/// Implement [`FromStr`] to parse `"name: statistic comparator limit"`
/// threshold expressions, as configured with `--threshold`.
impl FromStr for Threshold {
    type Err = SurgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = Regex::new(
            r"^\s*([^:\s](?:[^:]*[^:\s])?)\s*:\s*(p50|p90|p95|p99|min|max|mean|rate|count)\s*(<=|>=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$",
        )
        .unwrap();
        match re.captures(s) {
            Some(cap) => Ok(Threshold {
                metric: cap[1].to_string(),
                statistic: Statistic::from_str(&cap[2])
                    .expect("failed to convert matched statistic"),
                comparator: Comparator::from_str(&cap[3])
                    .expect("failed to convert matched comparator"),
                limit: cap[4].parse().expect("failed to convert matched limit"),
            }),
            None => Err(SurgeError::InvalidThreshold {
                threshold: s.to_string(),
                detail: "expected format: \"{metric}: {statistic} {comparator} {limit}\", ie \"request_time: p95 < 1000\"".to_string(),
            }),
        }
    }
}

/// The outcome of evaluating one threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThresholdResult {
    /// The threshold that was evaluated.
    pub threshold: Threshold,
    /// The statistic observed, if the metric could be read.
    pub observed: Option<f64>,
    /// Whether this threshold passed.
    pub passed: bool,
    /// Why the threshold could not be evaluated, if it could not.
    pub reason: Option<String>,
}
impl ThresholdResult {
    fn failed(threshold: Threshold, reason: &str) -> Self {
        ThresholdResult {
            threshold,
            observed: None,
            passed: false,
            reason: Some(reason.to_string()),
        }
    }
}
impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let outcome = if self.passed { "PASS" } else { "FAIL" };
        match (&self.observed, &self.reason) {
            (Some(observed), _) => {
                write!(f, " {} {} (observed: {:.2})", outcome, self.threshold, observed)
            }
            (None, Some(reason)) => write!(f, " {} {} ({})", outcome, self.threshold, reason),
            (None, None) => write!(f, " {} {}", outcome, self.threshold),
        }
    }
}

/// The aggregate snapshot, threshold outcomes and overall verdict of one
/// completed load test, produced exactly once at shutdown.
///
/// The process exit contract belongs to the embedding application:
///
/// ```rust,no_run
/// use surge::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<(), SurgeError> {
///     let run_result = SurgeAttack::initialize()?
///         // ... register scenarios and thresholds ...
///         .execute()
///         .await?;
///
///     // Exit code 0 only when every threshold passed.
///     if !run_result.passed {
///         std::process::exit(1);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    /// The final metric aggregates, frozen at shutdown.
    pub metrics: SurgeMetrics,
    /// One outcome for each configured threshold.
    pub thresholds: Vec<ThresholdResult>,
    /// True only when every configured threshold passed.
    pub passed: bool,
}
impl RunResult {
    // Freeze the aggregates and evaluate every configured threshold.
    pub(crate) fn new(metrics: SurgeMetrics, thresholds: &[Threshold]) -> Self {
        let threshold_results: Vec<ThresholdResult> = thresholds
            .iter()
            .map(|threshold| threshold.evaluate(&metrics))
            .collect();
        RunResult {
            passed: threshold_results.iter().all(|result| result.passed),
            metrics,
            thresholds: threshold_results,
        }
    }
}
impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.metrics.fmt(f)?;
        if !self.thresholds.is_empty() {
            writeln!(f, "\n === THRESHOLDS ===")?;
            for result in &self.thresholds {
                writeln!(f, "{}", result)?;
            }
            writeln!(
                f,
                "\n Result: {}",
                if self.passed { "PASSED" } else { "FAILED" }
            )?;
        }
        Ok(())
    }
}
