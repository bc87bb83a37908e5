//! Metrics collected during a load test.
//!
//! Virtual users never mutate aggregates directly: each observation is sent as
//! a [`SurgeMetric`] message over an unbounded channel, and the parent folds
//! messages into per-name [`MetricAggregate`]s. Aggregates are created lazily
//! the first time a name is observed, and are only stable once the load test
//! has reached its terminal state and all users have drained.

use chrono::prelude::*;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::plan::TestPlanHistory;

/// Counter incremented once for every completed scenario iteration.
pub const ITERATIONS: &str = "iterations";
/// Rate tracking whether each scenario iteration succeeded.
pub const ITERATION_SUCCESS: &str = "iteration_success";
/// Trend tracking how long each scenario iteration takes, in milliseconds.
pub const ITERATION_TIME: &str = "iteration_time";
/// Counter incremented once for every request made through a `SurgeUser` helper.
pub const REQUESTS: &str = "requests";
/// Rate tracking whether each helper request returned a success status code.
pub const REQUEST_SUCCESS: &str = "request_success";
/// Trend tracking every helper request's response time, in milliseconds.
pub const REQUEST_TIME: &str = "request_time";
/// Rate fed by `SurgeUser::check`.
pub const CHECKS: &str = "checks";

/// Each observation is sent from a user task to the parent process as one of
/// the following messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SurgeMetric {
    /// A monotonic count, incremented by the included amount.
    Counter {
        /// Which metric is being incremented.
        name: String,
        /// How much to add to the running total.
        amount: usize,
    },
    /// A pass/fail observation, aggregated into a ratio.
    Rate {
        /// Which metric is being observed.
        name: String,
        /// Whether this observation passed.
        pass: bool,
    },
    /// A duration observation, aggregated into a distribution.
    Trend {
        /// Which metric is being observed.
        name: String,
        /// The observed duration, in milliseconds.
        millis: usize,
    },
}

/// Running state for a counter metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterAggregate {
    /// Sum of all recorded increments.
    pub total: usize,
}
impl CounterAggregate {
    pub(crate) fn record(&mut self, amount: usize) {
        self.total += amount;
    }
}

/// Running state for a rate metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateAggregate {
    /// How many observations passed.
    pub pass_count: usize,
    /// How many observations were recorded in total.
    pub total_count: usize,
}
impl RateAggregate {
    pub(crate) fn record(&mut self, pass: bool) {
        if pass {
            self.pass_count += 1;
        }
        self.total_count += 1;
    }

    /// The ratio of passing observations, 0.0 through 1.0.
    pub fn rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.pass_count as f64 / self.total_count as f64
        }
    }

    /// How many observations failed.
    pub fn fail_count(&self) -> usize {
        self.total_count - self.pass_count
    }
}

/// Running state for a trend (duration distribution) metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendAggregate {
    /// Per-duration counters, tracking how often each duration was observed.
    ///
    /// All durations between 1 and 100ms are stored without any rounding.
    /// Durations between 100 and 500ms are rounded to the nearest 10ms.
    /// Durations between 500 and 1000ms are rounded to the nearest 100ms.
    /// Durations larger than 1000ms are rounded to the nearest 1000ms. This
    /// bounds the memory required to track arbitrarily long-running tests.
    pub times: BTreeMap<usize, usize>,
    /// The shortest duration seen so far. This value is not rounded.
    pub min_time: usize,
    /// The longest duration seen so far. This value is not rounded.
    pub max_time: usize,
    /// Total combined duration of all observations.
    pub total_time: usize,
    /// A count of how many observations have been recorded.
    pub counter: usize,
}
impl TrendAggregate {
    /// Track one observed duration, in milliseconds.
    pub(crate) fn record_time(&mut self, time: usize) {
        // Update minimum if this one is fastest yet.
        if self.min_time == 0 || (time > 0 && time < self.min_time) {
            self.min_time = time;
        }

        // Update maximum if this one is slowest yet.
        if time > self.max_time {
            self.max_time = time;
        }

        self.total_time += time;
        self.counter += 1;

        // Round the duration so similar times combine together, bounding the
        // memory required to store the distribution.
        // No rounding for 1-100ms times.
        let rounded_time = if time < 100 {
            time
        }
        // Round to nearest 10 for 100-500ms times.
        else if time < 500 {
            ((time as f64 / 10.0).round() * 10.0) as usize
        }
        // Round to nearest 100 for 500-1000ms times.
        else if time < 1000 {
            ((time as f64 / 100.0).round() * 100.0) as usize
        }
        // Round to nearest 1000 for all larger times.
        else {
            ((time as f64 / 1000.0).round() * 1000.0) as usize
        };

        let counter = match self.times.get(&rounded_time) {
            // We've seen this time before, increment counter.
            Some(c) => *c + 1,
            // First time we've seen this time, initialize counter.
            None => 1,
        };
        self.times.insert(rounded_time, counter);
    }

    /// The mean of all observed durations, in milliseconds.
    pub fn mean(&self) -> f64 {
        if self.counter == 0 {
            0.0
        } else {
            self.total_time as f64 / self.counter as f64
        }
    }

    /// The duration that the requested percent of observations completed
    /// within, in milliseconds.
    ///
    /// Times are stored in rounded buckets, so the result is approximate, but
    /// never reported outside the true observed minimum and maximum.
    pub fn percentile(&self, percent: f64) -> usize {
        if self.counter == 0 {
            return 0;
        }
        let percentile_sample = ((self.counter as f64 * percent).round() as usize).max(1);

        let mut total_count: usize = 0;
        for (value, counter) in &self.times {
            total_count += counter;
            if total_count >= percentile_sample {
                if *value < self.min_time {
                    return self.min_time;
                } else if *value > self.max_time {
                    return self.max_time;
                } else {
                    return *value;
                }
            }
        }
        self.max_time
    }
}

/// Per-name running state, created lazily on first observation.
///
/// The kind is fixed by the first sample recorded against a name; later
/// samples of a conflicting kind are dropped with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricAggregate {
    /// The name accumulated counter samples.
    Counter(CounterAggregate),
    /// The name accumulated rate samples.
    Rate(RateAggregate),
    /// The name accumulated trend samples.
    Trend(TrendAggregate),
}
impl MetricAggregate {
    /// A human readable name for the aggregate's kind.
    pub fn kind(&self) -> &str {
        match self {
            MetricAggregate::Counter(_) => "counter",
            MetricAggregate::Rate(_) => "rate",
            MetricAggregate::Trend(_) => "trend",
        }
    }
}

/// All metrics merged together for a load test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurgeMetrics {
    /// Every aggregate recorded during the load test, keyed by metric name.
    pub aggregates: BTreeMap<String, MetricAggregate>,
    /// A record of each test plan step the load test moved through.
    pub history: Vec<TestPlanHistory>,
    /// How long the load test ran, in seconds.
    pub duration: usize,
    /// The largest number of users running at any one time.
    pub maximum_users: usize,
    /// The total number of users spawned over the life of the load test.
    pub total_users: usize,
    /// When the load test started.
    #[serde(skip)]
    pub started: Option<DateTime<Local>>,
    /// When the load test stopped.
    #[serde(skip)]
    pub stopped: Option<DateTime<Local>>,
}

impl SurgeMetrics {
    /// Fold one observation into the matching aggregate, creating the
    /// aggregate the first time a name is seen.
    pub(crate) fn record(&mut self, metric: SurgeMetric) {
        match metric {
            SurgeMetric::Counter { name, amount } => {
                let aggregate = self
                    .aggregates
                    .entry(name)
                    .or_insert_with(|| MetricAggregate::Counter(CounterAggregate::default()));
                if let MetricAggregate::Counter(counter) = aggregate {
                    counter.record(amount);
                } else {
                    warn!(
                        "dropped counter sample recorded against a {} metric",
                        aggregate.kind()
                    );
                }
            }
            SurgeMetric::Rate { name, pass } => {
                let aggregate = self
                    .aggregates
                    .entry(name)
                    .or_insert_with(|| MetricAggregate::Rate(RateAggregate::default()));
                if let MetricAggregate::Rate(rate) = aggregate {
                    rate.record(pass);
                } else {
                    warn!(
                        "dropped rate sample recorded against a {} metric",
                        aggregate.kind()
                    );
                }
            }
            SurgeMetric::Trend { name, millis } => {
                let aggregate = self
                    .aggregates
                    .entry(name)
                    .or_insert_with(|| MetricAggregate::Trend(TrendAggregate::default()));
                if let MetricAggregate::Trend(trend) = aggregate {
                    trend.record_time(millis);
                } else {
                    warn!(
                        "dropped trend sample recorded against a {} metric",
                        aggregate.kind()
                    );
                }
            }
        }
    }

    /// Look up a trend aggregate by name, if one was recorded.
    pub fn trend(&self, name: &str) -> Option<&TrendAggregate> {
        match self.aggregates.get(name) {
            Some(MetricAggregate::Trend(trend)) => Some(trend),
            _ => None,
        }
    }

    /// Look up a rate aggregate by name, if one was recorded.
    pub fn rate(&self, name: &str) -> Option<&RateAggregate> {
        match self.aggregates.get(name) {
            Some(MetricAggregate::Rate(rate)) => Some(rate),
            _ => None,
        }
    }

    /// Look up a counter aggregate by name, if one was recorded.
    pub fn counter(&self, name: &str) -> Option<&CounterAggregate> {
        match self.aggregates.get(name) {
            Some(MetricAggregate::Counter(counter)) => Some(counter),
            _ => None,
        }
    }

    pub(crate) fn fmt_counters(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters: Vec<(&String, &CounterAggregate)> = self
            .aggregates
            .iter()
            .filter_map(|(name, aggregate)| match aggregate {
                MetricAggregate::Counter(counter) => Some((name, counter)),
                _ => None,
            })
            .collect();
        if counters.is_empty() {
            return Ok(());
        }

        writeln!(fmt, "\n === COUNTERS ===")?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<13}-+-{:-<12}",
            "", "", ""
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>12}",
            "Name", "Total", "per second"
        )?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<13}-+-{:-<12}",
            "", "", ""
        )?;
        for (name, counter) in counters {
            let per_second = per_second(counter.total, self.duration);
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>12.2}",
                crate::util::truncate_string(name, 24),
                format_number(counter.total),
                per_second,
            )?;
        }

        Ok(())
    }

    pub(crate) fn fmt_rates(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rates: Vec<(&String, &RateAggregate)> = self
            .aggregates
            .iter()
            .filter_map(|(name, aggregate)| match aggregate {
                MetricAggregate::Rate(rate) => Some((name, rate)),
                _ => None,
            })
            .collect();
        if rates.is_empty() {
            return Ok(());
        }

        writeln!(fmt, "\n === RATES ===")?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<13}-+-{:-<13}-+-{:-<8}",
            "", "", "", ""
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>13} | {:>8}",
            "Name", "# pass", "# fail", "Rate"
        )?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<13}-+-{:-<13}-+-{:-<8}",
            "", "", "", ""
        )?;
        for (name, rate) in rates {
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>13} | {:>7.2}%",
                crate::util::truncate_string(name, 24),
                format_number(rate.pass_count),
                format_number(rate.fail_count()),
                rate.rate() * 100.0,
            )?;
        }

        Ok(())
    }

    pub(crate) fn fmt_trends(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trends: Vec<(&String, &TrendAggregate)> = self
            .aggregates
            .iter()
            .filter_map(|(name, aggregate)| match aggregate {
                MetricAggregate::Trend(trend) => Some((name, trend)),
                _ => None,
            })
            .collect();
        if trends.is_empty() {
            return Ok(());
        }

        writeln!(fmt, "\n === TRENDS ===")?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<11}-+-{:-<11}-+-{:-<9}-+-{:-<9}-+-{:-<9}",
            "", "", "", "", "", ""
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>11} | {:>9} | {:>9} | {:>9}",
            "Name", "# samples", "Avg (ms)", "Min", "Max", "Median"
        )?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<11}-+-{:-<11}-+-{:-<9}-+-{:-<9}-+-{:-<9}",
            "", "", "", "", "", ""
        )?;
        for (name, trend) in &trends {
            writeln!(
                fmt,
                " {:<24} | {:>11} | {:>11.2} | {:>9} | {:>9} | {:>9}",
                crate::util::truncate_string(name, 24),
                format_number(trend.counter),
                trend.mean(),
                format_number(trend.min_time),
                format_number(trend.max_time),
                format_number(trend.percentile(0.5)),
            )?;
        }

        // Break down each distribution's tail in a second table.
        writeln!(
            fmt,
            " {:-<24}-+-{:-<9}-+-{:-<9}-+-{:-<9}-+-{:-<9}",
            "", "", "", "", ""
        )?;
        writeln!(
            fmt,
            " Slowest samples within specified percentile of requests (in ms):"
        )?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<9}-+-{:-<9}-+-{:-<9}-+-{:-<9}",
            "", "", "", "", ""
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>9} | {:>9} | {:>9} | {:>9}",
            "Name", "50%", "90%", "95%", "99%"
        )?;
        writeln!(
            fmt,
            " {:-<24}-+-{:-<9}-+-{:-<9}-+-{:-<9}-+-{:-<9}",
            "", "", "", "", ""
        )?;
        for (name, trend) in &trends {
            writeln!(
                fmt,
                " {:<24} | {:>9} | {:>9} | {:>9} | {:>9}",
                crate::util::truncate_string(name, 24),
                format_number(trend.percentile(0.5)),
                format_number(trend.percentile(0.9)),
                format_number(trend.percentile(0.95)),
                format_number(trend.percentile(0.99)),
            )?;
        }

        Ok(())
    }

    pub(crate) fn fmt_overview(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            fmt,
            "\n {:-<78}",
            ""
        )?;
        writeln!(
            fmt,
            " Users: {} maximum, {} total",
            format_number(self.maximum_users),
            format_number(self.total_users)
        )?;
        if let (Some(started), Some(stopped)) = (self.started, self.stopped) {
            writeln!(
                fmt,
                " Running: {} - {} (duration: {})",
                started.format("%Y-%m-%d %H:%M:%S"),
                stopped.format("%Y-%m-%d %H:%M:%S"),
                duration_hms(self.duration),
            )?;
        }
        for step in &self.history {
            if let Some(timestamp) = step.timestamp {
                writeln!(
                    fmt,
                    "  {}: {:?} to {} users",
                    timestamp.format("%H:%M:%S"),
                    step.action,
                    format_number(step.users)
                )?;
            }
        }
        writeln!(
            fmt,
            " {:-<78}",
            ""
        )?;

        Ok(())
    }
}

impl fmt::Display for SurgeMetrics {
    // Implement display of metrics with `{}` marker.
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_counters(fmt)?;
        self.fmt_rates(fmt)?;
        self.fmt_trends(fmt)?;
        self.fmt_overview(fmt)
    }
}

/// Convert a [`Duration`] to whole milliseconds for trend recording.
pub(crate) fn as_millis(duration: Duration) -> usize {
    duration.as_millis() as usize
}

/// Calculate how many observations happened each second on average.
pub(crate) fn per_second(total: usize, duration: usize) -> f32 {
    if duration == 0 {
        0.0
    } else {
        total as f32 / duration as f32
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

// Format a seconds duration as HH:MM:SS.
fn duration_hms(duration: usize) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        duration / 3600,
        (duration % 3600) / 60,
        duration % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_aggregate() {
        let mut counter = CounterAggregate::default();
        counter.record(1);
        counter.record(1);
        counter.record(40);
        assert_eq!(counter.total, 42);
    }

    #[test]
    fn rate_aggregate() {
        let mut rate = RateAggregate::default();
        for _ in 0..7 {
            rate.record(true);
        }
        for _ in 0..3 {
            rate.record(false);
        }
        assert_eq!(rate.pass_count, 7);
        assert_eq!(rate.total_count, 10);
        assert_eq!(rate.fail_count(), 3);
        // The derived rate is exact.
        assert_eq!(rate.rate(), 0.7);

        // An empty rate is 0, not NaN.
        let empty = RateAggregate::default();
        assert_eq!(empty.rate(), 0.0);
    }

    #[test]
    fn trend_aggregate() {
        let mut trend = TrendAggregate::default();
        for millis in [100, 200, 300, 400, 500].iter() {
            trend.record_time(*millis);
        }
        assert_eq!(trend.counter, 5);
        assert_eq!(trend.min_time, 100);
        assert_eq!(trend.max_time, 500);
        assert_eq!(trend.mean(), 300.0);
        assert_eq!(trend.percentile(0.5), 300);
        assert_eq!(trend.percentile(0.9), 500);
        assert_eq!(trend.percentile(0.95), 500);
        assert_eq!(trend.percentile(0.99), 500);

        // An empty trend reports zeros.
        let empty = TrendAggregate::default();
        assert_eq!(empty.mean(), 0.0);
        assert_eq!(empty.percentile(0.95), 0);
    }

    #[test]
    fn trend_rounding() {
        let mut trend = TrendAggregate::default();
        // Small times are stored unrounded.
        trend.record_time(99);
        assert!(trend.times.contains_key(&99));
        // Mid-range times are rounded to the nearest 10ms.
        trend.record_time(123);
        assert!(trend.times.contains_key(&120));
        // Times between 500 and 1000ms are rounded to the nearest 100ms.
        trend.record_time(567);
        assert!(trend.times.contains_key(&600));
        // Large times are rounded to the nearest 1000ms.
        trend.record_time(1_499);
        assert!(trend.times.contains_key(&1_000));

        // Minimum and maximum stay unrounded.
        assert_eq!(trend.min_time, 99);
        assert_eq!(trend.max_time, 1_499);
        assert_eq!(trend.percentile(0.99), 1_000);

        // A percentile landing in a bucket rounded past the true maximum is
        // clamped back to the maximum.
        let mut trend = TrendAggregate::default();
        trend.record_time(1_501);
        assert!(trend.times.contains_key(&2_000));
        assert_eq!(trend.percentile(0.99), 1_501);
    }

    #[test]
    fn record_messages() {
        let mut metrics = SurgeMetrics::default();
        metrics.record(SurgeMetric::Counter {
            name: ITERATIONS.to_string(),
            amount: 1,
        });
        metrics.record(SurgeMetric::Counter {
            name: ITERATIONS.to_string(),
            amount: 2,
        });
        metrics.record(SurgeMetric::Rate {
            name: ITERATION_SUCCESS.to_string(),
            pass: true,
        });
        metrics.record(SurgeMetric::Trend {
            name: REQUEST_TIME.to_string(),
            millis: 250,
        });

        assert_eq!(metrics.counter(ITERATIONS).unwrap().total, 3);
        assert_eq!(metrics.rate(ITERATION_SUCCESS).unwrap().total_count, 1);
        assert_eq!(metrics.trend(REQUEST_TIME).unwrap().counter, 1);
        // Aggregates are created lazily, nothing else was recorded.
        assert_eq!(metrics.aggregates.len(), 3);
    }

    #[test]
    fn kind_conflicts_dropped() {
        let mut metrics = SurgeMetrics::default();
        metrics.record(SurgeMetric::Counter {
            name: "checkout".to_string(),
            amount: 5,
        });
        // A rate sample against an existing counter name is dropped.
        metrics.record(SurgeMetric::Rate {
            name: "checkout".to_string(),
            pass: true,
        });

        assert_eq!(metrics.counter("checkout").unwrap().total, 5);
        assert!(metrics.rate("checkout").is_none());
        assert_eq!(metrics.aggregates.len(), 1);
    }

    #[test]
    fn per_second_calculations() {
        assert_eq!(per_second(0, 0), 0.0);
        assert_eq!(per_second(100, 0), 0.0);
        assert_eq!(per_second(100, 10), 10.0);
        assert_eq!(per_second(25, 100), 0.25);
    }
}
