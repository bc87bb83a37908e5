//! Helpers and objects for building Surge load tests.
//!
//! A load test is one or more [`Scenario`]s, each a weighted async function
//! run over and over by the virtual users the scheduler keeps alive. Scenario
//! functions receive a mutable reference to the [`SurgeUser`] running them,
//! which owns the HTTP client and the metric recording API.
//!
//! ## Example
//! ```rust
//! use surge::prelude::*;
//!
//! async fn search_claims(user: &mut SurgeUser) -> ScenarioResult {
//!     let _response = user.get("/claims/search?status=open").await?;
//!
//!     Ok(())
//! }
//!
//! // Weight the scenario to 60% of iterations.
//! let scenario = scenario!(search_claims).set_probability(0.6).unwrap();
//! assert_eq!(scenario.name, "search_claims");
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{self, Duration};
use std::{fmt, io};

use reqwest::{Client, RequestBuilder, Response};
use url::Url;

use crate::config::SurgeConfiguration;
use crate::metrics::{self, SurgeMetric};
use crate::util;
use crate::SurgeError;

/// By default Surge sets the following User-Agent header when making requests.
static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// `scenario!(foo)` expands to `Scenario::new("foo", ...)`, doing the boxing
/// necessary to store the async function pointer.
#[macro_export]
macro_rules! scenario {
    ($scenario_fn:ident) => {
        $crate::surge::Scenario::new(
            stringify!($scenario_fn),
            std::sync::Arc::new(move |user| std::boxed::Box::pin($scenario_fn(user))),
        )
    };
}

/// The result of one invocation of a scenario function.
pub type ScenarioResult = Result<(), ScenarioError>;

/// The wrapped async function that runs one iteration of a scenario.
pub type ScenarioFunction = Arc<
    dyn for<'r> Fn(&'r mut SurgeUser) -> Pin<Box<dyn Future<Output = ScenarioResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// An enumeration of all errors a scenario function can return.
///
/// A scenario error marks a single iteration as failed; it is caught by the
/// virtual user running the scenario and never terminates the load test.
#[derive(Debug)]
pub enum ScenarioError {
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
    Url(url::ParseError),
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// The request was successfully sent but the response failed an assertion.
    Check {
        /// A short tag identifying which assertion failed.
        tag: String,
    },
}
impl ScenarioError {
    fn describe(&self) -> &str {
        match *self {
            ScenarioError::Reqwest(_) => "reqwest::Error",
            ScenarioError::Url(_) => "url::ParseError",
            ScenarioError::Io(_) => "io::Error",
            ScenarioError::Check { .. } => "check failed",
        }
    }
}
impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScenarioError::Reqwest(ref source) => {
                write!(f, "ScenarioError: {} ({})", self.describe(), source)
            }
            ScenarioError::Url(ref source) => {
                write!(f, "ScenarioError: {} ({})", self.describe(), source)
            }
            ScenarioError::Io(ref source) => {
                write!(f, "ScenarioError: {} ({})", self.describe(), source)
            }
            ScenarioError::Check { ref tag } => {
                write!(f, "ScenarioError: {} ({})", self.describe(), tag)
            }
        }
    }
}
impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            ScenarioError::Reqwest(ref source) => Some(source),
            ScenarioError::Url(ref source) => Some(source),
            ScenarioError::Io(ref source) => Some(source),
            ScenarioError::Check { .. } => None,
        }
    }
}
/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for ScenarioError {
    fn from(err: reqwest::Error) -> ScenarioError {
        ScenarioError::Reqwest(err)
    }
}
/// Auto-convert URL parse errors.
impl From<url::ParseError> for ScenarioError {
    fn from(err: url::ParseError) -> ScenarioError {
        ScenarioError::Url(err)
    }
}
/// Auto-convert IO errors.
impl From<io::Error> for ScenarioError {
    fn from(err: io::Error) -> ScenarioError {
        ScenarioError::Io(err)
    }
}

/// An individual traffic flow, together with the share of iterations it receives.
#[derive(Clone)]
pub struct Scenario {
    /// The name of the scenario, used in logs and metrics.
    pub name: String,
    /// The probability that any one iteration selects this scenario, in (0, 1].
    pub probability: f64,
    /// The async function invoked to run one iteration of this scenario.
    pub function: ScenarioFunction,
}
impl Scenario {
    /// Create a new Scenario. Normally invoked through the [`scenario!`] macro.
    pub fn new(name: &str, function: ScenarioFunction) -> Self {
        trace!("new scenario: {}", name);
        Scenario {
            name: name.to_string(),
            probability: 1.0,
            function,
        }
    }

    /// Set a display name for the scenario, replacing the function name the
    /// [`scenario!`] macro captured.
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the share of iterations this scenario receives.
    ///
    /// Must be greater than 0 and at most 1. The probabilities of all
    /// registered scenarios may sum to less than 1.0: a draw landing in the
    /// remainder runs no scenario for that iteration.
    ///
    /// # Example
    /// ```rust
    /// use surge::prelude::*;
    ///
    /// async fn fetch_claim(user: &mut SurgeUser) -> ScenarioResult {
    ///     let _response = user.get("/claims/12345").await?;
    ///
    ///     Ok(())
    /// }
    ///
    /// let scenario = scenario!(fetch_claim).set_probability(0.25).unwrap();
    ///
    /// // Probabilities outside (0, 1] are rejected.
    /// assert!(scenario!(fetch_claim).set_probability(1.5).is_err());
    /// assert!(scenario!(fetch_claim).set_probability(0.0).is_err());
    /// ```
    pub fn set_probability(mut self, probability: f64) -> Result<Self, SurgeError> {
        if probability <= 0.0 || probability > 1.0 {
            return Err(SurgeError::InvalidProbability {
                probability,
                detail: format!(
                    "scenario {} probability must be greater than 0.0 and at most 1.0",
                    self.name
                ),
            });
        }
        self.probability = probability;
        Ok(self)
    }
}

/// A cumulative probability table mapping uniform draws to scenarios.
///
/// Built once before the load test starts; selection is a stateless binary
/// search, safe to call concurrently from every virtual user.
pub(crate) struct DispatchTable {
    // Cumulative upper boundaries, one per scenario, in registration order.
    boundaries: Vec<f64>,
    // The scenarios themselves, in registration order.
    scenarios: Vec<Scenario>,
}
impl DispatchTable {
    /// Validate scenario probabilities and build the cumulative table.
    pub(crate) fn new(scenarios: Vec<Scenario>) -> Result<Self, SurgeError> {
        let mut boundaries = Vec::with_capacity(scenarios.len());
        let mut cumulative: f64 = 0.0;
        for scenario in &scenarios {
            cumulative += scenario.probability;
            // Allow a little slack for floating point sums.
            if cumulative > 1.0 + 1e-9 {
                return Err(SurgeError::InvalidProbability {
                    probability: cumulative,
                    detail: format!(
                        "scenario probabilities sum to {:.4}, they can not sum to more than 1.0",
                        cumulative
                    ),
                });
            }
            boundaries.push(cumulative);
        }
        Ok(DispatchTable {
            boundaries,
            scenarios,
        })
    }

    /// Map one uniform draw from the provided generator to a scenario.
    ///
    /// Returns `None` when the draw lands past the last cumulative boundary,
    /// in the remainder left by probabilities summing to less than 1.0.
    pub(crate) fn select<R: rand::Rng>(&self, rng: &mut R) -> Option<&Scenario> {
        let roll: f64 = rng.random();
        // The first boundary greater than or equal to the roll selects.
        let index = self.boundaries.partition_point(|&boundary| boundary < roll);
        self.scenarios.get(index)
    }
}

/// One concurrently executing virtual user.
///
/// An individual `SurgeUser` is passed to each invocation of a scenario
/// function, providing the HTTP client and the metric recording API.
pub struct SurgeUser {
    /// The number of this user, 1-indexed as it's human-visible in logs.
    pub user_number: usize,
    /// The base URL to prepend to all relative request paths.
    pub base_url: Url,
    /// A client pre-configured for this user, maintaining cookies and state.
    pub client: Client,
    /// A local copy of the run configuration; scenario functions read
    /// business-specific settings such as `config.api_key` from here.
    pub config: SurgeConfiguration,
    /// The randomized pause between this user's iterations, if configured.
    pub(crate) think_time: Option<(Duration, Duration)>,
    /// Channel to send metric observations to the parent for aggregation.
    pub(crate) metrics_tx: Option<flume::Sender<SurgeMetric>>,
}
impl SurgeUser {
    /// Create a user state for a single virtual user.
    pub(crate) fn new(
        user_number: usize,
        base_url: Url,
        think_time: Option<(Duration, Duration)>,
        configuration: &SurgeConfiguration,
    ) -> Result<Self, SurgeError> {
        trace!("new surge user: {}", user_number);

        let builder = Client::builder().user_agent(APP_USER_AGENT);
        // Honor a configured per-request timeout; otherwise requests wait on
        // normal network IO.
        let builder = match util::get_float_from_string(configuration.timeout.clone()) {
            Some(timeout) => builder.timeout(Duration::from_millis((timeout * 1_000.0) as u64)),
            None => builder,
        };
        #[cfg(feature = "cookies")]
        let builder = builder.cookie_store(true);

        Ok(SurgeUser {
            user_number,
            base_url,
            client: builder.build()?,
            config: configuration.clone(),
            think_time,
            metrics_tx: None,
        })
    }

    /// Create a one-time-use user, for running setup and teardown hooks.
    pub(crate) fn single(
        base_url: Url,
        configuration: &SurgeConfiguration,
    ) -> Result<Self, SurgeError> {
        SurgeUser::new(0, base_url, None, configuration)
    }

    /// Increment a counter metric by the given amount.
    pub fn increment_counter(&self, name: &str, amount: usize) {
        // Best effort metrics.
        if let Some(metrics_tx) = self.metrics_tx.as_ref() {
            let _ = metrics_tx.send(SurgeMetric::Counter {
                name: name.to_string(),
                amount,
            });
        }
    }

    /// Record one pass/fail observation against a rate metric.
    pub fn record_rate(&self, name: &str, pass: bool) {
        // Best effort metrics.
        if let Some(metrics_tx) = self.metrics_tx.as_ref() {
            let _ = metrics_tx.send(SurgeMetric::Rate {
                name: name.to_string(),
                pass,
            });
        }
    }

    /// Record one duration observation against a trend metric.
    pub fn record_trend(&self, name: &str, duration: Duration) {
        // Best effort metrics.
        if let Some(metrics_tx) = self.metrics_tx.as_ref() {
            let _ = metrics_tx.send(SurgeMetric::Trend {
                name: name.to_string(),
                millis: metrics::as_millis(duration),
            });
        }
    }

    /// Record a named assertion against the built-in `checks` rate, returning
    /// the asserted condition so callers can branch on it.
    ///
    /// # Example
    /// ```rust,no_run
    /// use surge::prelude::*;
    ///
    /// async fn search_claims(user: &mut SurgeUser) -> ScenarioResult {
    ///     let response = user.get("/claims/search?status=open").await?;
    ///
    ///     if !user.check("search returns 200", response.status().is_success()) {
    ///         return Err(ScenarioError::Check {
    ///             tag: "search returns 200".to_string(),
    ///         });
    ///     }
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn check(&self, tag: &str, pass: bool) -> bool {
        if !pass {
            debug!("user {}: check failed: {}", self.user_number, tag);
        }
        self.record_rate(metrics::CHECKS, pass);
        pass
    }

    /// Prepend the base URL to relative paths; absolute URLs pass through.
    pub fn build_url(&self, path: &str) -> Result<Url, ScenarioError> {
        // If a full URL is passed in, use it as is.
        if let Ok(url) = Url::parse(path) {
            if url.has_host() {
                return Ok(url);
            }
        }
        Ok(self.base_url.join(path)?)
    }

    /// A helper to make a named `GET` request of a path, automatically
    /// recording request metrics.
    ///
    /// Calls to `get` return a [`reqwest::Response`] so the scenario can
    /// inspect status and body.
    pub async fn get(&mut self, path: &str) -> Result<Response, ScenarioError> {
        let url = self.build_url(path)?;
        let request_builder = self.client.get(url);
        self.send_request(request_builder, &format!("GET {}", path))
            .await
    }

    /// A helper to make a `GET` request recorded under a custom metric name,
    /// collapsing parameterized paths into one aggregate.
    pub async fn get_named(&mut self, path: &str, name: &str) -> Result<Response, ScenarioError> {
        let url = self.build_url(path)?;
        let request_builder = self.client.get(url);
        self.send_request(request_builder, name).await
    }

    /// A helper to make a `POST` request of a path, automatically recording
    /// request metrics.
    pub async fn post(&mut self, path: &str, body: String) -> Result<Response, ScenarioError> {
        let url = self.build_url(path)?;
        let request_builder = self.client.post(url).body(body);
        self.send_request(request_builder, &format!("POST {}", path))
            .await
    }

    /// A helper to make a `POST` request with a JSON body, automatically
    /// recording request metrics.
    pub async fn post_json(
        &mut self,
        path: &str,
        json: &serde_json::Value,
    ) -> Result<Response, ScenarioError> {
        let url = self.build_url(path)?;
        let request_builder = self.client.post(url).json(json);
        self.send_request(request_builder, &format!("POST {}", path))
            .await
    }

    /// Build and execute a request, timing it and recording the built-in
    /// request metrics plus a trend named after the request.
    ///
    /// A transport failure (including a timeout from `--timeout`) is recorded
    /// as a failed observation and returned for the scenario to handle; a
    /// response with any status code is returned as is, recorded as passing
    /// only if the status is a success.
    pub async fn send_request(
        &mut self,
        request_builder: RequestBuilder,
        name: &str,
    ) -> Result<Response, ScenarioError> {
        let started = time::Instant::now();
        let result = request_builder.send().await;
        let elapsed = started.elapsed();

        self.increment_counter(metrics::REQUESTS, 1);
        self.record_trend(metrics::REQUEST_TIME, elapsed);
        self.record_trend(name, elapsed);

        match result {
            Ok(response) => {
                let success = response.status().is_success();
                if !success {
                    debug!(
                        "user {}: {} returned {}",
                        self.user_number,
                        name,
                        response.status()
                    );
                }
                self.record_rate(metrics::REQUEST_SUCCESS, success);
                Ok(response)
            }
            Err(e) => {
                debug!("user {}: {} failed: {}", self.user_number, name, e);
                self.record_rate(metrics::REQUEST_SUCCESS, false);
                Err(ScenarioError::Reqwest(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn noop(_user: &mut SurgeUser) -> ScenarioResult {
        Ok(())
    }

    fn weighted(probability: f64) -> Scenario {
        scenario!(noop).set_probability(probability).unwrap()
    }

    #[test]
    fn scenario_builder() {
        let scenario = scenario!(noop);
        assert_eq!(scenario.name, "noop");
        assert_eq!(scenario.probability, 1.0);

        let scenario = scenario!(noop).set_name("renamed");
        assert_eq!(scenario.name, "renamed");

        assert!(scenario!(noop).set_probability(0.5).is_ok());
        assert!(scenario!(noop).set_probability(1.0).is_ok());
        assert!(scenario!(noop).set_probability(0.0).is_err());
        assert!(scenario!(noop).set_probability(-0.25).is_err());
        assert!(scenario!(noop).set_probability(1.01).is_err());
    }

    #[test]
    fn dispatch_validation() {
        // Probabilities summing to exactly 1.0 are valid.
        assert!(DispatchTable::new(vec![weighted(0.7), weighted(0.3)]).is_ok());
        // Probabilities summing to less than 1.0 leave a dead zone, also valid.
        assert!(DispatchTable::new(vec![weighted(0.5), weighted(0.25)]).is_ok());
        // Probabilities summing past 1.0 are rejected before the run starts.
        assert!(DispatchTable::new(vec![weighted(0.7), weighted(0.7)]).is_err());
    }

    #[test]
    fn dispatch_frequencies() {
        let table =
            DispatchTable::new(vec![weighted(0.6).set_name("a"), weighted(0.3).set_name("b")])
                .unwrap();

        // With a fixed seed the draw sequence is deterministic; over many
        // draws the empirical frequencies converge on the configured
        // probabilities, with ~10% of draws landing in the dead zone.
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 100_000;
        let mut selected_a = 0;
        let mut selected_b = 0;
        let mut selected_none = 0;
        for _ in 0..draws {
            match table.select(&mut rng) {
                Some(scenario) if scenario.name == "a" => selected_a += 1,
                Some(_) => selected_b += 1,
                None => selected_none += 1,
            }
        }

        let tolerance = 0.01;
        assert!((selected_a as f64 / draws as f64 - 0.6).abs() < tolerance);
        assert!((selected_b as f64 / draws as f64 - 0.3).abs() < tolerance);
        assert!((selected_none as f64 / draws as f64 - 0.1).abs() < tolerance);

        // Exactly one outcome per draw.
        assert_eq!(selected_a + selected_b + selected_none, draws);
    }

    #[test]
    fn dispatch_declaration_order() {
        // Identical draws map into cumulative ranges in declaration order.
        let table = DispatchTable::new(vec![
            weighted(0.25).set_name("first"),
            weighted(0.25).set_name("second"),
        ])
        .unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        let mut seen_first = false;
        let mut seen_second = false;
        for _ in 0..1_000 {
            match table.select(&mut rng) {
                Some(scenario) if scenario.name == "first" => seen_first = true,
                Some(scenario) if scenario.name == "second" => seen_second = true,
                _ => (),
            }
        }
        assert!(seen_first);
        assert!(seen_second);
    }

    #[test]
    fn build_urls() {
        let configuration = SurgeConfiguration::default();
        let user = SurgeUser::single(
            Url::parse("http://example.com/").unwrap(),
            &configuration,
        )
        .unwrap();

        // Relative paths are joined onto the base URL.
        assert_eq!(
            user.build_url("/claims/search").unwrap().as_str(),
            "http://example.com/claims/search"
        );
        // Absolute URLs pass through untouched.
        assert_eq!(
            user.build_url("https://other.example.com/healthz")
                .unwrap()
                .as_str(),
            "https://other.example.com/healthz"
        );
    }

    #[test]
    fn metrics_without_channel() {
        let configuration = SurgeConfiguration::default();
        let user = SurgeUser::single(
            Url::parse("http://example.com/").unwrap(),
            &configuration,
        )
        .unwrap();

        // Recording without a parent channel is a quiet no-op.
        user.increment_counter("orphaned", 1);
        user.record_rate("orphaned_rate", true);
        user.record_trend("orphaned_trend", Duration::from_millis(10));
        assert!(user.check("still returns the condition", true));
        assert!(!user.check("also when failing", false));
    }

    #[test]
    fn metrics_through_channel() {
        let configuration = SurgeConfiguration::default();
        let mut user = SurgeUser::single(
            Url::parse("http://example.com/").unwrap(),
            &configuration,
        )
        .unwrap();
        let (metrics_tx, metrics_rx) = flume::unbounded();
        user.metrics_tx = Some(metrics_tx);

        user.increment_counter("widgets", 3);
        user.record_trend("widget_time", Duration::from_millis(1_500));

        let mut metrics = crate::metrics::SurgeMetrics::default();
        while let Ok(metric) = metrics_rx.try_recv() {
            metrics.record(metric);
        }
        assert_eq!(metrics.counter("widgets").unwrap().total, 3);
        assert_eq!(metrics.trend("widget_time").unwrap().max_time, 1_500);
    }
}
