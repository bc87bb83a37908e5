//! A list of things that are regularly used when writing Surge load tests.

pub use crate::config::{SurgeConfiguration, SurgeDefault, SurgeDefaultType};
pub use crate::metrics::{SurgeMetric, SurgeMetrics};
pub use crate::scenario;
pub use crate::surge::{Scenario, ScenarioError, ScenarioFunction, ScenarioResult, SurgeUser};
pub use crate::threshold::{Comparator, RunResult, Statistic, Threshold};
pub use crate::{SurgeAttack, SurgeError};
