//! Configuration of the cascading filter.
//!
//! [`CascadingFilterConfig`] holds the global budgets, the buffering limits
//! and the ordered reject and accept rules. Defaults can be overridden with
//! environment variables, see [`CascadingFilterConfigBuilder::default`].
//!
//! With the `serde` feature every configuration type implements
//! `Deserialize`; durations are expressed in milliseconds.
use opentelemetry::otel_info;
use opentelemetry::otel_warn;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer};

/// Decision wait in milliseconds.
pub(crate) const OTEL_CASCADING_FILTER_DECISION_WAIT: &str = "OTEL_CASCADING_FILTER_DECISION_WAIT";
/// Default decision wait in milliseconds.
pub(crate) const OTEL_CASCADING_FILTER_DECISION_WAIT_DEFAULT: u64 = 30_000;
/// Maximum number of traces buffered at once.
pub(crate) const OTEL_CASCADING_FILTER_NUM_TRACES: &str = "OTEL_CASCADING_FILTER_NUM_TRACES";
/// Default maximum number of buffered traces.
pub(crate) const OTEL_CASCADING_FILTER_NUM_TRACES_DEFAULT: u64 = 100_000;
/// Global spans per second budget.
pub(crate) const OTEL_CASCADING_FILTER_SPANS_PER_SECOND: &str =
    "OTEL_CASCADING_FILTER_SPANS_PER_SECOND";
/// Default global budget, derived from the rule budgets.
pub(crate) const OTEL_CASCADING_FILTER_SPANS_PER_SECOND_DEFAULT: i64 = 0;
/// Number of collector instances sharing the configuration.
pub(crate) const OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES: &str =
    "OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES";
/// Default number of collector instances.
pub(crate) const OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES_DEFAULT: u32 = 1;

/// Accept rules and reject rules are matched against spans with these
/// settings. Every configured category must match for the rule to match.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct PropertiesConfig {
    /// Regular expression that must match the name of any span of the trace.
    pub name_pattern: Option<String>,
    /// Minimum duration of the trace, from its earliest start to its latest end.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "deserialize_opt_millis"))]
    pub min_duration: Option<Duration>,
    /// Minimum number of spans in the trace.
    pub min_number_of_spans: Option<usize>,
    /// Minimum number of spans with an error status in the trace.
    pub min_number_of_errors: Option<usize>,
}

/// Matches an integer attribute within `[min_value, max_value]`.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct NumericAttributeConfig {
    /// Attribute key.
    pub key: String,
    /// Minimum value, inclusive.
    pub min_value: i64,
    /// Maximum value, inclusive.
    pub max_value: i64,
}

/// Matches a string attribute equal to any of `values`, or matching any of
/// them as a regular expression when `use_regex` is set.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct StringAttributeConfig {
    /// Attribute key.
    pub key: String,
    /// Accepted values or patterns.
    pub values: Vec<String>,
    /// Treat `values` as regular expressions.
    pub use_regex: bool,
}

/// Inclusive numeric range.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct AttributeRange {
    /// Lower bound.
    pub min: i64,
    /// Upper bound.
    pub max: i64,
}

/// Generic attribute predicate.
///
/// The attribute matches if its string value is one of `values` (or matches
/// one of them as a pattern with `use_regex`), or if its numeric value falls
/// into one of `ranges`. With neither values nor ranges, the mere presence
/// of `key` is a match. Span attributes are consulted first; resource
/// attributes only when the span does not carry the key.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct AttributeConfig {
    /// Attribute key.
    pub key: String,
    /// Accepted string values or patterns.
    pub values: Vec<String>,
    /// Treat `values` as regular expressions.
    pub use_regex: bool,
    /// Accepted numeric ranges, for integer and double values.
    pub ranges: Vec<AttributeRange>,
}

/// An accept rule.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct TraceAcceptConfig {
    /// Name of the rule, set as `sampling.filter` on the traces it selects.
    pub name: String,
    /// Numeric attribute predicate.
    pub numeric_attribute: Option<NumericAttributeConfig>,
    /// String attribute predicate.
    pub string_attribute: Option<StringAttributeConfig>,
    /// Generic attribute predicates, all of which must match.
    pub attributes: Vec<AttributeConfig>,
    /// Span name, duration, span count and error count predicates.
    pub properties: PropertiesConfig,
    /// Budget of the rule. Negative means unlimited, in which case matching
    /// traces only get a second chance at the global budget. Zero never
    /// admits anything.
    pub spans_per_second: i64,
    /// Sample the traces that do *not* match.
    pub invert_match: bool,
}

/// A reject rule. Every configured category must match somewhere in the
/// trace for it to be dropped.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct TraceRejectConfig {
    /// Name of the rule.
    pub name: String,
    /// Numeric attribute predicate.
    pub numeric_attribute: Option<NumericAttributeConfig>,
    /// String attribute predicate.
    pub string_attribute: Option<StringAttributeConfig>,
    /// Generic attribute predicates, all of which must match.
    pub attributes: Vec<AttributeConfig>,
    /// Regular expression that must match the name of any span of the trace.
    pub name_pattern: Option<String>,
    /// Status code of the root span, one of `"Error"`, `"Ok"` or `"Unset"`.
    pub status_code: Option<String>,
}

/// Cascading filter configuration.
/// Use [`CascadingFilterConfigBuilder`] to configure your own instance of
/// [`CascadingFilterConfig`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize), serde(default))]
pub struct CascadingFilterConfig {
    /// Number of collectors sharing this configuration. Every budget is
    /// divided by it. The default value is 1.
    pub(crate) collector_instances: u32,

    /// Time from the arrival of the first span of a trace until the trace is
    /// evaluated. The default value is 30 seconds.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "deserialize_millis"))]
    pub(crate) decision_wait: Duration,

    /// Global budget that is never exceeded. Zero derives it from the rule
    /// budgets and the probabilistic filtering rate.
    pub(crate) spans_per_second: i64,

    /// Budget for late spans of sampled traces. Half of `spans_per_second`
    /// when unset.
    pub(crate) prior_spans_rate: Option<i64>,

    /// Share (0.0-1.0) of the global budget reserved for probabilistically
    /// selected traces.
    pub(crate) probabilistic_filtering_ratio: Option<f64>,

    /// Spans per second reserved for probabilistically selected traces.
    /// Ignored when a ratio applies.
    pub(crate) probabilistic_filtering_rate: Option<i64>,

    /// Maximum number of traces kept in memory. The default value is 100000.
    pub(crate) num_traces: u64,

    /// Number of past decisions remembered for late spans. Equals
    /// `num_traces` when unset.
    pub(crate) history_size: Option<u64>,

    /// Expected number of new traces per second, used to size buffers.
    pub(crate) expected_new_traces_per_sec: u64,

    /// Deprecated spelling of `trace_accept_filters`.
    pub(crate) policies: Vec<TraceAcceptConfig>,

    /// Ordered accept rules.
    pub(crate) trace_accept_filters: Vec<TraceAcceptConfig>,

    /// Reject rules, evaluated before any accept rule.
    pub(crate) trace_reject_filters: Vec<TraceRejectConfig>,
}

impl Default for CascadingFilterConfig {
    fn default() -> Self {
        CascadingFilterConfigBuilder::default().build()
    }
}

impl CascadingFilterConfig {
    /// Returns a builder initialized with the default configuration.
    pub fn builder() -> CascadingFilterConfigBuilder {
        CascadingFilterConfigBuilder::default()
    }

    /// Computes the per-instance budgets and the final rule list.
    pub(crate) fn derive(&self) -> DerivedConfig {
        let collector_instances = if self.collector_instances == 0 {
            otel_info!(
                name: "CascadingFilter.Config.DefaultCollectorInstances",
                value = OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES_DEFAULT
            );
            OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES_DEFAULT
        } else {
            self.collector_instances
        };

        let mut accept_rules = self.trace_accept_filters.clone();
        if !self.policies.is_empty() {
            otel_warn!(
                name: "CascadingFilter.Config.DeprecatedPolicies",
                message = "'policies' is deprecated and will be removed in future versions, use 'trace_accept_filters' instead"
            );
            accept_rules.extend(self.policies.iter().cloned());
        }

        let mut total_rate = 0;
        for rule in accept_rules.iter_mut() {
            if rule.spans_per_second > 0 {
                rule.spans_per_second =
                    calculate_spans_per_second(rule.spans_per_second, collector_instances);
                total_rate += rule.spans_per_second;
            }
        }

        let configured_spans_per_second =
            calculate_spans_per_second(self.spans_per_second, collector_instances);
        let mut global_spans_per_second = configured_spans_per_second;
        if global_spans_per_second == 0 {
            global_spans_per_second = total_rate;
            if let Some(rate) = self.probabilistic_filtering_rate.filter(|rate| *rate > 0) {
                global_spans_per_second += rate;
            }
        }

        if global_spans_per_second != 0 {
            otel_info!(
                name: "CascadingFilter.Config.GlobalSpansPerSecond",
                spans_per_second = global_spans_per_second,
                collector_instances = collector_instances
            );
        } else {
            otel_info!(
                name: "CascadingFilter.Config.NoGlobalLimit",
                message = "Not setting total spans per second limit, only selected traces will be filtered out"
            );
        }

        let probabilistic_filtering_rate = match (
            self.probabilistic_filtering_ratio,
            self.probabilistic_filtering_rate,
        ) {
            (Some(ratio), _) if ratio > 0.0 && global_spans_per_second > 0 => {
                Some((global_spans_per_second as f64 * ratio) as i64)
            }
            (_, Some(rate)) if rate > 0 => Some(rate),
            _ => None,
        }
        .filter(|rate| *rate > 0);

        if let Some(rate) = probabilistic_filtering_rate {
            otel_info!(
                name: "CascadingFilter.Config.ProbabilisticFilteringRate",
                probabilistic_filtering_rate = rate
            );
        } else {
            otel_info!(name: "CascadingFilter.Config.NoProbabilisticFiltering");
        }

        let history_size = self.history_size.unwrap_or_else(|| {
            otel_info!(
                name: "CascadingFilter.Config.HistorySizeDefault",
                num_traces = self.num_traces
            );
            self.num_traces
        });

        let prior_spans_rate = self.prior_spans_rate.unwrap_or_else(|| {
            let rate = configured_spans_per_second / 2;
            otel_info!(
                name: "CascadingFilter.Config.PriorSpansRateDefault",
                prior_spans_rate = rate
            );
            rate
        });

        DerivedConfig {
            accept_rules,
            global_spans_per_second,
            probabilistic_filtering_rate,
            prior_spans_rate,
            history_size,
            num_batches: self.decision_wait.as_secs(),
        }
    }
}

/// Per-instance values computed from a [`CascadingFilterConfig`].
#[derive(Debug)]
pub(crate) struct DerivedConfig {
    /// Accept rules in evaluation order, budgets divided per instance.
    pub(crate) accept_rules: Vec<TraceAcceptConfig>,
    pub(crate) global_spans_per_second: i64,
    pub(crate) probabilistic_filtering_rate: Option<i64>,
    pub(crate) prior_spans_rate: i64,
    pub(crate) history_size: u64,
    pub(crate) num_batches: u64,
}

/// Share of `spans_per_second` for one of `collector_instances`, rounded up.
pub(crate) fn calculate_spans_per_second(spans_per_second: i64, collector_instances: u32) -> i64 {
    (spans_per_second as f64 / f64::from(collector_instances.max(1))).ceil() as i64
}

/// A builder for creating [`CascadingFilterConfig`] instances.
#[derive(Debug)]
pub struct CascadingFilterConfigBuilder {
    collector_instances: u32,
    decision_wait: Duration,
    spans_per_second: i64,
    prior_spans_rate: Option<i64>,
    probabilistic_filtering_ratio: Option<f64>,
    probabilistic_filtering_rate: Option<i64>,
    num_traces: u64,
    history_size: Option<u64>,
    expected_new_traces_per_sec: u64,
    policies: Vec<TraceAcceptConfig>,
    trace_accept_filters: Vec<TraceAcceptConfig>,
    trace_reject_filters: Vec<TraceRejectConfig>,
}

impl Default for CascadingFilterConfigBuilder {
    /// Create a new [`CascadingFilterConfigBuilder`] initialized with default values.
    /// The values are overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `OTEL_CASCADING_FILTER_DECISION_WAIT` (milliseconds)
    /// * `OTEL_CASCADING_FILTER_NUM_TRACES`
    /// * `OTEL_CASCADING_FILTER_SPANS_PER_SECOND`
    /// * `OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES`
    fn default() -> Self {
        CascadingFilterConfigBuilder {
            collector_instances: OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES_DEFAULT,
            decision_wait: Duration::from_millis(OTEL_CASCADING_FILTER_DECISION_WAIT_DEFAULT),
            spans_per_second: OTEL_CASCADING_FILTER_SPANS_PER_SECOND_DEFAULT,
            prior_spans_rate: None,
            probabilistic_filtering_ratio: None,
            probabilistic_filtering_rate: None,
            num_traces: OTEL_CASCADING_FILTER_NUM_TRACES_DEFAULT,
            history_size: None,
            expected_new_traces_per_sec: 0,
            policies: Vec::new(),
            trace_accept_filters: Vec::new(),
            trace_reject_filters: Vec::new(),
        }
        .init_from_env_vars()
    }
}

impl CascadingFilterConfigBuilder {
    /// Set the number of collectors sharing this configuration. Every budget
    /// is divided by it, rounded up. The default value is 1.
    pub fn with_collector_instances(mut self, collector_instances: u32) -> Self {
        self.collector_instances = collector_instances;
        self
    }

    /// Set the time spans of a trace are buffered before the trace is
    /// evaluated. Only whole seconds count; the default value is 30 seconds.
    pub fn with_decision_wait(mut self, decision_wait: Duration) -> Self {
        self.decision_wait = decision_wait;
        self
    }

    /// Set the global spans per second budget.
    pub fn with_spans_per_second(mut self, spans_per_second: i64) -> Self {
        self.spans_per_second = spans_per_second;
        self
    }

    /// Set the budget for late spans of already sampled traces.
    pub fn with_prior_spans_rate(mut self, prior_spans_rate: i64) -> Self {
        self.prior_spans_rate = Some(prior_spans_rate);
        self
    }

    /// Reserve a share of the global budget for probabilistic selection.
    pub fn with_probabilistic_filtering_ratio(mut self, ratio: f64) -> Self {
        self.probabilistic_filtering_ratio = Some(ratio);
        self
    }

    /// Reserve a fixed spans per second budget for probabilistic selection.
    pub fn with_probabilistic_filtering_rate(mut self, rate: i64) -> Self {
        self.probabilistic_filtering_rate = Some(rate);
        self
    }

    /// Set the maximum number of traces kept in memory.
    pub fn with_num_traces(mut self, num_traces: u64) -> Self {
        self.num_traces = num_traces;
        self
    }

    /// Set the number of past decisions remembered for late spans.
    pub fn with_history_size(mut self, history_size: u64) -> Self {
        self.history_size = Some(history_size);
        self
    }

    /// Set the expected number of new traces per second.
    pub fn with_expected_new_traces_per_sec(mut self, expected_new_traces_per_sec: u64) -> Self {
        self.expected_new_traces_per_sec = expected_new_traces_per_sec;
        self
    }

    /// Append an accept rule.
    pub fn with_trace_accept_filter(mut self, filter: TraceAcceptConfig) -> Self {
        self.trace_accept_filters.push(filter);
        self
    }

    /// Append accept rules.
    pub fn with_trace_accept_filters(
        mut self,
        filters: impl IntoIterator<Item = TraceAcceptConfig>,
    ) -> Self {
        self.trace_accept_filters.extend(filters);
        self
    }

    /// Append a reject rule.
    pub fn with_trace_reject_filter(mut self, filter: TraceRejectConfig) -> Self {
        self.trace_reject_filters.push(filter);
        self
    }

    /// Append accept rules under the deprecated `policies` key. They are
    /// evaluated after every rule added with
    /// [`with_trace_accept_filter`](Self::with_trace_accept_filter).
    #[deprecated(note = "use `with_trace_accept_filters` instead")]
    pub fn with_policies(mut self, policies: impl IntoIterator<Item = TraceAcceptConfig>) -> Self {
        self.policies.extend(policies);
        self
    }

    /// Builds a `CascadingFilterConfig`.
    pub fn build(self) -> CascadingFilterConfig {
        CascadingFilterConfig {
            collector_instances: self.collector_instances,
            decision_wait: self.decision_wait,
            spans_per_second: self.spans_per_second,
            prior_spans_rate: self.prior_spans_rate,
            probabilistic_filtering_ratio: self.probabilistic_filtering_ratio,
            probabilistic_filtering_rate: self.probabilistic_filtering_rate,
            num_traces: self.num_traces,
            history_size: self.history_size,
            expected_new_traces_per_sec: self.expected_new_traces_per_sec,
            policies: self.policies,
            trace_accept_filters: self.trace_accept_filters,
            trace_reject_filters: self.trace_reject_filters,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(decision_wait) = env::var(OTEL_CASCADING_FILTER_DECISION_WAIT)
            .ok()
            .and_then(|wait| u64::from_str(&wait).ok())
        {
            self.decision_wait = Duration::from_millis(decision_wait);
        }

        if let Some(num_traces) = env::var(OTEL_CASCADING_FILTER_NUM_TRACES)
            .ok()
            .and_then(|num_traces| u64::from_str(&num_traces).ok())
        {
            self.num_traces = num_traces;
        }

        if let Some(spans_per_second) = env::var(OTEL_CASCADING_FILTER_SPANS_PER_SECOND)
            .ok()
            .and_then(|spans| i64::from_str(&spans).ok())
        {
            self.spans_per_second = spans_per_second;
        }

        if let Some(collector_instances) = env::var(OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES)
            .ok()
            .and_then(|instances| u32::from_str(&instances).ok())
        {
            self.collector_instances = collector_instances;
        }

        self
    }
}

#[cfg(feature = "serde")]
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(feature = "serde")]
fn deserialize_opt_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL_ENV_VARS: [&str; 4] = [
        OTEL_CASCADING_FILTER_DECISION_WAIT,
        OTEL_CASCADING_FILTER_NUM_TRACES,
        OTEL_CASCADING_FILTER_SPANS_PER_SECOND,
        OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES,
    ];

    fn rule(name: &str, spans_per_second: i64) -> TraceAcceptConfig {
        TraceAcceptConfig {
            name: name.to_string(),
            spans_per_second,
            ..Default::default()
        }
    }

    fn default_config() -> CascadingFilterConfigBuilder {
        temp_env::with_vars_unset(ALL_ENV_VARS, CascadingFilterConfig::builder)
    }

    #[test]
    fn test_default_const_values() {
        assert_eq!(
            OTEL_CASCADING_FILTER_DECISION_WAIT,
            "OTEL_CASCADING_FILTER_DECISION_WAIT"
        );
        assert_eq!(OTEL_CASCADING_FILTER_DECISION_WAIT_DEFAULT, 30_000);
        assert_eq!(OTEL_CASCADING_FILTER_NUM_TRACES_DEFAULT, 100_000);
        assert_eq!(OTEL_CASCADING_FILTER_SPANS_PER_SECOND_DEFAULT, 0);
        assert_eq!(OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES_DEFAULT, 1);
    }

    #[test]
    fn test_default_config() {
        let config = temp_env::with_vars_unset(ALL_ENV_VARS, CascadingFilterConfig::default);

        assert_eq!(config.decision_wait, Duration::from_secs(30));
        assert_eq!(config.num_traces, 100_000);
        assert_eq!(config.spans_per_second, 0);
        assert_eq!(config.collector_instances, 1);
        assert!(config.history_size.is_none());
        assert!(config.trace_accept_filters.is_empty());
    }

    #[test]
    fn test_config_with_env_vars() {
        let env_vars = vec![
            (OTEL_CASCADING_FILTER_DECISION_WAIT, Some("5000")),
            (OTEL_CASCADING_FILTER_NUM_TRACES, Some("2000")),
            (OTEL_CASCADING_FILTER_SPANS_PER_SECOND, Some("300")),
            (OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES, Some("3")),
        ];

        let config = temp_env::with_vars(env_vars, CascadingFilterConfig::default);

        assert_eq!(config.decision_wait, Duration::from_secs(5));
        assert_eq!(config.num_traces, 2000);
        assert_eq!(config.spans_per_second, 300);
        assert_eq!(config.collector_instances, 3);
    }

    #[test]
    fn test_config_with_invalid_env_vars() {
        let env_vars = vec![
            (OTEL_CASCADING_FILTER_DECISION_WAIT, Some("soon")),
            (OTEL_CASCADING_FILTER_NUM_TRACES, Some("-4")),
            (OTEL_CASCADING_FILTER_SPANS_PER_SECOND, None),
            (OTEL_CASCADING_FILTER_COLLECTOR_INSTANCES, None),
        ];

        let config = temp_env::with_vars(env_vars, CascadingFilterConfig::default);

        assert_eq!(config.decision_wait, Duration::from_secs(30));
        assert_eq!(config.num_traces, 100_000);
    }

    #[test]
    fn test_builder_overrides_env_vars() {
        let config = temp_env::with_var(OTEL_CASCADING_FILTER_NUM_TRACES, Some("10"), || {
            CascadingFilterConfig::builder()
                .with_num_traces(20)
                .build()
        });
        assert_eq!(config.num_traces, 20);
    }

    #[rstest]
    #[case(1000, 10, 100)]
    #[case(1000, 325, 4)]
    #[case(60, 1, 60)]
    #[case(0, 7, 0)]
    #[case(-1, 2, 0)]
    #[case(5, 0, 5)]
    fn test_calculate_spans_per_second(
        #[case] spans_per_second: i64,
        #[case] collector_instances: u32,
        #[case] expected: i64,
    ) {
        assert_eq!(
            calculate_spans_per_second(spans_per_second, collector_instances),
            expected
        );
    }

    #[rstest]
    #[case(1, 110)]
    #[case(10, 11)]
    fn test_global_budget_derived_from_rules(
        #[case] collector_instances: u32,
        #[case] expected: i64,
    ) {
        let config = default_config()
            .with_collector_instances(collector_instances)
            .with_trace_accept_filters([rule("a", 100), rule("b", 10), rule("c", -1)])
            .build();

        let derived = config.derive();
        assert_eq!(derived.global_spans_per_second, expected);
        assert_eq!(derived.accept_rules[2].spans_per_second, -1);
        assert_eq!(derived.prior_spans_rate, 0);
    }

    #[test]
    fn test_global_budget_divided_per_instance() {
        let config = default_config()
            .with_spans_per_second(1000)
            .with_collector_instances(10)
            .with_trace_accept_filter(rule("a", 55))
            .build();

        let derived = config.derive();
        assert_eq!(derived.global_spans_per_second, 100);
        assert_eq!(derived.accept_rules[0].spans_per_second, 6);
        assert_eq!(derived.prior_spans_rate, 50);
    }

    #[test]
    fn test_zero_collector_instances_treated_as_one() {
        let config = default_config()
            .with_spans_per_second(60)
            .with_collector_instances(0)
            .build();
        assert_eq!(config.derive().global_spans_per_second, 60);
    }

    #[test]
    fn test_probabilistic_rate_added_to_derived_budget() {
        let config = default_config()
            .with_trace_accept_filter(rule("a", 100))
            .with_probabilistic_filtering_rate(20)
            .build();

        let derived = config.derive();
        assert_eq!(derived.global_spans_per_second, 120);
        assert_eq!(derived.probabilistic_filtering_rate, Some(20));
    }

    #[test]
    fn test_probabilistic_ratio_wins_over_rate() {
        let config = default_config()
            .with_spans_per_second(1000)
            .with_probabilistic_filtering_ratio(0.2)
            .with_probabilistic_filtering_rate(50)
            .build();
        assert_eq!(config.derive().probabilistic_filtering_rate, Some(200));
    }

    #[test]
    fn test_probabilistic_ratio_without_budget_is_ignored() {
        let config = default_config()
            .with_probabilistic_filtering_ratio(0.2)
            .build();
        assert_eq!(config.derive().probabilistic_filtering_rate, None);
    }

    #[test]
    fn test_history_size_and_batches() {
        let config = default_config()
            .with_num_traces(500)
            .with_decision_wait(Duration::from_millis(2500))
            .build();
        let derived = config.derive();
        assert_eq!(derived.history_size, 500);
        assert_eq!(derived.num_batches, 2);

        let config = default_config().with_history_size(42).build();
        assert_eq!(config.derive().history_size, 42);
    }

    #[test]
    #[allow(deprecated)]
    fn test_deprecated_policies_follow_accept_filters() {
        let config = default_config()
            .with_policies([rule("legacy", 5)])
            .with_trace_accept_filter(rule("current", 5))
            .build();

        let names: Vec<_> = config
            .derive()
            .accept_rules
            .into_iter()
            .map(|rule| rule.name)
            .collect();
        assert_eq!(names, vec!["current", "legacy"]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "decision_wait": 10000,
            "spans_per_second": 500,
            "probabilistic_filtering_ratio": 0.1,
            "trace_reject_filters": [
                { "name": "healthchecks", "name_pattern": "health.*" }
            ],
            "trace_accept_filters": [
                {
                    "name": "slow",
                    "spans_per_second": 100,
                    "properties": { "min_duration": 2000 }
                },
                {
                    "name": "errors",
                    "spans_per_second": -1,
                    "attributes": [
                        { "key": "http.status_code", "ranges": [{ "min": 500, "max": 599 }] }
                    ]
                }
            ]
        }"#;

        let config: CascadingFilterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.decision_wait, Duration::from_secs(10));
        assert_eq!(config.spans_per_second, 500);
        assert_eq!(config.trace_reject_filters[0].name_pattern.as_deref(), Some("health.*"));
        assert_eq!(
            config.trace_accept_filters[0].properties.min_duration,
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            config.trace_accept_filters[1].attributes[0].ranges,
            vec![AttributeRange { min: 500, max: 599 }]
        );
        assert_eq!(config.derive().probabilistic_filtering_rate, Some(50));
    }
}
