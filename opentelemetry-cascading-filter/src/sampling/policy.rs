use super::attribute_filter::{
    attributes_matched, AttributeFilter, NumericAttributeFilter, StringAttributeFilter,
};
use super::{Decision, PolicyEvaluator, TraceData};
use crate::config::TraceAcceptConfig;
use crate::error::CascadingFilterResult;
use crate::rate_limiter::RateLimiter;
use opentelemetry::trace::TraceId;
use regex::Regex;
use std::time::Duration;

/// Accept rule built from a [`TraceAcceptConfig`].
///
/// A trace matches when every configured predicate holds:
///
/// * `name_pattern` matches the name of any span,
/// * the string, numeric and generic attribute predicates match on any span
///   (or its resource),
/// * the trace has at least `min_number_of_spans` spans and
///   `min_number_of_errors` error spans,
/// * the trace lasts at least `min_duration`.
///
/// A matching trace is sampled as long as the rule budget allows it. Rules
/// with a negative budget hand out [`Decision::SecondChance`] instead.
#[derive(Debug)]
pub struct PolicyFilter {
    name_pattern: Option<Regex>,
    min_duration: Option<Duration>,
    min_number_of_spans: Option<usize>,
    min_number_of_errors: Option<usize>,
    numeric_attr: Option<NumericAttributeFilter>,
    string_attr: Option<StringAttributeFilter>,
    attrs: Vec<AttributeFilter>,
    invert_match: bool,
    limiter: RateLimiter,
}

impl PolicyFilter {
    /// Builds the rule, compiling every pattern it holds.
    ///
    /// The budget is taken as is; dividing it between collector instances is
    /// up to the caller.
    pub fn new(config: &TraceAcceptConfig) -> CascadingFilterResult<Self> {
        let properties = &config.properties;
        Ok(PolicyFilter {
            name_pattern: properties
                .name_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()?,
            min_duration: properties.min_duration,
            min_number_of_spans: properties.min_number_of_spans,
            min_number_of_errors: properties.min_number_of_errors,
            numeric_attr: config.numeric_attribute.as_ref().map(NumericAttributeFilter::new),
            string_attr: config
                .string_attribute
                .as_ref()
                .map(StringAttributeFilter::new)
                .transpose()?,
            attrs: AttributeFilter::from_configs(&config.attributes)?,
            invert_match: config.invert_match,
            limiter: RateLimiter::new(config.spans_per_second),
        })
    }

    fn emits_second_chance(&self) -> bool {
        self.limiter.spans_per_second() < 0
    }

    // early reject when the trace cannot fit in what is left of the budget
    fn should_consider(&self, current_second: u64, span_count: i64) -> bool {
        if self.emits_second_chance() {
            return true;
        }
        let max = self.limiter.spans_per_second();
        span_count <= max && span_count <= max - self.limiter.used_in(current_second)
    }

    fn evaluate_rules(&self, trace: &TraceData) -> Decision {
        let state = trace.lock();

        let mut operation_found = false;
        let mut string_attr_found = false;
        let mut numeric_attr_found = false;
        let mut attrs_found = false;

        let mut span_count = 0;
        let mut error_count = 0;
        let mut time_range: Option<(i64, i64)> = None;

        for resource_spans in state.received_batches.iter().flatten() {
            let resource = &resource_spans.resource;

            span_count += resource_spans.spans.len();
            for span in &resource_spans.spans {
                if !attrs_found && !self.attrs.is_empty() {
                    attrs_found = attributes_matched(resource, &span.attributes, &self.attrs);
                }
                if let Some(filter) = self.string_attr.as_ref().filter(|_| !string_attr_found) {
                    string_attr_found = filter.matches_span_or_resource(resource, &span.attributes);
                }
                if let Some(filter) = self.numeric_attr.as_ref().filter(|_| !numeric_attr_found) {
                    numeric_attr_found =
                        filter.matches_span_or_resource(resource, &span.attributes);
                }
                if let Some(re) = self.name_pattern.as_ref().filter(|_| !operation_found) {
                    operation_found = re.is_match(&span.name);
                }

                if self.min_duration.is_some() {
                    let (start, end) = (span.start_micros(), span.end_micros());
                    time_range = Some(match time_range {
                        None => (start, end),
                        Some((min_start, max_end)) => (min_start.min(start), max_end.max(end)),
                    });
                }

                if span.is_error() {
                    error_count += 1;
                }
            }
        }
        drop(state);

        let matched = (self.name_pattern.is_none() || operation_found)
            && self.min_number_of_spans.map_or(true, |min| span_count >= min)
            && self.min_duration.map_or(true, |min| match time_range {
                Some((start, end)) => end > start && end - start >= min.as_micros() as i64,
                None => false,
            })
            && (self.numeric_attr.is_none() || numeric_attr_found)
            && (self.string_attr.is_none() || string_attr_found)
            && (self.attrs.is_empty() || attrs_found)
            && self.min_number_of_errors.map_or(true, |min| error_count >= min);

        if matched != self.invert_match {
            Decision::Sampled
        } else {
            Decision::NotSampled
        }
    }
}

impl PolicyEvaluator for PolicyFilter {
    fn evaluate(&mut self, _trace_id: TraceId, trace: &TraceData, current_second: u64) -> Decision {
        let span_count = trace.span_count();
        if !self.should_consider(current_second, span_count) {
            return Decision::NotSampled;
        }

        let decision = self.evaluate_rules(trace);
        if decision != Decision::Sampled {
            return decision;
        }

        if self.emits_second_chance() {
            return Decision::SecondChance;
        }

        self.limiter.update_rate(current_second, span_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AttributeConfig, NumericAttributeConfig, PropertiesConfig, StringAttributeConfig,
    };
    use crate::model::ResourceSpans;
    use crate::sampling::tests::{test_trace_id, timed_span, trace_with_attributes};
    use opentelemetry::KeyValue;
    use rstest::rstest;

    fn accept(config: TraceAcceptConfig) -> PolicyFilter {
        PolicyFilter::new(&TraceAcceptConfig {
            spans_per_second: i64::from(i32::MAX),
            ..config
        })
        .unwrap()
    }

    fn evaluate(filter: &mut PolicyFilter, trace: &TraceData) -> Decision {
        filter.evaluate(test_trace_id(), trace, 1)
    }

    fn timed_trace(spans: Vec<(u64, u64, bool)>) -> TraceData {
        let spans = spans
            .into_iter()
            .map(|(start, end, error)| timed_span(start, end, error))
            .collect();
        TraceData::new(vec![ResourceSpans::new(vec![], spans)], 1)
    }

    #[rstest]
    #[case(vec![KeyValue::new("non_matching", "value")], vec![], Decision::NotSampled)]
    #[case(vec![KeyValue::new("example", "non_matching")], vec![], Decision::NotSampled)]
    #[case(vec![KeyValue::new("example", "value")], vec![], Decision::Sampled)]
    #[case(vec![], vec![KeyValue::new("nonmatching", "value")], Decision::NotSampled)]
    #[case(vec![], vec![KeyValue::new("example", "nonmatching")], Decision::NotSampled)]
    #[case(vec![], vec![KeyValue::new("example", "value")], Decision::Sampled)]
    fn string_attribute_rule(
        #[case] resource: Vec<KeyValue>,
        #[case] span: Vec<KeyValue>,
        #[case] expected: Decision,
        #[values(false, true)] use_regex: bool,
    ) {
        let mut filter = accept(TraceAcceptConfig {
            string_attribute: Some(StringAttributeConfig {
                key: "example".into(),
                values: vec![if use_regex { "val.*" } else { "value" }.into()],
                use_regex,
            }),
            ..Default::default()
        });
        let trace = trace_with_attributes(resource, span);
        assert_eq!(evaluate(&mut filter, &trace), expected);
    }

    #[test]
    fn numeric_attribute_rule_checks_resource_too() {
        let mut filter = accept(TraceAcceptConfig {
            numeric_attribute: Some(NumericAttributeConfig {
                key: "example".into(),
                min_value: 5,
                max_value: 10,
            }),
            ..Default::default()
        });
        let on_resource = trace_with_attributes(vec![KeyValue::new("example", 8)], vec![]);
        let out_of_range = trace_with_attributes(vec![], vec![KeyValue::new("example", 11)]);

        assert_eq!(evaluate(&mut filter, &on_resource), Decision::Sampled);
        assert_eq!(evaluate(&mut filter, &out_of_range), Decision::NotSampled);
    }

    #[rstest]
    #[case(vec![KeyValue::new("example", 8)], vec![KeyValue::new("example", 11)], false)]
    #[case(vec![KeyValue::new("example", 11)], vec![KeyValue::new("example", 8)], true)]
    #[case(vec![KeyValue::new("example", 8)], vec![KeyValue::new("other", 11)], true)]
    fn span_value_shadows_resource_value(
        #[case] resource: Vec<KeyValue>,
        #[case] span: Vec<KeyValue>,
        #[case] sampled: bool,
    ) {
        let mut filter = accept(TraceAcceptConfig {
            numeric_attribute: Some(NumericAttributeConfig {
                key: "example".into(),
                min_value: 5,
                max_value: 10,
            }),
            ..Default::default()
        });
        let expected = if sampled {
            Decision::Sampled
        } else {
            Decision::NotSampled
        };
        assert_eq!(
            evaluate(&mut filter, &trace_with_attributes(resource, span)),
            expected
        );
    }

    #[test]
    fn string_span_value_shadows_resource_value() {
        let mut filter = accept(TraceAcceptConfig {
            string_attribute: Some(StringAttributeConfig {
                key: "example".into(),
                values: vec!["value".into()],
                use_regex: false,
            }),
            ..Default::default()
        });
        let trace = trace_with_attributes(
            vec![KeyValue::new("example", "value")],
            vec![KeyValue::new("example", "other")],
        );
        assert_eq!(evaluate(&mut filter, &trace), Decision::NotSampled);
    }

    #[test]
    fn name_pattern_matches_any_span() {
        let mut filter = accept(TraceAcceptConfig {
            properties: PropertiesConfig {
                name_pattern: Some("^checkout".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut trace = trace_with_attributes(vec![], vec![]);
        assert_eq!(evaluate(&mut filter, &trace), Decision::NotSampled);

        let mut span = timed_span(0, 1, false);
        span.name = "checkout.pay".into();
        trace = TraceData::new(
            vec![ResourceSpans::new(vec![], vec![timed_span(0, 1, false), span])],
            1,
        );
        assert_eq!(evaluate(&mut filter, &trace), Decision::Sampled);
    }

    #[rstest]
    #[case(vec![(1_000, 2_000, false), (1_500, 6_000, false)], Decision::Sampled)]
    #[case(vec![(1_000, 2_000, false), (1_500, 4_999, false)], Decision::NotSampled)]
    #[case(vec![(3_000, 3_000, false)], Decision::NotSampled)]
    fn min_duration_spans_earliest_start_to_latest_end(
        #[case] spans: Vec<(u64, u64, bool)>,
        #[case] expected: Decision,
    ) {
        let mut filter = accept(TraceAcceptConfig {
            properties: PropertiesConfig {
                min_duration: Some(Duration::from_millis(5)),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(evaluate(&mut filter, &timed_trace(spans)), expected);
    }

    #[test]
    fn span_and_error_counts() {
        let mut filter = accept(TraceAcceptConfig {
            properties: PropertiesConfig {
                min_number_of_spans: Some(2),
                min_number_of_errors: Some(1),
                ..Default::default()
            },
            ..Default::default()
        });
        let healthy = timed_trace(vec![(1, 2, false), (1, 2, false)]);
        let failing = timed_trace(vec![(1, 2, false), (1, 2, true)]);
        let lone_error = timed_trace(vec![(1, 2, true)]);

        assert_eq!(evaluate(&mut filter, &healthy), Decision::NotSampled);
        assert_eq!(evaluate(&mut filter, &failing), Decision::Sampled);
        assert_eq!(evaluate(&mut filter, &lone_error), Decision::NotSampled);
    }

    #[test]
    fn invert_match_flips_result() {
        let mut filter = accept(TraceAcceptConfig {
            attributes: vec![AttributeConfig {
                key: "health".into(),
                ..Default::default()
            }],
            invert_match: true,
            ..Default::default()
        });
        let health = trace_with_attributes(vec![], vec![KeyValue::new("health", true)]);
        let business = trace_with_attributes(vec![], vec![KeyValue::new("order", 1)]);

        assert_eq!(evaluate(&mut filter, &health), Decision::NotSampled);
        assert_eq!(evaluate(&mut filter, &business), Decision::Sampled);
    }

    #[test]
    fn negative_budget_gives_second_chance() {
        let mut filter = PolicyFilter::new(&TraceAcceptConfig {
            spans_per_second: -1,
            ..Default::default()
        })
        .unwrap();
        let trace = timed_trace(vec![(1, 2, false); 50]);
        assert_eq!(evaluate(&mut filter, &trace), Decision::SecondChance);
    }

    #[test]
    fn budget_is_enforced_per_second() {
        let mut filter = PolicyFilter::new(&TraceAcceptConfig {
            spans_per_second: 3,
            ..Default::default()
        })
        .unwrap();
        let two_spans = timed_trace(vec![(1, 2, false); 2]);
        let four_spans = timed_trace(vec![(1, 2, false); 4]);

        assert_eq!(filter.evaluate(test_trace_id(), &four_spans, 10), Decision::NotSampled);
        assert_eq!(filter.evaluate(test_trace_id(), &two_spans, 10), Decision::Sampled);
        assert_eq!(filter.evaluate(test_trace_id(), &two_spans, 10), Decision::NotSampled);
        assert_eq!(filter.evaluate(test_trace_id(), &two_spans, 11), Decision::Sampled);
    }

    #[test]
    fn zero_budget_never_samples() {
        let mut filter = PolicyFilter::new(&TraceAcceptConfig::default()).unwrap();
        let trace = timed_trace(vec![(1, 2, false)]);
        assert_eq!(evaluate(&mut filter, &trace), Decision::NotSampled);
    }

    #[test]
    fn invalid_name_pattern_fails() {
        let result = PolicyFilter::new(&TraceAcceptConfig {
            properties: PropertiesConfig {
                name_pattern: Some("[".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(crate::CascadingFilterError::InvalidRegex(_))
        ));
    }
}
