use super::attribute_filter::{
    attributes_matched, AttributeFilter, NumericAttributeFilter, StringAttributeFilter,
};
use super::{DropTraceEvaluator, TraceData};
use crate::config::TraceRejectConfig;
use crate::error::{CascadingFilterError, CascadingFilterResult};
use crate::model::Span;
use opentelemetry::trace::{Status, TraceId};
use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    fn parse(code: &str) -> CascadingFilterResult<Self> {
        match code {
            "Unset" => Ok(StatusCode::Unset),
            "Ok" => Ok(StatusCode::Ok),
            "Error" => Ok(StatusCode::Error),
            other => Err(CascadingFilterError::InvalidStatusCode(other.to_string())),
        }
    }

    fn of(span: &Span) -> Self {
        if span.is_error() {
            StatusCode::Error
        } else if span.status == Status::Ok {
            StatusCode::Ok
        } else {
            StatusCode::Unset
        }
    }
}

/// Reject rule built from a [`TraceRejectConfig`].
///
/// The trace is dropped when every configured category finds a match
/// somewhere in the trace. The status code is only compared on root spans.
#[derive(Debug)]
pub struct DropTraceFilter {
    name_pattern: Option<Regex>,
    numeric_attr: Option<NumericAttributeFilter>,
    string_attr: Option<StringAttributeFilter>,
    attrs: Vec<AttributeFilter>,
    status_code: Option<StatusCode>,
}

impl DropTraceFilter {
    /// Builds the rule, compiling its patterns and validating the status code.
    pub fn new(config: &TraceRejectConfig) -> CascadingFilterResult<Self> {
        Ok(DropTraceFilter {
            name_pattern: config.name_pattern.as_deref().map(Regex::new).transpose()?,
            numeric_attr: config.numeric_attribute.as_ref().map(NumericAttributeFilter::new),
            string_attr: config
                .string_attribute
                .as_ref()
                .map(StringAttributeFilter::new)
                .transpose()?,
            attrs: AttributeFilter::from_configs(&config.attributes)?,
            status_code: config
                .status_code
                .as_deref()
                .map(StatusCode::parse)
                .transpose()?,
        })
    }
}

impl DropTraceEvaluator for DropTraceFilter {
    fn should_drop(&self, _trace_id: TraceId, trace: &TraceData) -> bool {
        let state = trace.lock();

        let mut operation_found = false;
        let mut string_attr_found = false;
        let mut numeric_attr_found = false;
        let mut attrs_found = false;
        let mut status_code_found = false;

        for resource_spans in state.received_batches.iter().flatten() {
            let resource = &resource_spans.resource;

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
                if let Some(code) = self.status_code.filter(|_| !status_code_found) {
                    status_code_found = span.is_root() && StatusCode::of(span) == code;
                }
                if let Some(re) = self.name_pattern.as_ref().filter(|_| !operation_found) {
                    operation_found = re.is_match(&span.name);
                }
            }
        }

        (self.name_pattern.is_none() || operation_found)
            && (self.numeric_attr.is_none() || numeric_attr_found)
            && (self.string_attr.is_none() || string_attr_found)
            && (self.attrs.is_empty() || attrs_found)
            && (self.status_code.is_none() || status_code_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NumericAttributeConfig, StringAttributeConfig};
    use crate::model::ResourceSpans;
    use crate::sampling::tests::{span_with_attributes, test_trace_id};
    use opentelemetry::trace::SpanId;
    use opentelemetry::KeyValue;
    use rstest::rstest;

    fn named_span(name: &'static str, attributes: Vec<KeyValue>) -> Span {
        let mut span = span_with_attributes(attributes);
        span.name = name.into();
        span
    }

    fn trace_of(spans: Vec<Span>) -> TraceData {
        TraceData::new(vec![ResourceSpans::new(vec![], spans)], 0)
    }

    fn reject(config: TraceRejectConfig) -> DropTraceFilter {
        DropTraceFilter::new(&config).unwrap()
    }

    #[test]
    fn name_pattern_drops_whole_trace() {
        let filter = reject(TraceRejectConfig {
            name_pattern: Some("health.*".into()),
            ..Default::default()
        });
        let trace = trace_of(vec![
            named_span("GET /orders", vec![]),
            named_span("healthcheck", vec![]),
        ]);
        assert!(filter.should_drop(test_trace_id(), &trace));

        let trace = trace_of(vec![named_span("GET /orders", vec![])]);
        assert!(!filter.should_drop(test_trace_id(), &trace));
    }

    #[test]
    fn categories_are_and_combined() {
        let filter = reject(TraceRejectConfig {
            name_pattern: Some("health.*".into()),
            string_attribute: Some(StringAttributeConfig {
                key: "env".into(),
                values: vec!["staging".into()],
                use_regex: false,
            }),
            numeric_attribute: Some(NumericAttributeConfig {
                key: "http.status_code".into(),
                min_value: 200,
                max_value: 299,
            }),
            ..Default::default()
        });

        // matches found on different spans still count
        let all_matched = trace_of(vec![
            named_span("healthcheck", vec![KeyValue::new("http.status_code", 200)]),
            named_span("db", vec![KeyValue::new("env", "staging")]),
        ]);
        assert!(filter.should_drop(test_trace_id(), &all_matched));

        let missing_numeric = trace_of(vec![
            named_span("healthcheck", vec![KeyValue::new("http.status_code", 503)]),
            named_span("db", vec![KeyValue::new("env", "staging")]),
        ]);
        assert!(!filter.should_drop(test_trace_id(), &missing_numeric));

        let missing_name = trace_of(vec![
            named_span("GET /orders", vec![KeyValue::new("http.status_code", 200)]),
            named_span("db", vec![KeyValue::new("env", "staging")]),
        ]);
        assert!(!filter.should_drop(test_trace_id(), &missing_name));

        let missing_string = trace_of(vec![
            named_span("healthcheck", vec![KeyValue::new("http.status_code", 200)]),
            named_span("db", vec![KeyValue::new("env", "production")]),
        ]);
        assert!(!filter.should_drop(test_trace_id(), &missing_string));
    }

    #[rstest]
    #[case("staging", true)]
    #[case("qa", true)]
    #[case("production", false)]
    fn any_listed_value_matches(#[case] env: &'static str, #[case] dropped: bool) {
        let filter = reject(TraceRejectConfig {
            string_attribute: Some(StringAttributeConfig {
                key: "env".into(),
                values: vec!["staging".into(), "qa".into()],
                use_regex: false,
            }),
            ..Default::default()
        });
        let trace = trace_of(vec![named_span("db", vec![KeyValue::new("env", env)])]);
        assert_eq!(filter.should_drop(test_trace_id(), &trace), dropped);
    }

    #[test]
    fn resource_attributes_count() {
        let filter = reject(TraceRejectConfig {
            string_attribute: Some(StringAttributeConfig {
                key: "service.name".into(),
                values: vec!["synthetic-.*".into()],
                use_regex: true,
            }),
            ..Default::default()
        });
        let trace = TraceData::new(
            vec![ResourceSpans::new(
                vec![KeyValue::new("service.name", "synthetic-probe")],
                vec![span_with_attributes(vec![])],
            )],
            0,
        );
        assert!(filter.should_drop(test_trace_id(), &trace));
    }

    #[rstest]
    #[case("Error", Status::error("boom"), true)]
    #[case("Error", Status::Ok, false)]
    #[case("Ok", Status::Ok, true)]
    #[case("Unset", Status::Unset, true)]
    fn status_code_on_root_span(
        #[case] code: &str,
        #[case] status: Status,
        #[case] expected: bool,
    ) {
        let filter = reject(TraceRejectConfig {
            status_code: Some(code.into()),
            ..Default::default()
        });
        let mut root = span_with_attributes(vec![]);
        root.status = status;
        assert_eq!(filter.should_drop(test_trace_id(), &trace_of(vec![root])), expected);
    }

    #[test]
    fn status_code_ignores_child_spans() {
        let filter = reject(TraceRejectConfig {
            status_code: Some("Error".into()),
            ..Default::default()
        });
        let mut child = span_with_attributes(vec![]);
        child.parent_span_id = SpanId::from_bytes([9; 8]);
        child.status = Status::error("boom");
        let root = span_with_attributes(vec![]);
        assert!(!filter.should_drop(test_trace_id(), &trace_of(vec![root, child])));
    }

    #[test]
    fn invalid_status_code_is_rejected() {
        let err = DropTraceFilter::new(&TraceRejectConfig {
            status_code: Some("Fatal".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("must be one of 'Error', 'Ok', or 'Unset'"));
    }

    #[test]
    fn empty_rule_drops_everything() {
        let filter = reject(TraceRejectConfig::default());
        assert!(filter.should_drop(test_trace_id(), &trace_of(vec![])));
    }
}
