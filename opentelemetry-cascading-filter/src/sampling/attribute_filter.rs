use crate::config::{AttributeConfig, NumericAttributeConfig, StringAttributeConfig};
use crate::error::CascadingFilterResult;
use crate::model;
use opentelemetry::{KeyValue, Value};
use regex::Regex;
use std::collections::HashSet;

// string view of an attribute value, empty for anything but strings
fn str_value(value: &Value) -> &str {
    match value {
        Value::String(s) => s.as_str(),
        _ => "",
    }
}

fn compile_patterns(values: &[String]) -> CascadingFilterResult<Vec<Regex>> {
    values
        .iter()
        .map(|value| Regex::new(value).map_err(Into::into))
        .collect()
}

/// Matches an integer attribute within an inclusive range.
#[derive(Debug)]
pub(crate) struct NumericAttributeFilter {
    key: String,
    min_value: i64,
    max_value: i64,
}

impl NumericAttributeFilter {
    pub(crate) fn new(config: &NumericAttributeConfig) -> Self {
        NumericAttributeFilter {
            key: config.key.clone(),
            min_value: config.min_value,
            max_value: config.max_value,
        }
    }

    pub(crate) fn matches(&self, attributes: &[KeyValue]) -> bool {
        match model::find_attribute(attributes, &self.key) {
            Some(Value::I64(value)) => (self.min_value..=self.max_value).contains(value),
            _ => false,
        }
    }

    /// Matches on the span, or on the resource when the span lacks the key.
    pub(crate) fn matches_span_or_resource(
        &self,
        resource: &[KeyValue],
        span: &[KeyValue],
    ) -> bool {
        match model::find_attribute(span, &self.key) {
            Some(_) => self.matches(span),
            None => self.matches(resource),
        }
    }
}

/// Matches a string attribute against exact values or, with `use_regex`,
/// against patterns.
#[derive(Debug)]
pub(crate) struct StringAttributeFilter {
    key: String,
    values: HashSet<String>,
    patterns: Option<Vec<Regex>>,
}

impl StringAttributeFilter {
    pub(crate) fn new(config: &StringAttributeConfig) -> CascadingFilterResult<Self> {
        let (values, patterns) = if config.use_regex {
            (HashSet::new(), Some(compile_patterns(&config.values)?))
        } else {
            (config.values.iter().cloned().collect(), None)
        };
        Ok(StringAttributeFilter {
            key: config.key.clone(),
            values,
            patterns,
        })
    }

    pub(crate) fn matches(&self, attributes: &[KeyValue]) -> bool {
        let Some(value) = model::find_attribute(attributes, &self.key) else {
            return false;
        };
        let value = str_value(value);
        match &self.patterns {
            Some(patterns) => patterns.iter().any(|re| re.is_match(value)),
            None => !value.is_empty() && self.values.contains(value),
        }
    }

    /// Matches on the span, or on the resource when the span lacks the key.
    pub(crate) fn matches_span_or_resource(
        &self,
        resource: &[KeyValue],
        span: &[KeyValue],
    ) -> bool {
        match model::find_attribute(span, &self.key) {
            Some(_) => self.matches(span),
            None => self.matches(resource),
        }
    }
}

/// Generic per-key attribute predicate: string values or patterns, numeric
/// ranges, or plain presence of the key when neither is configured.
#[derive(Debug)]
pub(crate) struct AttributeFilter {
    key: String,
    values: HashSet<String>,
    patterns: Vec<Regex>,
    ranges: Vec<(i64, i64)>,
}

impl AttributeFilter {
    pub(crate) fn new(config: &AttributeConfig) -> CascadingFilterResult<Self> {
        let (values, patterns) = if config.use_regex {
            (HashSet::new(), compile_patterns(&config.values)?)
        } else {
            (config.values.iter().cloned().collect(), Vec::new())
        };
        Ok(AttributeFilter {
            key: config.key.clone(),
            values,
            patterns,
            ranges: config.ranges.iter().map(|r| (r.min, r.max)).collect(),
        })
    }

    pub(crate) fn from_configs(configs: &[AttributeConfig]) -> CascadingFilterResult<Vec<Self>> {
        configs.iter().map(AttributeFilter::new).collect()
    }

    /// Returns `(matched, found)`: whether the predicate holds and whether the
    /// key is present at all.
    fn matched_and_found(&self, attributes: &[KeyValue]) -> (bool, bool) {
        let Some(value) = model::find_attribute(attributes, &self.key) else {
            return (false, false);
        };

        // patterns and exact values are exclusive
        if !self.patterns.is_empty() {
            let s = str_value(value);
            if self.patterns.iter().any(|re| re.is_match(s)) {
                return (true, true);
            }
        } else if !self.values.is_empty() {
            let s = str_value(value);
            if !s.is_empty() && self.values.contains(s) {
                return (true, true);
            }
        }

        if !self.ranges.is_empty() {
            let in_range = match value {
                Value::I64(v) => self.ranges.iter().any(|&(min, max)| *v >= min && *v <= max),
                Value::F64(v) => self
                    .ranges
                    .iter()
                    .any(|&(min, max)| *v >= min as f64 && *v <= max as f64),
                _ => false,
            };
            if in_range {
                return (true, true);
            }
        }

        if self.ranges.is_empty() && self.values.is_empty() && self.patterns.is_empty() {
            return (true, true);
        }

        (false, true)
    }
}

/// Every filter must match on the span, or on the resource when the span
/// does not carry the key at all.
pub(crate) fn attributes_matched(
    resource: &[KeyValue],
    span: &[KeyValue],
    filters: &[AttributeFilter],
) -> bool {
    filters.iter().all(|filter| {
        let (span_matched, span_found) = filter.matched_and_found(span);
        span_matched || (!span_found && filter.matched_and_found(resource).0)
    })
}
