//! Span data as it flows through the cascading filter.
//!
//! Spans arrive grouped by the resource that produced them. The filter
//! regroups them per trace, so a single [`ResourceSpans`] handed to the next
//! consumer only ever holds spans of one trace.
use opentelemetry::trace::{SpanId, Status, TraceId};
use opentelemetry::{KeyValue, Value};
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// A finished span.
#[derive(Clone, Debug, PartialEq)]
pub struct Span {
    /// Trace the span belongs to
    pub trace_id: TraceId,
    /// Span id
    pub span_id: SpanId,
    /// Span parent id, [`SpanId::INVALID`] for root spans
    pub parent_span_id: SpanId,
    /// Span name
    pub name: Cow<'static, str>,
    /// Span start time
    pub start_time: SystemTime,
    /// Span end time
    pub end_time: SystemTime,
    /// Span attributes
    pub attributes: Vec<KeyValue>,
    /// Span status
    pub status: Status,
}

impl Span {
    /// Creates a root span with the given ids and name, starting and ending now.
    pub fn new(trace_id: TraceId, span_id: SpanId, name: impl Into<Cow<'static, str>>) -> Self {
        let now = SystemTime::now();
        Span {
            trace_id,
            span_id,
            parent_span_id: SpanId::INVALID,
            name: name.into(),
            start_time: now,
            end_time: now,
            attributes: Vec::new(),
            status: Status::Unset,
        }
    }

    /// Returns `true` if the span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_span_id == SpanId::INVALID
    }

    /// Returns `true` if the span status is `Error`.
    pub fn is_error(&self) -> bool {
        matches!(self.status, Status::Error { .. })
    }

    /// Looks up a span attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        find_attribute(&self.attributes, key)
    }

    /// Sets an attribute, replacing any previous value with the same key.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        match self
            .attributes
            .iter_mut()
            .find(|kv| kv.key == attribute.key)
        {
            Some(existing) => existing.value = attribute.value,
            None => self.attributes.push(attribute),
        }
    }

    pub(crate) fn start_micros(&self) -> i64 {
        system_time_to_micros(self.start_time)
    }

    pub(crate) fn end_micros(&self) -> i64 {
        system_time_to_micros(self.end_time)
    }
}

/// A group of spans produced by one resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceSpans {
    /// Attributes of the resource that produced the spans
    pub resource: Vec<KeyValue>,
    /// Spans produced by the resource
    pub spans: Vec<Span>,
}

impl ResourceSpans {
    /// Creates a new group of spans for a resource.
    pub fn new(resource: Vec<KeyValue>, spans: Vec<Span>) -> Self {
        ResourceSpans { resource, spans }
    }

    /// Looks up a resource attribute by key.
    pub fn resource_attribute(&self, key: &str) -> Option<&Value> {
        find_attribute(&self.resource, key)
    }
}

/// Total number of spans across the given groups.
pub fn span_count(batch: &[ResourceSpans]) -> usize {
    batch.iter().map(|rs| rs.spans.len()).sum()
}

pub(crate) fn find_attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a Value> {
    attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

fn system_time_to_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => since_epoch.as_micros() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_micros() as i64),
    }
}
