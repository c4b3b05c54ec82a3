//! # Cascade
//!
//! Runs once per tick over the oldest batch of trace ids. A decision is made
//! in three steps:
//!
//! 1. Provisional decision. Reject rules run first, then the accept rules in
//!    order, each checking its own budget. The first rule that samples the
//!    trace wins.
//! 2. First pass. Sampled traces are admitted against the global budget.
//! 3. Second pass. Second chance traces fill whatever global budget is left.
//!
//! Every decided trace is recorded in the decision history and released from
//! the registry, sampled traces are handed to the consumer as one batch.
use crate::consumer::TraceConsumer;
use crate::decision_history::{DecisionHistory, DecisionHistoryInfo};
use crate::model::{ResourceSpans, Span};
use crate::rate_limiter::RateLimiter;
use crate::registry::TraceRegistry;
use crate::sampling::{Decision, DropTraceEvaluator, PolicyEvaluator, TraceData};
use crate::{
    ATTRIBUTE_SAMPLING_FILTER, ATTRIBUTE_SAMPLING_LATE_ARRIVAL, ATTRIBUTE_SAMPLING_PROBABILITY,
    ATTRIBUTE_SAMPLING_RULE,
};
use futures_executor::block_on;
use opentelemetry::trace::TraceId;
use opentelemetry::{otel_debug, otel_error, KeyValue, Value};
use std::time::{Instant, SystemTime};

const PROBABILISTIC_RULE_VALUE: &str = "probabilistic";
const FILTERED_RULE_VALUE: &str = "filtered";

/// Outcome of one tick of the cascading filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Number of trace ids in the evaluated batch.
    pub batch_len: usize,
    /// Traces handed to the consumer.
    pub sampled: usize,
    /// Traces discarded, including the dropped ones.
    pub not_sampled: usize,
    /// Trace ids no longer in memory when their batch came up, usually
    /// because the trace was evicted to make room for newer ones.
    pub dropped_too_early: usize,
}

#[derive(Debug)]
pub(crate) struct AcceptRule {
    pub(crate) name: String,
    pub(crate) evaluator: Box<dyn PolicyEvaluator>,
    pub(crate) probabilistic: bool,
}

#[derive(Debug)]
pub(crate) struct RejectRule {
    pub(crate) name: String,
    pub(crate) evaluator: Box<dyn DropTraceEvaluator>,
}

/// Everything the decision side mutates, owned by whoever runs the tick.
#[derive(Debug)]
pub(crate) struct DecisionRules {
    pub(crate) accept: Vec<AcceptRule>,
    pub(crate) reject: Vec<RejectRule>,
    pub(crate) global_limiter: RateLimiter,
}

pub(crate) struct Cascade<'a> {
    rules: &'a mut DecisionRules,
    registry: &'a TraceRegistry,
    history: &'a DecisionHistory,
    consumer: &'a dyn TraceConsumer,
    summary: TickSummary,
    total_spans: i64,
    probabilistic_spans: i64,
}

impl<'a> Cascade<'a> {
    pub(crate) fn new(
        rules: &'a mut DecisionRules,
        registry: &'a TraceRegistry,
        history: &'a DecisionHistory,
        consumer: &'a dyn TraceConsumer,
    ) -> Self {
        Cascade {
            rules,
            registry,
            history,
            consumer,
            summary: TickSummary::default(),
            total_spans: 0,
            probabilistic_spans: 0,
        }
    }

    pub(crate) fn decide_on_batch(mut self, batch: &[TraceId], current_second: u64) -> TickSummary {
        let start = Instant::now();
        self.summary.batch_len = batch.len();

        for id in batch {
            let trace = match self.registry.get(id) {
                Some(trace) => trace,
                None => {
                    self.summary.dropped_too_early += 1;
                    continue;
                }
            };
            trace.lock().decision_time = Some(SystemTime::now());

            // dropped traces do not count towards the probabilistic ratio
            let provisional = if self.should_be_dropped(*id, &trace) {
                Decision::Dropped
            } else {
                self.total_spans += trace.span_count();
                self.make_provisional_decision(*id, &trace, current_second)
            };

            self.first_pass(current_second, &trace, provisional);
        }

        for id in batch {
            let trace = match self.registry.get(id) {
                Some(trace) => trace,
                None => continue,
            };

            self.second_pass(current_second, &trace);

            let info = {
                let state = trace.lock();
                DecisionHistoryInfo {
                    final_decision: state.final_decision,
                    filter_name: state.provisional_decision_filter_name.clone(),
                    probabilistic_filter: state.selected_by_probabilistic_filter,
                }
            };
            self.history.add(*id, info);

            self.cleanup(&trace);
            self.registry.remove(id);
        }

        otel_debug!(
            name: "CascadingFilter.Cascade.Completed",
            batch_len = self.summary.batch_len,
            sampled = self.summary.sampled,
            not_sampled = self.summary.not_sampled,
            dropped_too_early = self.summary.dropped_too_early,
            duration_us = start.elapsed().as_micros() as u64
        );

        self.summary
    }

    fn should_be_dropped(&self, id: TraceId, trace: &TraceData) -> bool {
        match self
            .rules
            .reject
            .iter()
            .find(|rule| rule.evaluator.should_drop(id, trace))
        {
            Some(rule) => {
                otel_debug!(
                    name: "CascadingFilter.Cascade.TraceRejected",
                    rule = rule.name.as_str(),
                    trace_id = format!("{}", id)
                );
                true
            }
            None => false,
        }
    }

    fn make_provisional_decision(
        &mut self,
        id: TraceId,
        trace: &TraceData,
        current_second: u64,
    ) -> Decision {
        if self.rules.accept.is_empty() {
            return Decision::Sampled;
        }

        let mut provisional = Decision::Unspecified;
        for (i, rule) in self.rules.accept.iter_mut().enumerate() {
            let decision = rule.evaluator.evaluate(id, trace, current_second);

            let mut state = trace.lock();
            if let Some(slot) = state.decisions.get_mut(i) {
                *slot = decision;
            }

            match decision {
                Decision::Sampled => {
                    if rule.probabilistic {
                        state.selected_by_probabilistic_filter = true;
                    } else {
                        state.provisional_decision_filter_name = Some(rule.name.clone());
                    }
                    return Decision::Sampled;
                }
                Decision::NotSampled => {
                    if provisional == Decision::Unspecified {
                        provisional = Decision::NotSampled;
                    }
                }
                Decision::SecondChance => {
                    provisional = Decision::SecondChance;
                    state.provisional_decision_filter_name = Some(rule.name.clone());
                }
                _ => {}
            }
        }

        provisional
    }

    fn first_pass(&mut self, current_second: u64, trace: &TraceData, provisional: Decision) {
        let mut state = trace.lock();
        state.final_decision = match provisional {
            Decision::Sampled => {
                let span_count = trace.span_count();
                let decision = self
                    .rules
                    .global_limiter
                    .update_rate(current_second, span_count);
                if decision == Decision::Sampled && state.selected_by_probabilistic_filter {
                    self.probabilistic_spans += span_count;
                }
                decision
            }
            other => other,
        };
    }

    fn second_pass(&mut self, current_second: u64, trace: &TraceData) {
        let mut state = trace.lock();
        if state.final_decision == Decision::SecondChance {
            state.final_decision = self
                .rules
                .global_limiter
                .update_rate(current_second, trace.span_count());
        }
    }

    fn cleanup(&mut self, trace: &TraceData) {
        let (final_decision, batches, probabilistic, filter_name) = {
            let mut state = trace.lock();
            (
                state.final_decision,
                std::mem::take(&mut state.received_batches),
                state.selected_by_probabilistic_filter,
                state.provisional_decision_filter_name.clone(),
            )
        };

        if final_decision != Decision::Sampled {
            self.summary.not_sampled += 1;
            return;
        }
        self.summary.sampled += 1;

        let mut all_spans: Vec<ResourceSpans> = batches.into_iter().flatten().collect();
        if probabilistic {
            update_probabilistic_rate_tag(
                &mut all_spans,
                self.probabilistic_spans,
                self.total_spans,
            );
        } else if !self.rules.accept.is_empty() {
            update_filtering_tag(&mut all_spans, filter_name.as_deref());
        }

        if let Err(err) = block_on(self.consumer.consume(all_spans)) {
            otel_error!(
                name: "CascadingFilter.Cascade.ConsumeFailed",
                error = format!("{}", err)
            );
        }
    }
}

fn spans_mut(batch: &mut [ResourceSpans]) -> impl Iterator<Item = &mut Span> + '_ {
    batch.iter_mut().flat_map(|rs| rs.spans.iter_mut())
}

/// Tags spans selected by the probabilistic filter with the share of the
/// tick's spans it selected, scaling any probability set upstream.
pub(crate) fn update_probabilistic_rate_tag(
    batch: &mut [ResourceSpans],
    probabilistic_spans: i64,
    total_spans: i64,
) {
    let ratio = probabilistic_spans as f64 / total_spans as f64;
    for span in spans_mut(batch) {
        let probability = match span.attribute(ATTRIBUTE_SAMPLING_PROBABILITY) {
            Some(Value::F64(existing)) if !existing.is_nan() && *existing > 0.0 => {
                existing * ratio
            }
            _ => ratio,
        };
        span.set_attribute(KeyValue::new(ATTRIBUTE_SAMPLING_PROBABILITY, probability));
        span.set_attribute(KeyValue::new(
            ATTRIBUTE_SAMPLING_RULE,
            PROBABILISTIC_RULE_VALUE,
        ));
    }
}

pub(crate) fn update_filtering_tag(batch: &mut [ResourceSpans], filter_name: Option<&str>) {
    let filter_name = filter_name.filter(|name| !name.is_empty());
    for span in spans_mut(batch) {
        span.set_attribute(KeyValue::new(ATTRIBUTE_SAMPLING_RULE, FILTERED_RULE_VALUE));
        if let Some(name) = filter_name {
            span.set_attribute(KeyValue::new(ATTRIBUTE_SAMPLING_FILTER, name.to_string()));
        }
    }
}

pub(crate) fn update_late_arrival_tag(
    batch: &mut [ResourceSpans],
    filter_name: Option<&str>,
    probabilistic: bool,
) {
    let filter_name = match filter_name.filter(|name| !name.is_empty()) {
        Some(name) => Some(name),
        None if probabilistic => Some(PROBABILISTIC_RULE_VALUE),
        None => None,
    };
    for span in spans_mut(batch) {
        span.set_attribute(KeyValue::new(ATTRIBUTE_SAMPLING_LATE_ARRIVAL, true));
        if let Some(name) = filter_name {
            span.set_attribute(KeyValue::new(ATTRIBUTE_SAMPLING_FILTER, name.to_string()));
        }
    }
}
