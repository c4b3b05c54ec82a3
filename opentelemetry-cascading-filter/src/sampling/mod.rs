//! Per-trace sampling state and the rules evaluated against it.
//!
//! Rules come in two flavours. A [`DropTraceEvaluator`] (reject rule) discards
//! a trace before anything else looks at it. A [`PolicyEvaluator`] (accept
//! rule) proposes a [`Decision`] for the trace, taking its own throughput
//! budget into account.
use crate::model::{self, ResourceSpans};
use opentelemetry::trace::TraceId;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

mod attribute_filter;
mod drop_trace;
mod policy;
mod probabilistic;

pub use drop_trace::DropTraceFilter;
pub use policy::PolicyFilter;
pub use probabilistic::ProbabilisticFilter;

pub(crate) use probabilistic::PROBABILISTIC_FILTER_NAME;

/// The status of a sampling decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The decision was not made yet.
    #[default]
    Unspecified,
    /// The rule was not evaluated yet.
    Pending,
    /// The trace is sampled.
    Sampled,
    /// The trace matched a rule without a budget of its own. It is sampled
    /// only if the global budget has capacity left once every other trace of
    /// the tick was admitted.
    SecondChance,
    /// The trace is not sampled.
    NotSampled,
    /// The trace was discarded by a reject rule.
    Dropped,
}

/// Sampling state of one trace, from its first span until the decision.
#[derive(Debug)]
pub struct TraceData {
    span_count: AtomicI64,
    arrival_time: SystemTime,
    state: Mutex<TraceState>,
}

/// The part of [`TraceData`] guarded by the per-trace lock.
#[derive(Debug, Default)]
pub struct TraceState {
    /// Decision of every accept rule, index aligned with the rules.
    pub decisions: Vec<Decision>,
    /// The ultimate fate of the trace.
    pub final_decision: Decision,
    /// Whether the probabilistic filter selected the trace.
    pub selected_by_probabilistic_filter: bool,
    /// Name of the accept rule that selected the trace.
    pub provisional_decision_filter_name: Option<String>,
    /// When the decision was taken.
    pub decision_time: Option<SystemTime>,
    /// Every batch of spans received for the trace, in arrival order.
    pub received_batches: Vec<Vec<ResourceSpans>>,
}

impl TraceData {
    /// Creates the state of a trace from its first batch of spans, with
    /// every one of `num_accept_rules` rule decisions pending.
    pub fn new(batch: Vec<ResourceSpans>, num_accept_rules: usize) -> Self {
        let span_count = model::span_count(&batch) as i64;
        TraceData {
            span_count: AtomicI64::new(span_count),
            arrival_time: SystemTime::now(),
            state: Mutex::new(TraceState {
                decisions: vec![Decision::Pending; num_accept_rules],
                received_batches: vec![batch],
                ..Default::default()
            }),
        }
    }

    /// Number of spans received for the trace so far.
    pub fn span_count(&self) -> i64 {
        self.span_count.load(Ordering::Relaxed)
    }

    pub(crate) fn add_span_count(&self, span_count: i64) {
        self.span_count.fetch_add(span_count, Ordering::Relaxed);
    }

    /// When the first span of the trace arrived.
    pub fn arrival_time(&self) -> SystemTime {
        self.arrival_time
    }

    /// Locks the decision state and received batches of the trace.
    pub fn lock(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An accept rule, evaluated in configured order for every trace that was
/// not rejected.
///
/// Evaluators are only ever called from the decision thread, one trace at a
/// time, so they may keep mutable budget state.
pub trait PolicyEvaluator: Send + Debug {
    /// Looks at the trace and returns the corresponding decision, taking the
    /// budget of the rule for `current_second` into account.
    ///
    /// The implementation locks the trace state through [`TraceData::lock`]
    /// and must release it before returning.
    fn evaluate(&mut self, trace_id: TraceId, trace: &TraceData, current_second: u64) -> Decision;
}

/// A reject rule. A trace is dropped as soon as one reject rule asks for it.
pub trait DropTraceEvaluator: Send + Sync + Debug {
    /// Returns `true` if the trace must be dropped.
    fn should_drop(&self, trace_id: TraceId, trace: &TraceData) -> bool;
}
