use super::{Decision, PolicyEvaluator, TraceData};
use crate::rate_limiter::RateLimiter;
use opentelemetry::trace::TraceId;

/// Name the probabilistic filter is registered under among the accept rules.
pub(crate) const PROBABILISTIC_FILTER_NAME: &str = "probabilistic_filter";

/// Accept rule that selects traces regardless of their content, up to a
/// dedicated budget.
///
/// It always runs first so that its share of the global budget is a
/// representative sample of the traffic.
#[derive(Debug)]
pub struct ProbabilisticFilter {
    limiter: RateLimiter,
}

impl ProbabilisticFilter {
    /// Creates a filter admitting up to `spans_per_second` spans each second.
    pub fn new(spans_per_second: i64) -> Self {
        ProbabilisticFilter {
            limiter: RateLimiter::new(spans_per_second),
        }
    }
}

impl PolicyEvaluator for ProbabilisticFilter {
    fn evaluate(&mut self, _trace_id: TraceId, trace: &TraceData, current_second: u64) -> Decision {
        self.limiter.update_rate(current_second, trace.span_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceSpans;
    use crate::sampling::tests::{span_with_attributes, test_trace_id};

    #[test]
    fn selects_until_budget_exhausted() {
        let mut filter = ProbabilisticFilter::new(5);
        let trace = TraceData::new(
            vec![ResourceSpans::new(vec![], vec![span_with_attributes(vec![]); 2])],
            1,
        );

        let decisions: Vec<_> = (0..3)
            .map(|_| filter.evaluate(test_trace_id(), &trace, 42))
            .collect();
        assert_eq!(
            decisions,
            vec![Decision::Sampled, Decision::Sampled, Decision::NotSampled]
        );
        assert_eq!(filter.evaluate(test_trace_id(), &trace, 43), Decision::Sampled);
    }
}
