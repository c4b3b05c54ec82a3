//! # Cascading Filter Processor
//!
//! The [`CascadingFilterProcessor`] is the entry point of the crate. Spans
//! handed to [`CascadingFilterProcessor::consume_traces`] are regrouped per
//! trace and either:
//!
//! * forwarded right away, when their trace was already sampled,
//! * discarded, when their trace was already rejected,
//! * or buffered until the decision wait of their trace elapses.
//!
//! A dedicated background thread ticks once per second and runs the cascade
//! of rules over the traces whose decision wait elapsed.
//! The thread is only started when the first spans arrive.
//!
//! When neither accept nor reject rules are configured, spans are passed to
//! the consumer unchanged and nothing is buffered.
//!
//! ## Example
//!
//! ```
//! use opentelemetry_cascading_filter::{
//!     CascadingFilterConfig, CascadingFilterProcessor, InMemoryTraceConsumer, TraceRejectConfig,
//! };
//! use std::time::Duration;
//!
//! let consumer = InMemoryTraceConsumer::default();
//! let processor = CascadingFilterProcessor::builder(consumer.clone())
//!     .with_config(
//!         CascadingFilterConfig::builder()
//!             .with_decision_wait(Duration::from_secs(2))
//!             .with_trace_reject_filter(TraceRejectConfig {
//!                 name: "healthchecks".to_string(),
//!                 name_pattern: Some("health.*".to_string()),
//!                 ..Default::default()
//!             })
//!             .build(),
//!     )
//!     .with_manual_ticks()
//!     .build()
//!     .unwrap();
//!
//! // nothing was received, nothing to decide
//! assert_eq!(processor.tick().batch_len, 0);
//! processor.shutdown().unwrap();
//! ```
use crate::cascade::{
    update_late_arrival_tag, AcceptRule, Cascade, DecisionRules, RejectRule, TickSummary,
};
use crate::config::CascadingFilterConfig;
use crate::consumer::TraceConsumer;
use crate::decision_history::{DecisionHistory, DecisionHistoryInfo};
use crate::error::{CascadingFilterError, CascadingFilterResult};
use crate::id_batcher::{Batcher, IdBatcher};
use crate::model::{ResourceSpans, Span};
use crate::rate_limiter::{current_second, RateLimiter};
use crate::registry::TraceRegistry;
use crate::sampling::{
    Decision, DropTraceEvaluator, DropTraceFilter, PolicyEvaluator, PolicyFilter,
    ProbabilisticFilter, TraceData, PROBABILISTIC_FILTER_NAME,
};
use futures_executor::block_on;
use opentelemetry::trace::TraceId;
use opentelemetry::{otel_debug, otel_error, otel_info, otel_warn, KeyValue};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// State shared by ingestion threads and the ticker thread.
struct FilterCore {
    consumer: Box<dyn TraceConsumer>,
    registry: TraceRegistry,
    batcher: IdBatcher,
    history: DecisionHistory,
    rules: Mutex<DecisionRules>,
    prior_limiter: Mutex<RateLimiter>,
    num_accept_rules: usize,
}

impl fmt::Debug for FilterCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCore")
            .field("consumer", &self.consumer)
            .field("traces_in_memory", &self.registry.len())
            .field("num_accept_rules", &self.num_accept_rules)
            .finish()
    }
}

impl FilterCore {
    fn tick(&self) -> TickSummary {
        let (batch, _) = self.batcher.close_current_and_take_first_batch();
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        Cascade::new(&mut rules, &self.registry, &self.history, &*self.consumer)
            .decide_on_batch(&batch, current_second())
    }

    fn process_traces(&self, resource_spans: ResourceSpans) {
        let ResourceSpans { resource, spans } = resource_spans;
        let current_second = current_second();

        for (id, spans) in group_spans_by_trace_id(spans) {
            if let Some(info) = self.history.get(&id) {
                let decision = if info.final_decision == Decision::Sampled {
                    // late spans count against their own budget
                    self.prior_limiter
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .update_rate(current_second, spans.len() as i64)
                } else {
                    info.final_decision
                };

                match decision {
                    Decision::Sampled => {
                        self.forward_late_arrival(resource.clone(), spans, &info);
                        continue;
                    }
                    Decision::NotSampled | Decision::Dropped => continue,
                    _ => {
                        otel_warn!(
                            name: "CascadingFilter.LateArrival.UnexpectedDecision",
                            decision = format!("{:?}", info.final_decision)
                        );
                    }
                }
            }

            self.buffer_trace(id, ResourceSpans::new(resource.clone(), spans));
        }
    }

    fn forward_late_arrival(
        &self,
        resource: Vec<KeyValue>,
        spans: Vec<Span>,
        info: &DecisionHistoryInfo,
    ) {
        let mut batch = vec![ResourceSpans::new(resource, spans)];
        update_late_arrival_tag(&mut batch, info.filter_name.as_deref(), info.probabilistic_filter);
        if let Err(err) = block_on(self.consumer.consume(batch)) {
            otel_warn!(
                name: "CascadingFilter.LateArrival.ConsumeFailed",
                error = format!("{}", err)
            );
        }
    }

    fn buffer_trace(&self, id: TraceId, batch: ResourceSpans) {
        let span_count = batch.spans.len() as i64;
        let mut batch = Some(batch);
        let (trace, loaded) = self.registry.load_or_store(id, || {
            TraceData::new(batch.take().into_iter().collect(), self.num_accept_rules)
        });

        if !loaded {
            self.batcher.add_to_current_batch(id);
            self.registry.enqueue_for_eviction(id);
            return;
        }

        // counted and appended under the trace lock so a decision cannot slip in between
        let mut state = trace.lock();
        if matches!(
            state.final_decision,
            Decision::Pending | Decision::Unspecified
        ) {
            if let Some(batch) = batch {
                trace.add_span_count(span_count);
                state.received_batches.push(vec![batch]);
            }
        }
    }
}

// first seen order is kept so traces of one call are decided in arrival order
fn group_spans_by_trace_id(spans: Vec<Span>) -> Vec<(TraceId, Vec<Span>)> {
    let mut index: HashMap<TraceId, usize> = HashMap::new();
    let mut groups: Vec<(TraceId, Vec<Span>)> = Vec::new();

    for span in spans {
        if span.trace_id == TraceId::INVALID {
            otel_warn!(
                name: "CascadingFilter.InvalidTraceId",
                message = "Span without valid TraceId"
            );
        }
        match index.entry(span.trace_id) {
            Entry::Occupied(entry) => groups[*entry.get()].1.push(span),
            Entry::Vacant(entry) => {
                entry.insert(groups.len());
                groups.push((span.trace_id, vec![span]));
            }
        }
    }

    groups
}

#[derive(Debug)]
struct TickerHandle {
    stop_sender: SyncSender<()>,
    handle: thread::JoinHandle<()>,
}

/// A tail-based sampling processor.
///
/// Built with [`CascadingFilterProcessor::builder`]. Shutting the processor
/// down, explicitly or by dropping it, stops the ticker thread and shuts the
/// consumer down. Traces still buffered at that point are not evaluated.
#[derive(Debug)]
pub struct CascadingFilterProcessor {
    core: Arc<FilterCore>,
    filtering_enabled: bool,
    tick_interval: Option<Duration>,
    ticker_started: AtomicBool,
    ticker: Mutex<Option<TickerHandle>>,
    is_shutdown: AtomicBool,
}

impl CascadingFilterProcessor {
    /// Returns a builder forwarding sampled traces to `consumer`.
    pub fn builder<C>(consumer: C) -> CascadingFilterProcessorBuilder<C>
    where
        C: TraceConsumer + 'static,
    {
        CascadingFilterProcessorBuilder {
            consumer,
            config: CascadingFilterConfig::default(),
            tick_interval: Some(TICK_INTERVAL),
            accept_evaluators: Vec::new(),
            reject_evaluators: Vec::new(),
        }
    }

    /// Hands a batch of spans to the filter.
    ///
    /// Without any rule configured the batch goes straight to the consumer
    /// and its result is returned. Otherwise spans are buffered or routed as
    /// late arrivals, and consumer failures are only logged.
    ///
    /// # Errors
    ///
    /// Returns [`CascadingFilterError::AlreadyShutdown`] once the processor
    /// is shut down.
    pub fn consume_traces(&self, batch: Vec<ResourceSpans>) -> CascadingFilterResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(CascadingFilterError::AlreadyShutdown);
        }

        if !self.filtering_enabled {
            return block_on(self.core.consumer.consume(batch)).map_err(Into::into);
        }

        self.start_ticker_once();
        for resource_spans in batch {
            self.core.process_traces(resource_spans);
        }
        Ok(())
    }

    /// Runs the cascade over the oldest batch of buffered traces.
    ///
    /// Called every second by the ticker thread. Processors built with
    /// [`CascadingFilterProcessorBuilder::with_manual_ticks`] rely on the
    /// caller instead.
    pub fn tick(&self) -> TickSummary {
        self.core.tick()
    }

    /// Number of traces waiting for a decision.
    pub fn traces_in_memory(&self) -> u64 {
        self.core.registry.len()
    }

    fn start_ticker_once(&self) {
        let interval = match self.tick_interval {
            Some(interval) => interval,
            None => return,
        };
        if self.ticker_started.load(Ordering::Acquire) {
            return;
        }

        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.ticker_started.load(Ordering::Acquire) || self.is_shutdown.load(Ordering::Relaxed)
        {
            return;
        }
        self.ticker_started.store(true, Ordering::Release);

        otel_info!(
            name: "CascadingFilter.Ticker.Started",
            message = "First trace data arrived, starting cascading_filter timers"
        );

        let (stop_sender, stop_receiver) = sync_channel::<()>(1);
        let core = self.core.clone();
        let spawned = thread::Builder::new()
            .name("CascadingFilterTicker".to_string())
            .spawn(move || {
                let mut last_tick = Instant::now();
                loop {
                    let timeout = interval.saturating_sub(last_tick.elapsed());
                    match stop_receiver.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            last_tick = Instant::now();
                            core.tick();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                otel_debug!(name: "CascadingFilter.Ticker.Stopped");
            });

        match spawned {
            Ok(handle) => {
                *ticker = Some(TickerHandle {
                    stop_sender,
                    handle,
                });
            }
            Err(err) => {
                otel_error!(
                    name: "CascadingFilter.Ticker.SpawnFailed",
                    error = format!("{}", err)
                );
            }
        }
    }

    /// Stops the ticker thread and the batcher, then shuts the consumer down.
    ///
    /// # Errors
    ///
    /// Returns [`CascadingFilterError::AlreadyShutdown`] when called more
    /// than once, or the error reported by the consumer.
    pub fn shutdown(&self) -> CascadingFilterResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(CascadingFilterError::AlreadyShutdown);
        }

        let mut result: CascadingFilterResult<()> = Ok(());
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(TickerHandle {
            stop_sender,
            handle,
        }) = ticker
        {
            // the thread also stops once the sender is gone
            let _ = stop_sender.try_send(());
            drop(stop_sender);
            if handle.join().is_err() {
                otel_error!(name: "CascadingFilter.Ticker.Panicked");
                result = Err("cascading filter ticker thread panicked".into());
            }
        }

        self.core.batcher.stop();

        let consumer_result = self.core.consumer.shutdown();
        result.and(consumer_result.map_err(Into::into))
    }
}

impl Drop for CascadingFilterProcessor {
    fn drop(&mut self) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = self.shutdown() {
            otel_debug!(
                name: "CascadingFilter.Drop.ShutdownFailed",
                error = format!("{}", err)
            );
        }
    }
}

/// Builder for [`CascadingFilterProcessor`].
#[derive(Debug)]
pub struct CascadingFilterProcessorBuilder<C> {
    consumer: C,
    config: CascadingFilterConfig,
    tick_interval: Option<Duration>,
    accept_evaluators: Vec<(String, Box<dyn PolicyEvaluator>)>,
    reject_evaluators: Vec<(String, Box<dyn DropTraceEvaluator>)>,
}

impl<C> CascadingFilterProcessorBuilder<C>
where
    C: TraceConsumer + 'static,
{
    /// Sets the [`CascadingFilterConfig`] of the processor.
    pub fn with_config(self, config: CascadingFilterConfig) -> Self {
        CascadingFilterProcessorBuilder { config, ..self }
    }

    /// Disables the ticker thread. Decisions are only made when
    /// [`CascadingFilterProcessor::tick`] is called.
    pub fn with_manual_ticks(self) -> Self {
        CascadingFilterProcessorBuilder {
            tick_interval: None,
            ..self
        }
    }

    /// Adds a custom accept rule, evaluated after the configured ones.
    pub fn with_accept_evaluator<E>(mut self, name: impl Into<String>, evaluator: E) -> Self
    where
        E: PolicyEvaluator + 'static,
    {
        self.accept_evaluators.push((name.into(), Box::new(evaluator)));
        self
    }

    /// Adds a custom reject rule, evaluated after the configured ones.
    pub fn with_reject_evaluator<E>(mut self, name: impl Into<String>, evaluator: E) -> Self
    where
        E: DropTraceEvaluator + 'static,
    {
        self.reject_evaluators.push((name.into(), Box::new(evaluator)));
        self
    }

    /// Builds the processor.
    ///
    /// # Errors
    ///
    /// Fails when a rule holds an invalid pattern or status code, or when
    /// the decision wait, `num_traces` or the history size leave no room.
    pub fn build(self) -> CascadingFilterResult<CascadingFilterProcessor> {
        let derived = self.config.derive();

        let mut reject = Vec::new();
        for rule in &self.config.trace_reject_filters {
            let evaluator = DropTraceFilter::new(rule)?;
            otel_info!(
                name: "CascadingFilter.RejectRule.Added",
                rule = rule.name.as_str()
            );
            reject.push(RejectRule {
                name: rule.name.clone(),
                evaluator: Box::new(evaluator),
            });
        }
        for (name, evaluator) in self.reject_evaluators {
            otel_info!(name: "CascadingFilter.RejectRule.Added", rule = name.as_str());
            reject.push(RejectRule { name, evaluator });
        }

        // the probabilistic filter must select traces ahead of every other rule
        let mut accept = Vec::new();
        if let Some(rate) = derived.probabilistic_filtering_rate {
            accept.push(AcceptRule {
                name: PROBABILISTIC_FILTER_NAME.to_string(),
                evaluator: Box::new(ProbabilisticFilter::new(rate)),
                probabilistic: true,
            });
        }
        for rule in &derived.accept_rules {
            let evaluator = PolicyFilter::new(rule)?;
            otel_info!(
                name: "CascadingFilter.AcceptRule.Added",
                rule = rule.name.as_str(),
                spans_per_second = rule.spans_per_second
            );
            accept.push(AcceptRule {
                name: rule.name.clone(),
                evaluator: Box::new(evaluator),
                probabilistic: false,
            });
        }
        for (name, evaluator) in self.accept_evaluators {
            otel_info!(name: "CascadingFilter.AcceptRule.Added", rule = name.as_str());
            accept.push(AcceptRule {
                name,
                evaluator,
                probabilistic: false,
            });
        }

        let filtering_enabled = !accept.is_empty() || !reject.is_empty();
        if !filtering_enabled {
            otel_info!(
                name: "CascadingFilter.FilteringDisabled",
                message = "No rules set for cascading_filter processor. Processor will output all incoming spans without filtering."
            );
        }

        let core = FilterCore {
            registry: TraceRegistry::new(self.config.num_traces)?,
            batcher: IdBatcher::new(derived.num_batches, self.config.expected_new_traces_per_sec)?,
            history: DecisionHistory::new(derived.history_size)?,
            prior_limiter: Mutex::new(RateLimiter::new(derived.prior_spans_rate)),
            num_accept_rules: accept.len(),
            rules: Mutex::new(DecisionRules {
                accept,
                reject,
                global_limiter: RateLimiter::new(derived.global_spans_per_second),
            }),
            consumer: Box::new(self.consumer),
        };

        Ok(CascadingFilterProcessor {
            core: Arc::new(core),
            filtering_enabled,
            tick_interval: self.tick_interval,
            ticker_started: AtomicBool::new(false),
            ticker: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        })
    }
}
