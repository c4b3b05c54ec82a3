//! # OpenTelemetry Cascading Filter
//!
//! A tail-based sampling processor for trace pipelines. Spans are buffered
//! per trace until a configurable decision wait elapses, after which the
//! whole trace is evaluated against a cascade of rules and throughput
//! budgets and either forwarded to the next [`TraceConsumer`] or discarded.
//!
//! The cascade for each trace runs in this order:
//!
//! 1. **Reject rules** ([`TraceRejectConfig`]). A trace matching every
//!    configured predicate of any reject rule is dropped before anything
//!    else looks at it.
//! 2. **Accept rules** ([`TraceAcceptConfig`]), evaluated in configured
//!    order, preceded by the optional probabilistic filter. The first rule
//!    that samples the trace wins. Rules with an unlimited budget only give
//!    the trace a *second chance*.
//! 3. **Global budget**. Sampled traces are admitted against the global
//!    spans-per-second budget; second-chance traces fill whatever capacity
//!    is left over.
//!
//! Spans arriving after their trace was decided are routed through a bounded
//! decision history: spans of sampled traces are forwarded right away (under
//! a separate budget), everything else is discarded.
//!
//! ```ascii
//!                 +----------------+   first seen   +---------------+
//!   spans ------->| group by trace |--------------->| TraceRegistry |
//!                 +----------------+                +-------+-------+
//!                         | already decided                 | every tick
//!                         v                                 v
//!                 +-----------------+               +---------------+
//!                 | DecisionHistory |<--------------|    Cascade    |
//!                 +--------+--------+   decisions   +-------+-------+
//!                          | late sampled spans             | admitted traces
//!                          v                                v
//!                 +------------------------------------------------+
//!                 |                 TraceConsumer                  |
//!                 +------------------------------------------------+
//! ```
//!
//! # Example
//!
//! ```
//! use opentelemetry_cascading_filter::{
//!     CascadingFilterConfig, CascadingFilterProcessor, InMemoryTraceConsumer, TraceAcceptConfig,
//! };
//! use std::time::Duration;
//!
//! let consumer = InMemoryTraceConsumer::default();
//! let config = CascadingFilterConfig::builder()
//!     .with_decision_wait(Duration::from_secs(5))
//!     .with_spans_per_second(1000)
//!     .with_trace_accept_filter(TraceAcceptConfig {
//!         name: "everything".to_string(),
//!         spans_per_second: -1,
//!         ..Default::default()
//!     })
//!     .build();
//!
//! let processor = CascadingFilterProcessor::builder(consumer.clone())
//!     .with_config(config)
//!     .build()
//!     .unwrap();
//! # processor.shutdown().unwrap();
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod cascade;
pub mod config;
pub mod consumer;
mod decision_history;
pub mod error;
mod id_batcher;
pub mod model;
mod processor;
mod rate_limiter;
mod registry;
pub mod sampling;

pub use cascade::TickSummary;
pub use config::{
    AttributeConfig, AttributeRange, CascadingFilterConfig, CascadingFilterConfigBuilder,
    NumericAttributeConfig, PropertiesConfig, StringAttributeConfig, TraceAcceptConfig,
    TraceRejectConfig,
};
pub use consumer::{InMemoryTraceConsumer, TraceConsumer};
pub use error::{CascadingFilterError, CascadingFilterResult, ConsumeError, ConsumeResult};
pub use model::{ResourceSpans, Span};
pub use processor::{CascadingFilterProcessor, CascadingFilterProcessorBuilder};

/// Span attribute holding the kind of rule that selected the trace,
/// `"probabilistic"` or `"filtered"`.
pub const ATTRIBUTE_SAMPLING_RULE: &str = "sampling.rule";
/// Span attribute holding the name of the accept rule that selected the trace.
pub const ATTRIBUTE_SAMPLING_FILTER: &str = "sampling.filter";
/// Span attribute set to `true` on spans forwarded after their trace was decided.
pub const ATTRIBUTE_SAMPLING_LATE_ARRIVAL: &str = "sampling.late_arrival";
/// Span attribute holding the estimated selection probability of
/// probabilistically sampled traces.
pub const ATTRIBUTE_SAMPLING_PROBABILITY: &str = "sampling.probability";
