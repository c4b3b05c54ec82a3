//! Downstream consumers of sampled traces.
use crate::error::{ConsumeError, ConsumeResult};
use crate::model::{self, ResourceSpans};
use futures_util::future::BoxFuture;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// `TraceConsumer` is the next stage of the pipeline. The cascading filter
/// hands every admitted trace to it as one batch, and forwards late spans of
/// sampled traces through it as they arrive.
pub trait TraceConsumer: Send + Sync + Debug {
    /// Consumes a batch of spans.
    ///
    /// This function may be called concurrently: the decision thread emits
    /// admitted traces while ingestion threads forward late arrivals or, when
    /// no rules are configured, pass spans through unchanged.
    ///
    /// Failures are logged by the caller and never retried.
    fn consume(&self, batch: Vec<ResourceSpans>) -> BoxFuture<'static, ConsumeResult>;

    /// Shuts down the consumer. Called once when the cascading filter shuts down.
    fn shutdown(&self) -> ConsumeResult {
        Ok(())
    }
}

impl<T: TraceConsumer + ?Sized> TraceConsumer for Arc<T> {
    fn consume(&self, batch: Vec<ResourceSpans>) -> BoxFuture<'static, ConsumeResult> {
        (**self).consume(batch)
    }

    fn shutdown(&self) -> ConsumeResult {
        (**self).shutdown()
    }
}

/// A trace consumer that keeps every batch it receives in memory.
///
/// This consumer is useful for testing and debugging purposes. Each call to
/// [`TraceConsumer::consume`] is stored as a separate batch, so the grouping
/// the cascading filter produced can be inspected.
///
/// # Example
///
/// ```
/// use opentelemetry_cascading_filter::{InMemoryTraceConsumer, TraceConsumer};
///
/// let consumer = InMemoryTraceConsumer::default();
/// futures_executor::block_on(consumer.consume(Vec::new())).unwrap();
/// assert_eq!(consumer.get_batches().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryTraceConsumer {
    batches: Arc<Mutex<Vec<Vec<ResourceSpans>>>>,
}

impl InMemoryTraceConsumer {
    /// Returns every batch consumed so far, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns a `ConsumeError` if the internal lock cannot be acquired.
    pub fn get_batches(&self) -> Result<Vec<Vec<ResourceSpans>>, ConsumeError> {
        self.batches
            .lock()
            .map(|batches| batches.clone())
            .map_err(ConsumeError::from)
    }

    /// Returns the total number of spans consumed so far.
    pub fn span_count(&self) -> usize {
        self.batches
            .lock()
            .map(|batches| batches.iter().map(|b| model::span_count(b)).sum())
            .unwrap_or_default()
    }

    /// Clears the internal storage of consumed batches.
    pub fn reset(&self) {
        let _ = self.batches.lock().map(|mut batches| batches.clear());
    }
}

impl TraceConsumer for InMemoryTraceConsumer {
    fn consume(&self, batch: Vec<ResourceSpans>) -> BoxFuture<'static, ConsumeResult> {
        let result = self
            .batches
            .lock()
            .map(|mut batches| batches.push(batch))
            .map_err(ConsumeError::from);
        Box::pin(std::future::ready(result))
    }
}
