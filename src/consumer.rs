// ===============================
// src/consumer.rs
// ===============================
//
// Generic delivery pipeline, one instance per (provider, queue) binding:
//   decode -> to_ticks -> create each tick -> classify -> settle
//
// One worker task per binding; inside a worker deliveries are handled strictly
// one at a time, in broker order. The store pool is the only shared state.
//
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::DeliverySource;
use crate::decoder::Decoder;
use crate::domain::{Delivery, DeliveryOutcome, Tick};
use crate::metrics::{
    DECODE_ERRORS, DELIVERIES, PERSIST_ERRORS, PERSIST_LATENCY, TICKS_BY_SYMBOL,
};
use crate::policy::{classify, PersistError, Processing};
use crate::store::TickStore;

pub struct ConsumerBinding<D: Decoder> {
    queue: String,
    decoder: D,
    store: Arc<dyn TickStore>,
}

impl<D: Decoder> ConsumerBinding<D> {
    pub fn new(queue: impl Into<String>, decoder: D, store: Arc<dyn TickStore>) -> Self {
        Self { queue: queue.into(), decoder, store }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Everything up to (not including) the delivery decision.
    pub async fn process(&self, body: &[u8]) -> Processing {
        let msg = match self.decoder.decode(body) {
            Ok(m) => m,
            Err(e) => return Processing::DecodeFailed(e),
        };
        debug!(queue = %self.queue, ?msg, "decoded message");

        let candidates = self.decoder.to_ticks(&msg);
        if candidates.is_empty() {
            return Processing::NoCandidates;
        }

        let started = Instant::now();
        let result = persist_all(self.store.as_ref(), candidates).await;
        PERSIST_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(created) => Processing::Persisted(created),
            Err(e) => Processing::PersistFailed(e),
        }
    }

    pub async fn handle(&self, delivery: &Delivery) -> DeliveryOutcome {
        let processing = self.process(&delivery.body).await;
        let outcome = classify(&processing, delivery.redelivered);
        let provider = self.decoder.provider();

        match &processing {
            Processing::DecodeFailed(e) => {
                DECODE_ERRORS.with_label_values(&[provider.as_str()]).inc();
                debug!(
                    queue = %self.queue,
                    %provider,
                    tag = delivery.tag,
                    redelivered = delivery.redelivered,
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "failed to parse message, requeue"
                );
            }
            Processing::NoCandidates => {
                debug!(queue = %self.queue, tag = delivery.tag, "no-op message, ack");
            }
            Processing::Persisted(n) => {
                debug!(queue = %self.queue, tag = delivery.tag, ticks = n, "persisted message");
            }
            Processing::PersistFailed(e) => {
                PERSIST_ERRORS.with_label_values(&[&self.queue]).inc();
                error!(
                    queue = %self.queue,
                    %provider,
                    tag = delivery.tag,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "failed to persist message"
                );
                if outcome == DeliveryOutcome::DropAndLog {
                    error!(
                        queue = %self.queue,
                        tag = delivery.tag,
                        error = %e,
                        "message already failed redelivery attempt, dropping"
                    );
                }
            }
        }

        DELIVERIES.with_label_values(&[&self.queue, outcome.as_str()]).inc();
        outcome
    }
}

/// Create every candidate; anything short of all of them is one aggregate error.
pub async fn persist_all(store: &dyn TickStore, ticks: Vec<Tick>) -> Result<usize, PersistError> {
    let expected = ticks.len();
    let mut created = 0;
    let mut first_error = None;

    for mut tick in ticks {
        match tick.create(store).await {
            Ok(true) => {
                created += 1;
                TICKS_BY_SYMBOL.with_label_values(&[&tick.symbol]).inc();
            }
            Ok(false) => {
                warn!(symbol = %tick.symbol, "tick create affected no rows");
            }
            Err(e) => {
                debug!(symbol = %tick.symbol, error = %e, "tick create failed");
                first_error.get_or_insert(e);
            }
        }
    }

    if created == expected {
        Ok(created)
    } else {
        Err(PersistError { expected, created, first_error })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub acknowledged: u64,
    pub requeued: u64,
    pub dropped: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acknowledge => self.acknowledged += 1,
            DeliveryOutcome::RequeueOnce => self.requeued += 1,
            DeliveryOutcome::DropAndLog => self.dropped += 1,
        }
    }
}

/// Worker loop for one binding. Stops when the source is drained or shutdown
/// is signalled; an in-flight delivery is always settled before returning.
pub async fn run<D, S>(
    binding: ConsumerBinding<D>,
    mut source: S,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats
where
    D: Decoder,
    S: DeliverySource,
{
    let mut stats = WorkerStats::default();
    info!(queue = %binding.queue(), provider = %binding.decoder.provider(), "consumer: started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = source.next() => match next {
                Some(d) => d,
                None => break,
            },
        };

        let outcome = binding.handle(&delivery).await;
        if let Err(e) = source.settle(delivery.tag, outcome).await {
            error!(queue = %binding.queue(), tag = delivery.tag, ?e, "failed to settle delivery");
        }
        stats.record(outcome);
        if outcome == DeliveryOutcome::RequeueOnce {
            // requeued delivery is ready again at once; let other bindings run
            tokio::task::yield_now().await;
        }
    }

    info!(queue = %binding.queue(), ?stats, "consumer: stopped");
    stats
}
