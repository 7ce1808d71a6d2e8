//! Queue consumer: declares one binding's topology and consumes it.
//!
//! Each delivery is handed to its own task once a permit from the shared
//! in-flight limiter is available, so a burst from the broker never grows
//! past the configured bound. A consumer whose delivery stream ends reports
//! its queue on the `lost` channel so the supervisor can re-attach it.

use std::sync::Arc;

use futures::{future, Stream, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Consumer, ExchangeKind,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Span};

use super::connection::ChannelHandle;
use super::delivery::{
    process_delivery, DeliveryAcker, DeliveryContext, Envelope, QueueStats, RetryLedger,
};
use crate::dispatch::BoundRoute;
use crate::error::AttachError;

/// Per-queue state that outlives individual connections.
#[derive(Debug, Clone)]
pub struct QueueRuntime {
    pub route: BoundRoute,
    pub stats: Arc<QueueStats>,
    pub ledger: Arc<RetryLedger>,
}

impl QueueRuntime {
    pub fn new(route: BoundRoute) -> Self {
        Self {
            route,
            stats: Arc::new(QueueStats::default()),
            ledger: Arc::new(RetryLedger::new()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.route.binding.queue
    }
}

/// Limits shared by every consumer of the process.
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    /// Permits for concurrently running handler invocations
    pub in_flight: Arc<Semaphore>,
    pub max_retries: u32,
}

/// A running consumer.
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    channel: Channel,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The delivery stream has ended; nothing consumes this queue any more.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop new deliveries. In-flight handlers keep running and settle.
    pub async fn cancel(self) {
        if self.channel.status().connected() {
            if let Err(e) = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(queue = %self.queue, error = %e, "rabbitmq_cancel_failed");
            }
        }
        // The delivery stream ends after the cancel; a dead channel never ends it.
        self.task.abort();
        info!(queue = %self.queue, "rabbitmq_consumer_cancelled");
    }
}

/// Declare the binding's queue (and exchange) and start consuming it.
///
/// Calls against the channel are made in sequence; callers attach bindings
/// one at a time. When the consumer later stops without being cancelled,
/// its queue name is sent on `lost`.
pub async fn attach(
    handle: &ChannelHandle,
    runtime: &QueueRuntime,
    limits: &DispatchLimits,
    lost: &mpsc::UnboundedSender<String>,
) -> Result<ConsumerHandle, AttachError> {
    let binding = &runtime.route.binding;
    let queue = binding.queue.as_str();
    let channel = handle.channel()?;

    if let Some(route) = &binding.route {
        channel
            .exchange_declare(
                &route.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| AttachError::DeclareExchange {
                exchange: route.exchange.clone(),
                source,
            })?;
    }

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| AttachError::DeclareQueue {
            queue: queue.to_string(),
            source,
        })?;

    if let Some(route) = &binding.route {
        channel
            .queue_bind(
                queue,
                &route.exchange,
                &route.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| AttachError::Bind {
                queue: queue.to_string(),
                exchange: route.exchange.clone(),
                source,
            })?;
    }

    let consumer_tag = format!("notification-{queue}");
    let consumer = channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| AttachError::Consume {
            queue: queue.to_string(),
            source,
        })?;

    let span = info_span!("queue_consumer", queue = %queue, handler = %binding.handler);
    let task = tokio::spawn(
        consume(consumer, runtime.clone(), limits.clone(), lost.clone(), span.clone()).instrument(span),
    );

    info!(
        queue = %queue,
        handler = %binding.handler,
        exchange = ?binding.route.as_ref().map(|r| r.exchange.as_str()),
        "rabbitmq_consumer_started"
    );

    Ok(ConsumerHandle {
        queue: queue.to_string(),
        consumer_tag,
        channel: channel.clone(),
        task,
    })
}

async fn consume(
    consumer: Consumer,
    runtime: QueueRuntime,
    limits: DispatchLimits,
    lost: mpsc::UnboundedSender<String>,
    span: Span,
) {
    let queue = runtime.queue().to_string();
    let deliveries = consumer.filter_map(move |delivery| {
        future::ready(match delivery {
            Ok(delivery) => Some(Envelope::from_delivery(&queue, delivery)),
            Err(e) => {
                error!(error = %e, error_class = "connection", "rabbitmq_delivery_error");
                None
            }
        })
    });

    dispatch_deliveries(deliveries, &runtime, &limits, &span).await;

    // Also reached after a cancel; the supervisor ignores queues it no longer holds.
    warn!(queue = %runtime.queue(), "rabbitmq_consumer_closed");
    let _ = lost.send(runtime.queue().to_string());
}

/// Hand every delivery of `deliveries` to its own task, holding one
/// in-flight permit per running handler.
pub(crate) async fn dispatch_deliveries<S, A>(
    deliveries: S,
    runtime: &QueueRuntime,
    limits: &DispatchLimits,
    span: &Span,
) where
    S: Stream<Item = (Envelope, A)>,
    A: DeliveryAcker + 'static,
{
    futures::pin_mut!(deliveries);

    while let Some((envelope, acker)) = deliveries.next().await {
        // Backpressure: hold the next delivery until a handler slot frees up.
        let permit = match Arc::clone(&limits.in_flight).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("dispatch_limiter_closed");
                break;
            }
        };

        let runtime = runtime.clone();
        let max_retries = limits.max_retries;

        tokio::spawn(
            async move {
                let ctx = DeliveryContext {
                    route: runtime.route.handler.as_ref(),
                    ledger: &runtime.ledger,
                    stats: &runtime.stats,
                    max_retries,
                };
                process_delivery(ctx, envelope, &acker).await;
                drop(permit);
            }
            .instrument(span.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueBinding;
    use crate::dispatch::{Handler, HandlerOutcome, Route};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoopAcker;

    #[async_trait]
    impl DeliveryAcker for NoopAcker {
        async fn ack_delivery(&self) -> Result<(), lapin::Error> {
            Ok(())
        }

        async fn reject_delivery(&self, _requeue: bool) -> Result<(), lapin::Error> {
            Ok(())
        }
    }

    /// Tracks how many invocations overlap.
    #[derive(Default)]
    struct SlowHandler {
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Arc<SlowHandler> {
        type Message = serde_json::Value;

        async fn handle(&self, _message: serde_json::Value) -> HandlerOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope(tag: u64) -> Envelope {
        Envelope {
            queue: "auth-email-queue".to_string(),
            delivery_tag: tag,
            message_id: Some(format!("msg-{tag}")),
            redelivered: false,
            delivery_count: None,
            payload: br#"{"to":"a@b.com"}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_in_flight_handlers_are_bounded() {
        let handler = Arc::new(SlowHandler::default());
        let route: Arc<dyn Route> = Arc::new(Arc::clone(&handler));
        let runtime = QueueRuntime::new(BoundRoute {
            binding: QueueBinding {
                queue: "auth-email-queue".to_string(),
                handler: "slow".to_string(),
                route: None,
            },
            handler: route,
        });
        let limits = DispatchLimits {
            in_flight: Arc::new(Semaphore::new(2)),
            max_retries: 3,
        };

        let deliveries = futures::stream::iter((1..=8).map(|tag| (envelope(tag), NoopAcker)));
        dispatch_deliveries(deliveries, &runtime, &limits, &Span::none()).await;

        // Every permit back means every spawned delivery has settled.
        let _all = tokio::time::timeout(Duration::from_secs(5), limits.in_flight.acquire_many(2))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handler.done.load(Ordering::SeqCst), 8);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(runtime.stats.snapshot().acked, 8);
    }
}
