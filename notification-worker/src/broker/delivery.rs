//! Per-delivery processing: decode, dispatch, settle.
//!
//! Every delivery ends in exactly one [`Disposition`], applied once through
//! its own [`DeliveryAcker`] after the handler has returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
    types::AMQPValue,
    BasicProperties,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::dispatch::Route;
use crate::error::HandlerError;

/// Entries kept before the retry ledger is reset.
const LEDGER_CAPACITY: usize = 10_000;

/// One delivered message, detached from the broker.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub queue: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// Previous deliveries reported by the broker (`x-delivery-count`)
    pub delivery_count: Option<u32>,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Split a lapin delivery into the envelope and the acker that settles it.
    pub fn from_delivery(queue: &str, delivery: Delivery) -> (Self, Acker) {
        let envelope = Envelope {
            queue: queue.to_string(),
            delivery_tag: delivery.delivery_tag,
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|s| s.to_string()),
            redelivered: delivery.redelivered,
            delivery_count: delivery_count(&delivery.properties),
            payload: delivery.data,
        };
        (envelope, delivery.acker)
    }

    /// Short SHA-256 of the payload, used in logs instead of the content.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.payload);
        hex::encode(&digest[..8])
    }

    fn retry_key(&self) -> String {
        match &self.message_id {
            Some(id) => format!("id:{id}"),
            None => format!("sha:{}", self.fingerprint()),
        }
    }
}

/// Read the broker's redelivery counter, if the queue type provides one.
pub fn delivery_count(properties: &BasicProperties) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-delivery-count")?;

    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(count).ok()
}

/// Final settlement of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject and ask the broker to redeliver
    Requeue,
    /// Reject without requeue
    Reject,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack_delivery(&self) -> Result<(), lapin::Error>;
    async fn reject_delivery(&self, requeue: bool) -> Result<(), lapin::Error>;
}

#[async_trait]
impl DeliveryAcker for Acker {
    async fn ack_delivery(&self) -> Result<(), lapin::Error> {
        self.ack(BasicAckOptions::default()).await
    }

    async fn reject_delivery(&self, requeue: bool) -> Result<(), lapin::Error> {
        self.reject(BasicRejectOptions { requeue }).await
    }
}

/// Counts transient failures per message across redeliveries.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transient failure and return the failures seen so far.
    fn record_failure(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        if attempts.len() >= LEDGER_CAPACITY && !attempts.contains_key(key) {
            warn!(entries = attempts.len(), "retry_ledger_reset");
            attempts.clear();
        }
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-queue dispatch counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    poison: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub poison: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
        }
    }
}

/// Everything a delivery needs besides the envelope itself.
pub struct DeliveryContext<'a> {
    pub route: &'a dyn Route,
    pub ledger: &'a RetryLedger,
    pub stats: &'a QueueStats,
    /// Requeues allowed per message; the handler runs at most this plus one times
    pub max_retries: u32,
}

/// Decode and dispatch one delivery, then settle it exactly once.
pub async fn process_delivery(
    ctx: DeliveryContext<'_>,
    envelope: Envelope,
    acker: &dyn DeliveryAcker,
) -> Disposition {
    ctx.stats.received.fetch_add(1, Ordering::Relaxed);

    let message_id = envelope.message_id.as_deref().unwrap_or("unknown");
    let key = envelope.retry_key();

    let disposition = match ctx.route.dispatch(&envelope.payload).await {
        Err(e) => {
            error!(
                queue = %envelope.queue,
                delivery_tag = envelope.delivery_tag,
                message_id = %message_id,
                payload_length = envelope.payload.len(),
                fingerprint = %envelope.fingerprint(),
                error = %e,
                error_class = "deserialization",
                "delivery_rejected_poison"
            );
            ctx.stats.poison.fetch_add(1, Ordering::Relaxed);
            ctx.ledger.forget(&key);
            Disposition::Reject
        }
        Ok(Ok(())) => {
            ctx.ledger.forget(&key);
            Disposition::Ack
        }
        Ok(Err(err @ HandlerError::Permanent(_))) => {
            error!(
                queue = %envelope.queue,
                delivery_tag = envelope.delivery_tag,
                message_id = %message_id,
                error = %err,
                error_class = err.class(),
                "delivery_rejected"
            );
            ctx.ledger.forget(&key);
            Disposition::Reject
        }
        Ok(Err(err @ HandlerError::Transient(_))) => {
            let failures = ctx.ledger.record_failure(&key);
            let failures = envelope
                .delivery_count
                .map_or(failures, |previous| failures.max(previous.saturating_add(1)));

            if failures > ctx.max_retries {
                error!(
                    queue = %envelope.queue,
                    delivery_tag = envelope.delivery_tag,
                    message_id = %message_id,
                    failures = failures,
                    error = %err,
                    error_class = "retries_exhausted",
                    "delivery_rejected"
                );
                ctx.ledger.forget(&key);
                Disposition::Reject
            } else {
                warn!(
                    queue = %envelope.queue,
                    delivery_tag = envelope.delivery_tag,
                    message_id = %message_id,
                    failures = failures,
                    redelivered = envelope.redelivered,
                    error = %err,
                    error_class = err.class(),
                    "delivery_requeued"
                );
                Disposition::Requeue
            }
        }
    };

    let settled = match disposition {
        Disposition::Ack => acker.ack_delivery().await,
        Disposition::Requeue => acker.reject_delivery(true).await,
        Disposition::Reject => acker.reject_delivery(false).await,
    };

    match settled {
        Ok(()) => {
            let counter = match disposition {
                Disposition::Ack => &ctx.stats.acked,
                Disposition::Requeue => &ctx.stats.requeued,
                Disposition::Reject => &ctx.stats.rejected,
            };
            counter.fetch_add(1, Ordering::Relaxed);

            if disposition == Disposition::Ack {
                info!(
                    queue = %envelope.queue,
                    delivery_tag = envelope.delivery_tag,
                    message_id = %message_id,
                    "delivery_acked"
                );
            }
        }
        Err(e) => {
            // The channel is gone; the broker will redeliver.
            error!(
                queue = %envelope.queue,
                delivery_tag = envelope.delivery_tag,
                disposition = ?disposition,
                error = %e,
                error_class = "connection",
                "rabbitmq_settle_failed"
            );
        }
    }

    disposition
}
