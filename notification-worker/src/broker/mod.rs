//! RabbitMQ plumbing for the dispatch pipeline.
//!
//! ```text
//! ConnectionManager → ChannelHandle → attach() → consume loop → process_delivery()
//! ```

pub mod connection;
pub mod consumer;
pub mod delivery;

pub use connection::{ChannelHandle, ConnectionManager, ConnectionState};
pub use consumer::{attach, ConsumerHandle, DispatchLimits, QueueRuntime};
pub use delivery::{
    process_delivery, DeliveryAcker, DeliveryContext, Disposition, Envelope, QueueStats,
    QueueStatsSnapshot, RetryLedger,
};
