//! Notification dispatch service.
//!
//! Consumes notification messages from RabbitMQ queues and hands each one to
//! the handler bound to its queue, while reporting readiness of the broker
//! and the search cluster over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ → ConnectionManager → queue consumers → DispatchRouter → Handler → Mailer
//!                                                        ↓
//!                             StatusBoard ← ReadinessReporter (search cluster)
//!                                  ↓
//!                           /notification-health
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod readiness;
pub mod service;
pub mod status;
pub mod telemetry;
pub mod web;

// Re-export commonly used types
pub use config::{Config, QueueBinding};
pub use dispatch::{DispatchRouter, Handler, HandlerCatalog, HandlerOutcome, LogMailer, Mailer};
pub use error::{ConfigError, HandlerError};
pub use service::Service;
pub use status::{HealthReport, ServiceState, StatusBoard};
