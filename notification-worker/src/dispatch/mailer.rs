//! Outbound email seam.
//!
//! Template rendering and provider transport live behind [`Mailer`]. The
//! shipped [`LogMailer`] records the email instead of sending it.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::error::HandlerError;

/// A rendered-ready email: template name plus the values it needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEmail {
    pub template: String,
    pub from: String,
    pub to: String,
    pub locals: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum MailerError {
    /// Provider unreachable or overloaded.
    #[error("mail provider unavailable: {0}")]
    Unavailable(String),

    #[error("mail provider timed out")]
    Timeout,

    /// Provider refused the message itself.
    #[error("mail provider rejected message: {0}")]
    Rejected(String),
}

impl From<MailerError> for HandlerError {
    fn from(err: MailerError) -> Self {
        match err {
            MailerError::Unavailable(_) | MailerError::Timeout => {
                HandlerError::Transient(err.to_string())
            }
            MailerError::Rejected(_) => HandlerError::Permanent(err.to_string()),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailerError>;
}

/// Mailer that logs each email and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailerError> {
        info!(
            template = %email.template,
            to = %email.to,
            from = %email.from,
            "email_sent"
        );
        Ok(())
    }
}
