//! Transactional email handlers for authentication and order events.
//!
//! Both handlers validate the message, build an [`OutboundEmail`] and pass it
//! to the configured [`Mailer`]. Invalid recipients and missing
//! template fields are permanent failures; mailer outages are transient.

use std::sync::Arc;

use async_trait::async_trait;
use mailparse::{addrparse, MailAddr};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use super::mailer::{Mailer, OutboundEmail};
use super::{Handler, HandlerOutcome};
use crate::error::HandlerError;

/// Catalog name of the authentication email handler.
pub const AUTH_EMAIL_HANDLER: &str = "auth-email";

/// Catalog name of the order email handler.
pub const ORDER_EMAIL_HANDLER: &str = "order-email";

const APP_ICON: &str = "https://i.ibb.co/Kyp2m0t/cover.png";

// =============================================================================
// Authentication Emails
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthEmailKind {
    #[serde(alias = "verify")]
    VerifyEmail,
    ForgotPassword,
    ResetPasswordSuccess,
    #[serde(alias = "otp")]
    OtpEmail,
}

impl AuthEmailKind {
    fn template(self) -> &'static str {
        match self {
            AuthEmailKind::VerifyEmail => "verifyEmail",
            AuthEmailKind::ForgotPassword => "forgotPassword",
            AuthEmailKind::ResetPasswordSuccess => "resetPasswordSuccess",
            AuthEmailKind::OtpEmail => "otpEmail",
        }
    }
}

/// Message published on the auth email queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthEmailMessage {
    #[serde(rename = "type", alias = "template")]
    pub kind: AuthEmailKind,
    #[serde(alias = "receiverEmail")]
    pub to: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub verify_link: Option<String>,
    #[serde(default)]
    pub reset_link: Option<String>,
    #[serde(default)]
    pub otp: Option<String>,
}

pub struct AuthEmailHandler {
    mailer: Arc<dyn Mailer>,
    sender: String,
    client_url: String,
}

impl AuthEmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>, sender: &str, client_url: &str) -> Self {
        Self {
            mailer,
            sender: sender.to_string(),
            client_url: client_url.trim_end_matches('/').to_string(),
        }
    }

    fn build(&self, message: AuthEmailMessage) -> Result<OutboundEmail, HandlerError> {
        let to = validate_recipient(&message.to)?;
        let mut locals = json!({
            "appLink": self.client_url,
            "appIcon": APP_ICON,
            "username": message.username,
        });

        match message.kind {
            AuthEmailKind::VerifyEmail => {
                let link = message
                    .verify_link
                    .unwrap_or_else(|| format!("{}/confirm_email", self.client_url));
                locals["verifyLink"] = Value::String(link);
            }
            AuthEmailKind::ForgotPassword => {
                locals["resetLink"] = Value::String(require(message.reset_link, "resetLink")?);
            }
            AuthEmailKind::ResetPasswordSuccess => {}
            AuthEmailKind::OtpEmail => {
                locals["otp"] = Value::String(require(message.otp, "otp")?);
            }
        }

        Ok(OutboundEmail {
            template: message.kind.template().to_string(),
            from: self.sender.clone(),
            to,
            locals,
        })
    }
}

#[async_trait]
impl Handler for AuthEmailHandler {
    type Message = AuthEmailMessage;

    async fn handle(&self, message: AuthEmailMessage) -> HandlerOutcome {
        let email = self.build(message)?;
        info!(template = %email.template, "auth_email_prepared");
        self.mailer.send(&email).await?;
        Ok(())
    }
}

// =============================================================================
// Order Emails
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderEmailKind {
    OrderPlaced,
    OrderReceipt,
    OrderExtension,
    OrderExtensionApproval,
    OrderDelivered,
    Offer,
}

impl OrderEmailKind {
    fn template(self) -> &'static str {
        match self {
            OrderEmailKind::OrderPlaced => "orderPlaced",
            OrderEmailKind::OrderReceipt => "orderReceipt",
            OrderEmailKind::OrderExtension => "orderExtension",
            OrderEmailKind::OrderExtensionApproval => "orderExtensionApproval",
            OrderEmailKind::OrderDelivered => "orderDelivered",
            OrderEmailKind::Offer => "offer",
        }
    }
}

/// Message published on the order email queue.
///
/// Fields beyond the ones named here are passed to the template untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEmailMessage {
    #[serde(rename = "type", alias = "template")]
    pub kind: OrderEmailKind,
    #[serde(alias = "receiverEmail")]
    pub to: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

pub struct OrderEmailHandler {
    mailer: Arc<dyn Mailer>,
    sender: String,
    client_url: String,
}

impl OrderEmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>, sender: &str, client_url: &str) -> Self {
        Self {
            mailer,
            sender: sender.to_string(),
            client_url: client_url.trim_end_matches('/').to_string(),
        }
    }

    fn build(&self, message: OrderEmailMessage) -> Result<OutboundEmail, HandlerError> {
        let to = validate_recipient(&message.to)?;
        let mut locals = message.details;

        match message.kind {
            OrderEmailKind::Offer => {}
            kind => {
                let order_id = require(message.order_id, "orderId")?;
                if kind == OrderEmailKind::OrderExtension && !locals.contains_key("newDate") {
                    return Err(HandlerError::permanent("missing field 'newDate'"));
                }
                locals
                    .entry("orderUrl")
                    .or_insert_with(|| json!(format!("{}/orders/{}/activities", self.client_url, order_id)));
                locals.insert("orderId".to_string(), Value::String(order_id));
            }
        }

        locals.insert("appLink".to_string(), Value::String(self.client_url.clone()));
        locals.insert("appIcon".to_string(), Value::String(APP_ICON.to_string()));

        Ok(OutboundEmail {
            template: message.kind.template().to_string(),
            from: self.sender.clone(),
            to,
            locals: Value::Object(locals),
        })
    }
}

#[async_trait]
impl Handler for OrderEmailHandler {
    type Message = OrderEmailMessage;

    async fn handle(&self, message: OrderEmailMessage) -> HandlerOutcome {
        let email = self.build(message)?;
        info!(template = %email.template, "order_email_prepared");
        self.mailer.send(&email).await?;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Parse a single recipient address; anything else is a permanent failure.
fn validate_recipient(raw: &str) -> Result<String, HandlerError> {
    let invalid = || HandlerError::permanent("invalid recipient address");

    let list = addrparse(raw.trim()).map_err(|_| invalid())?;
    match list.first() {
        Some(MailAddr::Single(info)) if list.len() == 1 => {
            match info.addr.split_once('@') {
                Some((local, domain)) if !local.is_empty() && domain.contains('.') => {
                    Ok(info.addr.clone())
                }
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

fn require(value: Option<String>, field: &str) -> Result<String, HandlerError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| HandlerError::permanent(format!("missing field '{field}'")))
}
