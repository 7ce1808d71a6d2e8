//! Configuration module for environment variable parsing.
//!
//! All configuration is read once at startup. Missing required values and
//! values that fail to parse are fatal [`ConfigError`]s.

use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;
use url::Url;

use crate::error::ConfigError;

/// Default HTTP port of the notification server.
pub const DEFAULT_PORT: u16 = 4001;

/// Bindings used when `QUEUE_BINDINGS` is not set.
pub const DEFAULT_BINDINGS: &str = "auth-email-queue=auth-email@jobber-email-notification/auth-email,\
                                    order-email-queue=order-email@jobber-order-notification/order-email";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// AMQP URI of the broker
    pub rabbitmq_endpoint: Url,

    /// Base URL of the search cluster probed for readiness
    pub elastic_search_url: Url,

    /// Interface for the HTTP health surface
    pub host: IpAddr,

    /// Port for the HTTP health surface
    pub port: u16,

    /// Static queue → handler bindings, fixed for the process lifetime
    pub bindings: Vec<QueueBinding>,

    /// Broker-side prefetch limit per channel
    pub prefetch_count: u16,

    /// Maximum number of handler invocations running at once
    pub max_in_flight: usize,

    /// Transient failures tolerated per message before it is dropped
    pub max_handler_retries: u32,

    /// Connection attempt and reconnect policy
    pub connect: ConnectPolicy,

    pub search_probe_timeout: Duration,
    pub search_probe_interval: Duration,

    /// Budget for draining in-flight handlers on shutdown
    pub shutdown_grace: Duration,

    /// From address of outbound emails
    pub sender_email: String,

    /// Base URL of the client application, used in email links
    pub client_url: String,

    pub log_format: LogFormat,
}

/// One durable queue and the handler that consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub handler: String,
    /// Direct exchange the queue is bound to, if producers publish through one
    pub route: Option<ExchangeRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRoute {
    pub exchange: String,
    pub routing_key: String,
}

/// Bounded connection policy. Nothing retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Attempts per connection round
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on a single connect, channel open or queue attach
    pub operation_timeout: Duration,
    /// Run another bounded round after the connection drops at runtime
    pub reconnect: bool,
}

impl ConnectPolicy {
    /// Backoff before attempt `attempt + 1`, doubling from the initial value.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rabbitmq_endpoint = parse_url(&lookup, "RABBITMQ_ENDPOINT", &["amqp", "amqps"])?;
        let elastic_search_url = parse_url(&lookup, "ELASTIC_SEARCH_URL", &["http", "https"])?;

        let bindings = match lookup("QUEUE_BINDINGS") {
            Some(raw) => parse_bindings(&raw)?,
            None => parse_bindings(DEFAULT_BINDINGS)?,
        };

        let (initial_ms, max_ms) = parse_range(&lookup, "BROKER_BACKOFF_MS", (500, 8000))?;

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    reason: format!("expected 'json' or 'pretty', got '{other}'"),
                })
            }
        };

        let max_in_flight: usize = parse_var(&lookup, "MAX_IN_FLIGHT", 20)?;
        let in_flight_cap = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        if max_in_flight == 0 || max_in_flight > in_flight_cap {
            return Err(ConfigError::Invalid {
                name: "MAX_IN_FLIGHT",
                reason: format!("must be between 1 and {in_flight_cap}"),
            });
        }

        let attempts: u32 = parse_var(&lookup, "BROKER_CONNECT_ATTEMPTS", 5)?;
        if attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "BROKER_CONNECT_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Config {
            rabbitmq_endpoint,
            elastic_search_url,
            host: parse_var(&lookup, "SERVER_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse_var(&lookup, "SERVER_PORT", DEFAULT_PORT)?,
            bindings,
            prefetch_count: parse_var(&lookup, "PREFETCH_COUNT", 20)?,
            max_in_flight,
            max_handler_retries: parse_var(&lookup, "MAX_HANDLER_RETRIES", 3)?,
            connect: ConnectPolicy {
                attempts,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                operation_timeout: millis(&lookup, "BROKER_TIMEOUT_MS", 10_000)?,
                reconnect: parse_var(&lookup, "BROKER_RECONNECT", true)?,
            },
            search_probe_timeout: millis(&lookup, "SEARCH_PROBE_TIMEOUT_MS", 2000)?,
            search_probe_interval: millis(&lookup, "SEARCH_PROBE_INTERVAL_MS", 15_000)?,
            shutdown_grace: millis(&lookup, "SHUTDOWN_GRACE_MS", 10_000)?,
            sender_email: lookup("SENDER_EMAIL")
                .unwrap_or_else(|| "notifications@localhost".to_string()),
            client_url: lookup("CLIENT_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            log_format,
        })
    }

    /// Broker URI with the password removed, safe to log.
    pub fn redacted_broker_url(&self) -> String {
        let mut url = self.rabbitmq_endpoint.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        url.to_string()
    }
}

/// Parse `queue=handler[@exchange[/routing_key]]` entries separated by commas.
pub fn parse_bindings(raw: &str) -> Result<Vec<QueueBinding>, ConfigError> {
    let mut seen = HashSet::new();
    let mut bindings = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let malformed = |reason: &str| ConfigError::MalformedBinding {
            binding: entry.to_string(),
            reason: reason.to_string(),
        };

        let (queue, target) = entry
            .split_once('=')
            .ok_or_else(|| malformed("expected queue=handler"))?;
        let queue = queue.trim();

        let (handler, route) = match target.split_once('@') {
            Some((handler, route)) => (handler.trim(), Some(route.trim())),
            None => (target.trim(), None),
        };

        if queue.is_empty() || handler.is_empty() {
            return Err(malformed("queue and handler must be non-empty"));
        }

        let route = match route {
            None => None,
            Some(route) => {
                let (exchange, routing_key) = match route.split_once('/') {
                    Some((exchange, key)) => (exchange.trim(), key.trim()),
                    None => (route, handler),
                };
                if exchange.is_empty() || routing_key.is_empty() {
                    return Err(malformed("exchange and routing key must be non-empty"));
                }
                Some(ExchangeRoute {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
        };

        if !seen.insert(queue.to_string()) {
            return Err(ConfigError::DuplicateQueue(queue.to_string()));
        }

        bindings.push(QueueBinding {
            queue: queue.to_string(),
            handler: handler.to_string(),
            route,
        });
    }

    if bindings.is_empty() {
        return Err(ConfigError::Invalid {
            name: "QUEUE_BINDINGS",
            reason: "at least one binding is required".to_string(),
        });
    }

    Ok(bindings)
}

fn parse_url<F>(lookup: &F, name: &'static str, schemes: &[&str]) -> Result<Url, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))?;

    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(url)
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn millis<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, name, default).map(Duration::from_millis)
}

/// Parse a comma-separated range like "500,5000" into a tuple.
fn parse_range<F>(lookup: &F, name: &'static str, default: (u64, u64)) -> Result<(u64, u64), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(name) {
        Some(v) => v,
        None => return Ok(default),
    };

    let invalid = || ConfigError::Invalid {
        name,
        reason: format!("expected 'min,max', got '{raw}'"),
    };

    let (min, max) = raw.split_once(',').ok_or_else(invalid)?;
    match (min.trim().parse::<u64>(), max.trim().parse::<u64>()) {
        (Ok(min), Ok(max)) if min <= max => Ok((min, max)),
        _ => Err(invalid()),
    }
}
