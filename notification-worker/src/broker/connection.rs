//! Broker connection manager.
//!
//! Owns the single AMQP connection and the channel opened on it. Consumers
//! get a [`ChannelHandle`], never the connection. The manager fails fast:
//! retry policy belongs to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::{options::BasicQosOptions, Channel, Connection, ConnectionProperties};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::ConnectionError;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

/// Shared view of the connection, updated from lapin's error callback.
struct Shared {
    state: watch::Sender<ConnectionState>,
    /// Bumped on every connect; callbacks from older connections are ignored.
    connection_id: AtomicU64,
    /// Bumped whenever the current channel is replaced or closed.
    channel_id: AtomicU64,
}

pub struct ConnectionManager {
    url: String,
    prefetch_count: u16,
    /// Bound on opening the connection and on opening a channel
    op_timeout: Duration,
    connection: Option<Connection>,
    channel: Option<Channel>,
    last_error: Option<String>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, prefetch_count: u16, op_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            prefetch_count,
            op_timeout,
            connection: None,
            channel: None,
            last_error: None,
            shared: Arc::new(Shared {
                state,
                connection_id: AtomicU64::new(0),
                channel_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state change, including unexpected drops.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Open a connection and one channel.
    ///
    /// Any previous connection is closed first, so repeated calls after a
    /// failure never leak a half-open session.
    pub async fn connect(&mut self) -> Result<ChannelHandle, ConnectionError> {
        self.close().await;

        let connection_id = self.shared.connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.state.send_replace(ConnectionState::Connecting);
        info!(connection_id = connection_id, "rabbitmq_connecting");

        let connecting = Connection::connect(&self.url, ConnectionProperties::default());
        let conn = match timeout(self.op_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(self.fail(ConnectionError::Connect(e))),
            Err(_) => return Err(self.fail(self.timed_out("connect"))),
        };

        let shared = Arc::clone(&self.shared);
        conn.on_error(move |err| {
            if shared.connection_id.load(Ordering::SeqCst) != connection_id {
                return;
            }
            error!(error = %err, error_class = "connection", "rabbitmq_connection_lost");
            shared.state.send_replace(ConnectionState::Disconnected);
        });

        info!("rabbitmq_connected");

        let channel = match self.open_channel(&conn).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = conn.close(200, "Channel setup failed").await;
                return Err(self.fail(e));
            }
        };

        self.connection = Some(conn);
        self.last_error = None;
        self.shared.state.send_replace(ConnectionState::Connected);

        Ok(self.install_channel(channel))
    }

    /// Replace the channel on the current connection.
    ///
    /// Used after the broker closed the channel over a failed declaration.
    /// Handles to the old channel become stale.
    pub async fn reopen_channel(&mut self) -> Result<ChannelHandle, ConnectionError> {
        if self.connection.is_none() || self.state() != ConnectionState::Connected {
            return Err(ConnectionError::Stale(self.state().as_str()));
        }

        if let Some(old) = self.channel.take() {
            if old.status().connected() {
                let _ = old.close(200, "Channel replaced").await;
            }
        }

        let opened = match &self.connection {
            Some(conn) => self.open_channel(conn).await,
            None => Err(ConnectionError::Stale(ConnectionState::Disconnected.as_str())),
        };

        match opened {
            Ok(channel) => {
                info!("rabbitmq_channel_reopened");
                Ok(self.install_channel(channel))
            }
            Err(e) => {
                error!(error = %e, error_class = "connection", "rabbitmq_channel_reopen_failed");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn open_channel(&self, conn: &Connection) -> Result<Channel, ConnectionError> {
        let channel = timeout(self.op_timeout, conn.create_channel())
            .await
            .map_err(|_| self.timed_out("channel open"))?
            .map_err(ConnectionError::Channel)?;
        timeout(
            self.op_timeout,
            channel.basic_qos(self.prefetch_count, BasicQosOptions::default()),
        )
        .await
        .map_err(|_| self.timed_out("basic.qos"))?
        .map_err(ConnectionError::Qos)?;

        info!(
            channel_id = channel.id(),
            prefetch_count = self.prefetch_count,
            "rabbitmq_channel_created"
        );
        Ok(channel)
    }

    fn install_channel(&mut self, channel: Channel) -> ChannelHandle {
        let channel_id = self.shared.channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.channel = Some(channel.clone());
        ChannelHandle {
            channel,
            channel_id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close channel and connection. Safe to call when nothing is open.
    pub async fn close(&mut self) {
        if self.connection.is_none() && self.channel.is_none() {
            // A connect abandoned mid-flight leaves `connecting` behind.
            self.shared.state.send_if_modified(|state| {
                let stale = *state != ConnectionState::Disconnected;
                *state = ConnectionState::Disconnected;
                stale
            });
            return;
        }

        // Invalidate outstanding handles and callbacks before tearing down.
        self.shared.connection_id.fetch_add(1, Ordering::SeqCst);
        self.shared.channel_id.fetch_add(1, Ordering::SeqCst);
        self.shared.state.send_replace(ConnectionState::Closing);

        if let Some(ch) = self.channel.take() {
            if ch.status().connected() {
                if let Err(e) = ch.close(200, "Normal shutdown").await {
                    warn!(error = %e, "rabbitmq_channel_close_error");
                }
            }
        }

        if let Some(conn) = self.connection.take() {
            if conn.status().connected() {
                if let Err(e) = conn.close(200, "Normal shutdown").await {
                    warn!(error = %e, "rabbitmq_connection_close_error");
                }
            }
        }

        self.shared.state.send_replace(ConnectionState::Disconnected);
        info!("rabbitmq_connection_closed");
    }

    /// Publishes states as if lapin had reported them.
    #[cfg(test)]
    pub(crate) fn state_injector(&self) -> impl Fn(ConnectionState) + Send + 'static {
        let shared = Arc::clone(&self.shared);
        move |state| {
            shared.state.send_replace(state);
        }
    }

    fn timed_out(&self, operation: &'static str) -> ConnectionError {
        ConnectionError::Timeout {
            operation,
            after_ms: self.op_timeout.as_millis() as u64,
        }
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        error!(error = %err, error_class = "connection", "rabbitmq_connect_failed");
        self.last_error = Some(err.to_string());
        self.shared.state.send_replace(ConnectionState::Disconnected);
        err
    }
}

/// Borrowed access to the manager's channel.
///
/// Valid only while the connection it came from is still the current one and
/// connected; otherwise every access fails with [`ConnectionError::Stale`].
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Channel,
    channel_id: u64,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    pub fn channel(&self) -> Result<&Channel, ConnectionError> {
        if self.shared.channel_id.load(Ordering::SeqCst) != self.channel_id {
            return Err(ConnectionError::Stale("replaced"));
        }
        match *self.shared.state.borrow() {
            ConnectionState::Connected => {}
            other => return Err(ConnectionError::Stale(other.as_str())),
        }
        if !self.channel.status().connected() {
            return Err(ConnectionError::Stale("channel closed"));
        }
        Ok(&self.channel)
    }

    pub fn is_live(&self) -> bool {
        self.channel().is_ok()
    }
}
