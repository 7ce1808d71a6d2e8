//! Service lifecycle and the status board read by the health route.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::{ConnectionState, QueueRuntime, QueueStatsSnapshot};
use crate::readiness::ReadinessStatus;

/// Orchestrator lifecycle.
///
/// ```text
/// init → routes-registered → queues-starting → queues-ready | queues-degraded
///      → serving → shutting-down → stopped
/// ```
///
/// `serving → queues-starting` is taken when a dropped broker connection is
/// re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Init,
    RoutesRegistered,
    QueuesStarting,
    QueuesReady,
    QueuesDegraded,
    Serving,
    ShuttingDown,
    Stopped,
}

impl ServiceState {
    pub fn can_advance_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Init, RoutesRegistered)
                | (RoutesRegistered, QueuesStarting)
                | (QueuesStarting, QueuesReady)
                | (QueuesStarting, QueuesDegraded)
                | (QueuesReady, Serving)
                | (QueuesDegraded, Serving)
                | (Serving, QueuesStarting)
                | (RoutesRegistered | QueuesStarting | QueuesReady | QueuesDegraded | Serving, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }
}

struct Board {
    state: watch::Sender<ServiceState>,
    broker: watch::Receiver<ConnectionState>,
    search: watch::Receiver<ReadinessStatus>,
    queues: Vec<QueueRuntime>,
    attached: Mutex<HashSet<String>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Shared, read-mostly view of the running service.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<Board>,
}

impl StatusBoard {
    pub fn new(
        queues: Vec<QueueRuntime>,
        broker: watch::Receiver<ConnectionState>,
        search: watch::Receiver<ReadinessStatus>,
    ) -> Self {
        let (state, _) = watch::channel(ServiceState::Init);
        Self {
            inner: Arc::new(Board {
                state,
                broker,
                search,
                queues,
                attached: Mutex::new(HashSet::new()),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    /// Move to `next`. Transitions outside the lifecycle are refused and logged.
    pub fn advance(&self, next: ServiceState) -> bool {
        let mut accepted = false;
        let mut from = next;
        self.inner.state.send_if_modified(|state| {
            from = *state;
            accepted = state.can_advance_to(next);
            if accepted {
                *state = next;
            }
            accepted
        });

        if accepted {
            info!(from = ?from, to = ?next, "service_state_changed");
        } else {
            warn!(from = ?from, to = ?next, "service_state_transition_refused");
        }
        accepted
    }

    pub fn queues(&self) -> &[QueueRuntime] {
        &self.inner.queues
    }

    pub fn set_attached(&self, queue: &str, attached: bool) {
        let mut set = self.inner.attached.lock().unwrap_or_else(|e| e.into_inner());
        if attached {
            set.insert(queue.to_string());
        } else {
            set.remove(queue);
        }
    }

    pub fn clear_attached(&self) {
        self.inner
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        *self.inner.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }

    /// Address of the HTTP listener once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn report(&self) -> HealthReport {
        let state = self.state();
        let broker = *self.inner.broker.borrow();
        let search = self.inner.search.borrow().clone();
        let attached = self
            .inner
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let queues: Vec<QueueReport> = self
            .inner
            .queues
            .iter()
            .map(|q| QueueReport {
                queue: q.route.binding.queue.clone(),
                handler: q.route.binding.handler.clone(),
                attached: broker == ConnectionState::Connected && attached.contains(q.queue()),
                stats: q.stats.snapshot(),
            })
            .collect();

        let ready = state == ServiceState::Serving
            && broker == ConnectionState::Connected
            && queues.iter().all(|q| q.attached)
            && search.reachable;

        HealthReport {
            status: if ready { "ready" } else { "degraded" },
            service: "notification",
            state,
            broker,
            queues,
            search,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub queue: String,
    pub handler: String,
    pub attached: bool,
    #[serde(flatten)]
    pub stats: QueueStatsSnapshot,
}

/// Body of the health route.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub state: ServiceState,
    pub broker: ConnectionState,
    pub queues: Vec<QueueReport>,
    pub search: ReadinessStatus,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::QueueBinding;
    use crate::dispatch::{BoundRoute, HandlerCatalog, LogMailer};

    pub(crate) fn runtime(queue: &str) -> QueueRuntime {
        let catalog = HandlerCatalog::with_email_handlers(
            Arc::new(LogMailer),
            "noreply@jobber.test",
            "http://localhost:3000",
        );
        QueueRuntime::new(BoundRoute {
            binding: QueueBinding {
                queue: queue.to_string(),
                handler: "auth-email".to_string(),
                route: None,
            },
            handler: catalog.get("auth-email").unwrap(),
        })
    }

    pub(crate) struct Fixture {
        pub board: StatusBoard,
        pub broker: watch::Sender<ConnectionState>,
        pub search: watch::Sender<ReadinessStatus>,
    }

    pub(crate) fn fixture(queues: &[&str]) -> Fixture {
        let (broker, broker_rx) = watch::channel(ConnectionState::Disconnected);
        let (search, search_rx) = watch::channel(ReadinessStatus::unchecked());
        let board = StatusBoard::new(queues.iter().map(|q| runtime(q)).collect(), broker_rx, search_rx);
        Fixture { board, broker, search }
    }

    pub(crate) fn reachable() -> ReadinessStatus {
        ReadinessStatus {
            reachable: true,
            detail: Some("cluster status green".to_string()),
            checked_at_ms: Some(1),
        }
    }

    pub(crate) fn walk_to_serving(board: &StatusBoard) {
        for next in [
            ServiceState::RoutesRegistered,
            ServiceState::QueuesStarting,
            ServiceState::QueuesReady,
            ServiceState::Serving,
        ] {
            assert!(board.advance(next));
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        use ServiceState::*;

        assert!(Init.can_advance_to(RoutesRegistered));
        assert!(QueuesStarting.can_advance_to(QueuesDegraded));
        assert!(QueuesDegraded.can_advance_to(Serving));
        assert!(Serving.can_advance_to(QueuesStarting));
        assert!(Serving.can_advance_to(ShuttingDown));
        assert!(ShuttingDown.can_advance_to(Stopped));

        assert!(!Init.can_advance_to(Serving));
        assert!(!QueuesStarting.can_advance_to(Serving));
        assert!(!Stopped.can_advance_to(Init));
        assert!(!Init.can_advance_to(ShuttingDown));
    }

    #[test]
    fn test_advance_refuses_illegal_transition() {
        let f = fixture(&["auth-email-queue"]);
        assert!(!f.board.advance(ServiceState::Serving));
        assert_eq!(f.board.state(), ServiceState::Init);
        assert!(f.board.advance(ServiceState::RoutesRegistered));
        assert_eq!(f.board.state(), ServiceState::RoutesRegistered);
    }

    #[test]
    fn test_report_ready_requires_everything() {
        let f = fixture(&["auth-email-queue", "order-email-queue"]);
        walk_to_serving(&f.board);
        f.broker.send_replace(ConnectionState::Connected);
        f.search.send_replace(reachable());
        f.board.set_attached("auth-email-queue", true);

        let report = f.board.report();
        assert_eq!(report.status, "degraded");
        assert!(report.queues[0].attached);
        assert!(!report.queues[1].attached);

        f.board.set_attached("order-email-queue", true);
        assert_eq!(f.board.report().status, "ready");

        f.broker.send_replace(ConnectionState::Disconnected);
        let report = f.board.report();
        assert_eq!(report.status, "degraded");
        assert!(report.queues.iter().all(|q| !q.attached));
    }

    #[test]
    fn test_report_degraded_when_search_unreachable() {
        let f = fixture(&["auth-email-queue"]);
        walk_to_serving(&f.board);
        f.broker.send_replace(ConnectionState::Connected);
        f.board.set_attached("auth-email-queue", true);

        assert_eq!(f.board.report().status, "degraded");
    }
}
