//! Dispatch router: static queue → handler mapping.
//!
//! Handlers are registered by name in a [`HandlerCatalog`]. At startup the
//! configured [`QueueBinding`]s are resolved against the catalog into a
//! [`DispatchRouter`]; a binding naming an unknown handler is a fatal
//! configuration error, never a delivery-time one.
//!
//! ```text
//! queue → DispatchRouter → Route::dispatch(bytes) → Handler::handle(message)
//! ```

pub mod email;
pub mod mailer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::QueueBinding;
use crate::error::{ConfigError, DeserializationError, HandlerError};

pub use email::{AuthEmailHandler, OrderEmailHandler, AUTH_EMAIL_HANDLER, ORDER_EMAIL_HANDLER};
pub use mailer::{LogMailer, Mailer, MailerError, OutboundEmail};

/// Tagged result of one handler invocation.
pub type HandlerOutcome = Result<(), HandlerError>;

/// A typed message handler.
///
/// The handler only ever sees a decoded message. It classifies its own
/// failures as transient or permanent.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Message: DeserializeOwned + Send;

    async fn handle(&self, message: Self::Message) -> HandlerOutcome;
}

/// Type-erased handler entry point used by queue consumers.
#[async_trait]
pub trait Route: Send + Sync {
    /// Decode `payload` and invoke the handler.
    ///
    /// A payload that fails to decode returns `Err` and the handler is not
    /// invoked.
    async fn dispatch(&self, payload: &[u8]) -> Result<HandlerOutcome, DeserializationError>;
}

#[async_trait]
impl<H: Handler> Route for H {
    async fn dispatch(&self, payload: &[u8]) -> Result<HandlerOutcome, DeserializationError> {
        let message: H::Message = serde_json::from_slice(payload)?;
        Ok(self.handle(message).await)
    }
}

/// Named handlers available for binding.
#[derive(Default, Clone)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn Route>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous entry.
    pub fn register<H: Handler>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Route>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The catalog shipped with the service: auth and order emails.
    pub fn with_email_handlers(mailer: Arc<dyn Mailer>, sender_email: &str, client_url: &str) -> Self {
        Self::new()
            .register(
                AUTH_EMAIL_HANDLER,
                AuthEmailHandler::new(Arc::clone(&mailer), sender_email, client_url),
            )
            .register(
                ORDER_EMAIL_HANDLER,
                OrderEmailHandler::new(mailer, sender_email, client_url),
            )
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.names())
            .finish()
    }
}

/// A queue binding resolved to its handler.
#[derive(Clone)]
pub struct BoundRoute {
    pub binding: QueueBinding,
    pub handler: Arc<dyn Route>,
}

impl fmt::Debug for BoundRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundRoute")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Immutable queue → handler table, built once at startup.
#[derive(Debug, Clone)]
pub struct DispatchRouter {
    routes: Vec<BoundRoute>,
}

impl DispatchRouter {
    /// Resolve every binding against the catalog.
    pub fn build(catalog: &HandlerCatalog, bindings: &[QueueBinding]) -> Result<Self, ConfigError> {
        let mut routes: Vec<BoundRoute> = Vec::with_capacity(bindings.len());

        for binding in bindings {
            if routes.iter().any(|r| r.binding.queue == binding.queue) {
                return Err(ConfigError::DuplicateQueue(binding.queue.clone()));
            }

            let handler = catalog
                .get(&binding.handler)
                .ok_or_else(|| ConfigError::UnknownHandler {
                    queue: binding.queue.clone(),
                    handler: binding.handler.clone(),
                })?;

            routes.push(BoundRoute {
                binding: binding.clone(),
                handler,
            });
        }

        Ok(Self { routes })
    }

    pub fn route(&self, queue: &str) -> Option<&BoundRoute> {
        self.routes.iter().find(|r| r.binding.queue == queue)
    }

    /// Routes in binding order.
    pub fn routes(&self) -> &[BoundRoute] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct Ping {
        n: u32,
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Arc<CountingHandler> {
        type Message = Ping;

        async fn handle(&self, message: Ping) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.n == 0 {
                return Err(HandlerError::permanent("zero"));
            }
            Ok(())
        }
    }

    fn binding(queue: &str, handler: &str) -> QueueBinding {
        QueueBinding {
            queue: queue.to_string(),
            handler: handler.to_string(),
            route: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_decodes_before_invoking() {
        let counter = Arc::new(CountingHandler::default());
        let route: Arc<dyn Route> = Arc::new(Arc::clone(&counter));

        assert!(matches!(route.dispatch(br#"{"n": 1}"#).await, Ok(Ok(()))));
        assert!(matches!(
            route.dispatch(br#"{"n": 0}"#).await,
            Ok(Err(HandlerError::Permanent(_)))
        ));
        assert!(route.dispatch(b"{bad json").await.is_err());

        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_router_resolves_bindings() {
        let catalog = HandlerCatalog::new().register("ping", Arc::new(CountingHandler::default()));
        let router =
            DispatchRouter::build(&catalog, &[binding("a", "ping"), binding("b", "ping")]).unwrap();

        assert_eq!(router.routes().len(), 2);
        assert!(router.route("a").is_some());
        assert!(router.route("missing").is_none());
    }

    #[test]
    fn test_router_rejects_unknown_handler() {
        let catalog = HandlerCatalog::new().register("ping", Arc::new(CountingHandler::default()));
        let err = DispatchRouter::build(&catalog, &[binding("a", "pong")]).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::UnknownHandler { ref queue, ref handler } if queue == "a" && handler == "pong"
        ));
    }

    #[test]
    fn test_router_rejects_duplicate_queue() {
        let catalog = HandlerCatalog::new().register("ping", Arc::new(CountingHandler::default()));
        let err =
            DispatchRouter::build(&catalog, &[binding("a", "ping"), binding("a", "ping")]).unwrap_err();

        assert!(matches!(err, ConfigError::DuplicateQueue(q) if q == "a"));
    }

    #[test]
    fn test_shipped_catalog_names() {
        let catalog = HandlerCatalog::with_email_handlers(
            Arc::new(LogMailer),
            "noreply@jobber.test",
            "http://localhost:3000",
        );
        assert_eq!(catalog.names(), vec![AUTH_EMAIL_HANDLER, ORDER_EMAIL_HANDLER]);
    }
}
