use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tracing::{error, warn};

use crate::domain::types::EventEnvelope;

/// Subscriber callback.
///
/// Implemented for any `Fn(EventEnvelope) -> impl Future<Output = anyhow::Result<()>>`,
/// so plain async closures can be registered. Handlers must tolerate
/// duplicates: delivery is at-least-once.
pub trait EventHandler: Send + Sync {
    fn handle<'a>(&'a self, event: &'a EventEnvelope) -> BoxFuture<'a, anyhow::Result<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle<'a>(&'a self, event: &'a EventEnvelope) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin((self)(event.clone()))
    }
}

/// Result of handing one event to every handler of its topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub invoked: usize,
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Topic -> handlers registry shared by every bus implementation.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<RwLock<BTreeMap<String, Vec<Arc<dyn EventHandler>>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_owned())
            .or_default()
            .push(handler);
    }

    /// Subscribed topics in sorted order.
    pub fn topics(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Invoke every handler of the event's topic, in registration order.
    ///
    /// Errors and panics are logged and counted; the remaining handlers still run.
    pub async fn dispatch(&self, event: &EventEnvelope) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for (index, handler) in self.handlers_for(&event.topic).into_iter().enumerate() {
            outcome.invoked += 1;
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(
                        topic = %event.topic,
                        event_id = %event.id,
                        handler = index,
                        error = %format!("{e:#}"),
                        "event handler failed"
                    );
                }
                Err(_) => {
                    outcome.failed += 1;
                    error!(
                        topic = %event.topic,
                        event_id = %event.id,
                        handler = index,
                        "event handler panicked"
                    );
                }
            }
        }
        outcome
    }
}
