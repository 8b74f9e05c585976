//! Lifecycle events and the bus that carries them
//!
//! [`Bus`] wraps a [`tokio::sync::broadcast`] channel. Every component
//! publishes to it; nothing in the proxy consumes from it. Callers observe
//! the supervisor through a [`Subscription`], optionally filtered to a set
//! of [`Topic`]s. Dropping a subscription unsubscribes.

use crate::app::AppSpec;
use crate::error::{ErrorKind, ProxyError, StartError};
use crate::process::ExitResult;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Discriminant of an [`Event`], used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    AppStart,
    AppStop,
    AppError,
    Error,
    Closing,
    Closed,
}

/// Why an app reported an error
#[derive(Debug, Clone)]
pub enum AppFailure {
    /// The worker could not be brought to readiness
    Start(Arc<StartError>),
    /// A running worker exited abnormally
    Exit(ExitResult),
}

/// Something observable happened in the supervisor
#[derive(Debug, Clone)]
pub enum Event {
    /// A listener accepted an inbound connection
    Connection { app: Arc<AppSpec>, peer: String },
    /// A worker became ready
    AppStart {
        app: Arc<AppSpec>,
        pid: Option<u32>,
        start_count: u64,
    },
    /// A worker process terminated
    AppStop {
        app: Arc<AppSpec>,
        pid: Option<u32>,
        exit: ExitResult,
    },
    /// A worker failed to start or died abnormally
    AppError { app: Arc<AppSpec>, failure: AppFailure },
    /// Asynchronous fault, see [`ErrorKind`]
    Error { app: Arc<AppSpec>, error: Arc<ProxyError> },
    /// Shutdown began
    Closing,
    /// Shutdown finished; every listener is closed and every worker stopped
    Closed,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Connection { .. } => Topic::Connection,
            Event::AppStart { .. } => Topic::AppStart,
            Event::AppStop { .. } => Topic::AppStop,
            Event::AppError { .. } => Topic::AppError,
            Event::Error { .. } => Topic::Error,
            Event::Closing => Topic::Closing,
            Event::Closed => Topic::Closed,
        }
    }

    /// Name of the app this event concerns, if any
    pub fn app_name(&self) -> Option<&str> {
        match self {
            Event::Connection { app, .. }
            | Event::AppStart { app, .. }
            | Event::AppStop { app, .. }
            | Event::AppError { app, .. }
            | Event::Error { app, .. } => Some(&app.name),
            Event::Closing | Event::Closed => None,
        }
    }

    /// Kind of an [`Event::Error`], `None` for every other event
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Event::Error { error, .. } => Some(error.kind()),
            _ => None,
        }
    }
}

/// Broadcast channel for lifecycle events
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Errors are ignored if there are no active subscribers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Subscribe to every topic
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: None,
        }
    }

    /// Subscribe to the given topics only
    pub fn subscribe_to(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: Some(topics.to_vec()),
        }
    }
}

/// Receiving end of the bus
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    topics: Option<Vec<Topic>>,
}

impl Subscription {
    fn wants(&self, ev: &Event) -> bool {
        self.topics.as_ref().map_or(true, |t| t.contains(&ev.topic()))
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once the bus is gone. Events dropped because this
    /// subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if self.wants(&ev) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) if self.wants(&ev) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppDescriptor, AppSpec};
    use crate::target::Target;
    use std::io;
    use std::path::Path;

    fn spec() -> Arc<AppSpec> {
        let desc = AppDescriptor::exe("echo", "/bin/cat").with_src(Target::port(8080));
        Arc::new(AppSpec::from_descriptor(&desc, Path::new("/tmp")).unwrap())
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe();

        bus.publish(Event::Closing);
        bus.publish(Event::Closed);

        assert_eq!(sub.recv().await.map(|e| e.topic()), Some(Topic::Closing));
        assert_eq!(sub.recv().await.map(|e| e.topic()), Some(Topic::Closed));
    }

    #[tokio::test]
    async fn test_topic_filter() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe_to(&[Topic::AppStart]);

        bus.publish(Event::Closing);
        bus.publish(Event::AppStart {
            app: spec(),
            pid: Some(42),
            start_count: 1,
        });

        match sub.recv().await {
            Some(Event::AppStart { pid, start_count, .. }) => {
                assert_eq!(pid, Some(42));
                assert_eq!(start_count, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscription_stops_receiving() {
        let bus = Bus::new(16);
        let sub = bus.subscribe();
        let mut kept = bus.subscribe();
        drop(sub);

        bus.publish(Event::Closed);
        assert_eq!(kept.drain().len(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = Bus::new(4);
        bus.publish(Event::Closing);
    }

    #[test]
    fn test_error_event_accessors() {
        let ev = Event::Error {
            app: spec(),
            error: Arc::new(ProxyError::Outgoing(io::Error::from(io::ErrorKind::ConnectionRefused))),
        };
        assert_eq!(ev.topic(), Topic::Error);
        assert_eq!(ev.error_kind(), Some(ErrorKind::Outgoing));
        assert_eq!(ev.app_name(), Some("echo"));
        assert_eq!(Event::Closed.app_name(), None);
    }
}
