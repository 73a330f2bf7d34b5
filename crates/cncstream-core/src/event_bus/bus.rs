//! Event notifier
//!
//! Synchronous handlers are called on the publishing thread in subscription
//! order, each inside its own unwind boundary: a panicking handler is logged
//! and counted, and the remaining handlers still receive the event. Async
//! consumers can take a broadcast [`receiver`](EventBus::receiver) instead.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{AppEvent, EventCategory};

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0.simple().to_string();
        write!(f, "sub-{}", &id[..8])
    }
}

/// Which events a subscriber sees
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    #[default]
    All,
    /// Any of these categories
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    pub fn matches(&self, event: &AppEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

type Handler = Arc<dyn Fn(AppEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Handler,
    faults: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Backlog of the broadcast channel for async receivers
    pub channel_capacity: usize,
    /// Keep the last `recent_capacity` events for inspection; 0 keeps none
    pub recent_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            recent_capacity: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    /// Nobody handled or received the event
    #[error("No active subscribers")]
    NoSubscribers,
}

/// Fan-out of backend events to observers
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    subscribers: RwLock<Vec<Subscriber>>,
    recent: Mutex<VecDeque<AppEvent>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(Vec::new()),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity)),
            config,
        }
    }

    /// Deliver an event to every matching handler and async receiver
    ///
    /// Returns how many handlers and receivers it reached. Handlers run
    /// after the subscriber list is released, so they may subscribe,
    /// unsubscribe or publish themselves.
    pub fn publish(&self, event: AppEvent) -> Result<usize, EventBusError> {
        if self.config.recent_capacity > 0 {
            let mut recent = self.recent.lock();
            if recent.len() == self.config.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let targets: Vec<(SubscriptionId, Handler, Arc<AtomicUsize>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| (s.id, s.handler.clone(), s.faults.clone()))
            .collect();

        let mut reached = 0;
        for (id, handler, faults) in &targets {
            let delivered = event.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| handler(delivered))) {
                Ok(()) => reached += 1,
                Err(_) => {
                    faults.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Subscriber {} panicked on '{}'", id, event.description());
                }
            }
        }

        let received = self.sender.send(event).unwrap_or(0);
        if targets.is_empty() && received == 0 {
            return Err(EventBusError::NoSubscribers);
        }
        Ok(reached + received)
    }

    /// Register a handler, called on the publishing thread
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(AppEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.subscribers.write().push(Subscriber {
            id,
            filter,
            handler: Arc::new(handler),
            faults: Arc::new(AtomicUsize::new(0)),
        });
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Broadcast receiver for async consumers
    ///
    /// A receiver that falls more than `channel_capacity` events behind
    /// loses the oldest ones.
    pub fn receiver(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Remove a handler; false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Times a handler has panicked, `None` for unknown subscriptions
    pub fn faults(&self, id: SubscriptionId) -> Option<usize> {
        self.subscribers
            .read()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.faults.load(Ordering::Relaxed))
    }

    /// Last published events, oldest first
    pub fn recent(&self) -> Vec<AppEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn clear_recent(&self) {
        self.recent.lock().clear();
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::events::{MachineEvent, RunEvent, SerialEvent};

    fn progress(completed: usize) -> AppEvent {
        AppEvent::Run(RunEvent::Progress {
            completed,
            total: 10,
        })
    }

    fn recorder(bus: &EventBus, filter: EventFilter) -> (SubscriptionId, Arc<Mutex<Vec<AppEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(filter, move |event| sink.lock().push(event));
        (id, seen)
    }

    #[test]
    fn test_publish_without_observers() {
        let bus = EventBus::new();
        assert_eq!(
            bus.publish(AppEvent::Machine(MachineEvent::AlarmCleared)),
            Err(EventBusError::NoSubscribers)
        );
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let (_, first) = recorder(&bus, EventFilter::All);
        let faulty = bus.subscribe(EventFilter::All, |event| {
            if let AppEvent::Run(RunEvent::Progress { completed: 2, .. }) = event {
                panic!("observer bug");
            }
        });
        let (_, last) = recorder(&bus, EventFilter::All);

        for n in 1..=3 {
            bus.publish(progress(n)).unwrap();
        }
        assert_eq!(first.lock().len(), 3);
        assert_eq!(last.lock().len(), 3);
        assert_eq!(bus.faults(faulty), Some(1));
        assert_eq!(bus.subscriber_count(), 3);
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..4 {
            let order = order.clone();
            bus.subscribe(EventFilter::All, move |_| order.lock().push(n));
        }
        assert_eq!(bus.publish(progress(1)), Ok(4));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe(EventFilter::All, move |_| {
            inner.subscribe(EventFilter::All, |_| {});
        });
        bus.publish(progress(1)).unwrap();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (id, seen) = recorder(&bus, EventFilter::All);
        bus.publish(progress(1)).unwrap();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.faults(id), None);
        assert!(bus.publish(progress(2)).is_err());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_category_filter() {
        let bus = EventBus::new();
        let (_, serial) = recorder(&bus, EventFilter::Categories(vec![EventCategory::Serial]));
        let (_, run) = recorder(
            &bus,
            EventFilter::Categories(vec![EventCategory::Run, EventCategory::Machine]),
        );

        bus.publish(AppEvent::Serial(SerialEvent::Sent {
            line: "G0 X1".into(),
        }))
        .unwrap();
        bus.publish(progress(1)).unwrap();
        bus.publish(AppEvent::Machine(MachineEvent::AlarmCleared)).unwrap();

        assert_eq!(serial.lock().len(), 1);
        assert_eq!(run.lock().len(), 2);
    }

    #[test]
    fn test_recent_events_bounded() {
        let bus = EventBus::with_config(EventBusConfig {
            recent_capacity: 3,
            ..Default::default()
        });
        for n in 0..5 {
            bus.publish(progress(n)).ok();
        }
        let recent = bus.recent();
        assert_eq!(recent.len(), 3);
        assert!(matches!(recent[0], AppEvent::Run(RunEvent::Progress { completed: 2, .. })));
        bus.clear_recent();
        assert!(bus.recent().is_empty());
        assert!(EventBus::new().recent().is_empty());
    }

    #[tokio::test]
    async fn test_async_receiver() {
        let bus = EventBus::new();
        let mut receiver = bus.receiver();
        assert_eq!(bus.publish(progress(7)), Ok(1));
        match receiver.recv().await {
            Ok(AppEvent::Run(RunEvent::Progress { completed, .. })) => assert_eq!(completed, 7),
            other => panic!("unexpected {:?}", other),
        }
    }
}
