//! Publish/subscribe channel between the rendering engine and its controller.
//!
//! The engine publishes lifecycle notifications here and listens for find
//! commands; the controller does the opposite.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEventKind {
    PageRendered,
    PagesInitialized,
    PageChanging,
    PagesVisible,
    Find,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindCommand {
    pub query: String,
    pub case_sensitive: bool,
    pub highlight_all: bool,
    /// Match the query as one phrase rather than word by word.
    pub phrase_search: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    PageRendered { page: usize },
    PagesInitialized { page_count: usize },
    PageChanging { page: usize, previous: usize },
    /// Pages currently on screen, for the search subsystem.
    PagesVisible { pages: Vec<usize> },
    Find(FindCommand),
}

impl BusEvent {
    pub fn kind(&self) -> BusEventKind {
        match self {
            BusEvent::PageRendered { .. } => BusEventKind::PageRendered,
            BusEvent::PagesInitialized { .. } => BusEventKind::PagesInitialized,
            BusEvent::PageChanging { .. } => BusEventKind::PageChanging,
            BusEvent::PagesVisible { .. } => BusEventKind::PagesVisible,
            BusEvent::Find(_) => BusEventKind::Find,
        }
    }
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: BusEventKind,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: SubscriptionId,
    subscriptions: Vec<Subscription>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: BusEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscriptions.push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|sub| sub.id != id);
        inner.subscriptions.len() != before
    }

    pub fn dispatch(&self, event: BusEvent) {
        let kind = event.kind();
        // Handlers run without the lock held so they may subscribe or dispatch.
        let handlers: Vec<Handler> = self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.kind == kind)
            .map(|sub| Arc::clone(&sub.handler))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, kind: BusEventKind) -> usize {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.kind == kind)
            .count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.inner.lock().subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_reaches_only_matching_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(BusEventKind::PageRendered, move |event| {
            sink.lock().push(event.clone());
        });

        bus.dispatch(BusEvent::PageRendered { page: 2 });
        bus.dispatch(BusEvent::PagesInitialized { page_count: 4 });

        assert_eq!(*seen.lock(), vec![BusEvent::PageRendered { page: 2 }]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&count);
        let id = bus.subscribe(BusEventKind::PageChanging, move |_| {
            *counter.lock() += 1;
        });
        bus.dispatch(BusEvent::PageChanging {
            page: 2,
            previous: 1,
        });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.dispatch(BusEvent::PageChanging {
            page: 3,
            previous: 2,
        });

        assert_eq!(*count.lock(), 1);
        assert_eq!(bus.subscriber_count(BusEventKind::PageChanging), 0);
    }

    #[test]
    fn handlers_may_dispatch_reentrantly() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let relay = bus.clone();
        bus.subscribe(BusEventKind::PagesInitialized, move |_| {
            relay.dispatch(BusEvent::PageRendered { page: 1 });
        });
        let sink = Arc::clone(&seen);
        bus.subscribe(BusEventKind::PageRendered, move |event| {
            sink.lock().push(event.kind());
        });

        bus.dispatch(BusEvent::PagesInitialized { page_count: 1 });
        assert_eq!(*seen.lock(), vec![BusEventKind::PageRendered]);
    }
}
