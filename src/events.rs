use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::sync::SyncFlags;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    StudyLoaded {
        study_id: String,
        series_count: usize,
        image_count: usize,
    },
    StudyUnloaded {
        study_id: String,
        cleared_viewports: Vec<String>,
    },
    SeriesAssigned {
        viewport_id: String,
        series_id: String,
        study_id: String,
        previous_series_id: Option<String>,
    },
    Error {
        message: String,
    },
    StateChanged(StateChange),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    ViewportCleared {
        viewport_id: String,
        series_id: String,
    },
    LayoutChanged {
        viewport_ids: Vec<String>,
    },
    SeriesProgress {
        series_id: String,
        progress: f32,
    },
    DragStarted {
        series_id: String,
    },
    DragFinished {
        series_id: String,
        dropped_on: Option<String>,
    },
    SyncChanged(SyncFlags),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StudyLoaded,
    StudyUnloaded,
    SeriesAssigned,
    Error,
    StateChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::StudyLoaded,
        EventKind::StudyUnloaded,
        EventKind::SeriesAssigned,
        EventKind::Error,
        EventKind::StateChanged,
    ];
}

impl ViewerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ViewerEvent::StudyLoaded { .. } => EventKind::StudyLoaded,
            ViewerEvent::StudyUnloaded { .. } => EventKind::StudyUnloaded,
            ViewerEvent::SeriesAssigned { .. } => EventKind::SeriesAssigned,
            ViewerEvent::Error { .. } => EventKind::Error,
            ViewerEvent::StateChanged(_) => EventKind::StateChanged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Rc<RefCell<dyn FnMut(&ViewerEvent)>>;

struct Subscriber {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    dispatching: bool,
    queued: VecDeque<ViewerEvent>,
}

/// Single-threaded publish/subscribe channel for session notifications.
///
/// Cloning yields another handle to the same subscriber list, which is how a
/// handler gets hold of the bus to unsubscribe itself.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl EventBus {
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl FnMut(&ViewerEvent) + 'static,
    ) -> SubscriptionId {
        self.insert(Some(kind), Rc::new(RefCell::new(handler)))
    }

    pub fn subscribe_all(&self, handler: impl FnMut(&ViewerEvent) + 'static) -> SubscriptionId {
        self.insert(None, Rc::new(RefCell::new(handler)))
    }

    fn insert(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id = inner.next_id.saturating_add(1);
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.push(Subscriber { id, kind, handler });
        id
    }

    /// Returns false if `id` was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|subscriber| subscriber.id != id);
        inner.subscribers.len() != before
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.inner
            .borrow()
            .subscribers
            .iter()
            .any(|subscriber| subscriber.id == id)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .borrow()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.kind.map_or(true, |k| k == kind))
            .count()
    }

    /// Delivers `event` to every matching subscriber and returns how many ran.
    ///
    /// Handlers may subscribe or unsubscribe while the event is in flight.
    /// Subscribers added during dispatch see the next event, removed ones are
    /// skipped if they have not run yet. An event published from inside a
    /// handler is queued and delivered to every subscriber once the current
    /// event is done; that inner call returns 0.
    pub fn publish(&self, event: &ViewerEvent) -> usize {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dispatching {
                inner.queued.push_back(event.clone());
                return 0;
            }
            inner.dispatching = true;
        }

        let delivered = self.dispatch(event);
        loop {
            let next = self.inner.borrow_mut().queued.pop_front();
            let Some(queued) = next else {
                break;
            };
            self.dispatch(&queued);
        }
        self.inner.borrow_mut().dispatching = false;
        delivered
    }

    fn dispatch(&self, event: &ViewerEvent) -> usize {
        let kind = event.kind();
        let targets = self
            .inner
            .borrow()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.kind.map_or(true, |k| k == kind))
            .map(|subscriber| (subscriber.id, Rc::clone(&subscriber.handler)))
            .collect::<Vec<_>>();

        let mut delivered = 0;
        for (id, handler) in targets {
            if !self.is_subscribed(id) {
                continue;
            }
            match handler.try_borrow_mut() {
                Ok(mut handler) => {
                    (*handler)(event);
                    delivered += 1;
                }
                Err(_) => log::warn!("Skipping re-entrant delivery of {kind:?} to {id:?}"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(message: &str) -> ViewerEvent {
        ViewerEvent::Error {
            message: message.to_string(),
        }
    }

    #[test]
    fn handlers_receive_only_their_kind() {
        let bus = EventBus::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.subscribe(EventKind::Error, move |event| {
            sink.borrow_mut().push(event.clone());
        });

        bus.publish(&ViewerEvent::StudyLoaded {
            study_id: "a".to_string(),
            series_count: 0,
            image_count: 0,
        });
        bus.publish(&error_event("boom"));

        assert_eq!(*seen.borrow(), vec![error_event("boom")]);
    }

    #[test]
    fn subscribe_all_sees_every_kind() {
        let bus = EventBus::default();
        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);
        bus.subscribe_all(move |_| *counter.borrow_mut() += 1);

        bus.publish(&error_event("x"));
        bus.publish(&ViewerEvent::StateChanged(StateChange::LayoutChanged {
            viewport_ids: vec![],
        }));
        assert_eq!(*count.borrow(), 2);
        for kind in EventKind::ALL {
            assert_eq!(bus.subscriber_count(kind), 1);
        }
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventKind::Error, |_| {});
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&error_event("x")), 0);
    }

    #[test]
    fn handler_can_unsubscribe_itself_during_dispatch() {
        let bus = EventBus::default();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let own_id = Rc::new(RefCell::new(None::<SubscriptionId>));
        let handle = bus.clone();
        let id_slot = Rc::clone(&own_id);
        let first_calls = Rc::clone(&calls);
        let id = bus.subscribe(EventKind::Error, move |_| {
            first_calls.borrow_mut().push("first");
            if let Some(id) = *id_slot.borrow() {
                handle.unsubscribe(id);
            }
        });
        *own_id.borrow_mut() = Some(id);

        let second_calls = Rc::clone(&calls);
        bus.subscribe(EventKind::Error, move |_| second_calls.borrow_mut().push("second"));

        assert_eq!(bus.publish(&error_event("one")), 2);
        assert_eq!(bus.publish(&error_event("two")), 1);
        assert_eq!(*calls.borrow(), vec!["first", "second", "second"]);
    }

    #[test]
    fn handler_removed_mid_dispatch_is_skipped() {
        let bus = EventBus::default();
        let calls = Rc::new(RefCell::new(0));

        let victim_slot = Rc::new(RefCell::new(None::<SubscriptionId>));
        let handle = bus.clone();
        let slot = Rc::clone(&victim_slot);
        bus.subscribe(EventKind::Error, move |_| {
            if let Some(id) = *slot.borrow() {
                handle.unsubscribe(id);
            }
        });
        let counter = Rc::clone(&calls);
        let victim = bus.subscribe(EventKind::Error, move |_| *counter.borrow_mut() += 1);
        *victim_slot.borrow_mut() = Some(victim);

        assert_eq!(bus.publish(&error_event("x")), 1);
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn nested_publish_reaches_every_subscriber_after_current_event() {
        let bus = EventBus::default();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let handle = bus.clone();
        let first = Rc::clone(&seen);
        bus.subscribe(EventKind::Error, move |event| {
            if let ViewerEvent::Error { message } = event {
                first.borrow_mut().push(format!("first:{message}"));
                if message == "outer" {
                    assert_eq!(handle.publish(&error_event("nested")), 0);
                }
            }
        });
        let second = Rc::clone(&seen);
        bus.subscribe(EventKind::Error, move |event| {
            if let ViewerEvent::Error { message } = event {
                second.borrow_mut().push(format!("second:{message}"));
            }
        });

        assert_eq!(bus.publish(&error_event("outer")), 2);
        assert_eq!(
            *seen.borrow(),
            vec![
                "first:outer",
                "second:outer",
                "first:nested",
                "second:nested"
            ]
        );
        assert_eq!(bus.publish(&error_event("later")), 2);
    }
}
