//! Inbound event dispatch.
//!
//! Two registration paths feed the same dispatch: a handler table with one
//! handler per event kind, merged by [`EventRouter::set_handlers`], and
//! fan-out subscribers added with [`EventRouter::subscribe`]. For each event
//! the table handler runs first, then subscribers in subscription order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fitchat_shared::{
    ChatEvent, ChatEventKind, ChatMessage, PresenceEvent, ReadReceipt, TypingSignal,
};
use serde_json::Value;

/// Handler for one decoded event. Errors and panics are logged, never
/// propagated.
pub type EventHandler = Arc<dyn Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync>;

/// One handler per event kind; absent entries leave the current handler
/// untouched when merged.
#[derive(Clone, Default)]
pub struct ChatEventHandlers {
    handlers: HashMap<ChatEventKind, EventHandler>,
}

impl std::fmt::Debug for ChatEventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl ChatEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_receive_message<F>(self, handler: F) -> Self
    where
        F: Fn(&ChatMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(ChatEventKind::ReceiveMessage, move |event| match event {
            ChatEvent::ReceiveMessage(message) => handler(message),
            _ => Ok(()),
        })
    }

    pub fn on_user_online<F>(self, handler: F) -> Self
    where
        F: Fn(&PresenceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(ChatEventKind::UserOnline, move |event| match event {
            ChatEvent::UserOnline(presence) => handler(presence),
            _ => Ok(()),
        })
    }

    pub fn on_user_offline<F>(self, handler: F) -> Self
    where
        F: Fn(&PresenceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(ChatEventKind::UserOffline, move |event| match event {
            ChatEvent::UserOffline(presence) => handler(presence),
            _ => Ok(()),
        })
    }

    pub fn on_user_typing<F>(self, handler: F) -> Self
    where
        F: Fn(&TypingSignal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(ChatEventKind::UserTyping, move |event| match event {
            ChatEvent::UserTyping(signal) => handler(signal),
            _ => Ok(()),
        })
    }

    pub fn on_user_stopped_typing<F>(self, handler: F) -> Self
    where
        F: Fn(&TypingSignal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(ChatEventKind::UserStoppedTyping, move |event| match event {
            ChatEvent::UserStoppedTyping(signal) => handler(signal),
            _ => Ok(()),
        })
    }

    pub fn on_messages_read<F>(self, handler: F) -> Self
    where
        F: Fn(&ReadReceipt) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(ChatEventKind::MessagesRead, move |event| match event {
            ChatEvent::MessagesRead(receipt) => handler(receipt),
            _ => Ok(()),
        })
    }

    /// Untyped registration for `kind`.
    pub fn with<F>(mut self, kind: ChatEventKind, handler: F) -> Self
    where
        F: Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChatEventKind> + '_ {
        self.handlers.keys().copied()
    }
}

/// Token returned by [`EventRouter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: ChatEventKind,
}

impl Subscription {
    pub fn kind(&self) -> ChatEventKind {
        self.kind
    }
}

#[derive(Default)]
struct Registry {
    table: HashMap<ChatEventKind, EventHandler>,
    subscribers: Vec<(Subscription, EventHandler)>,
}

/// Routes decoded events to registered handlers.
#[derive(Default)]
pub struct EventRouter {
    registry: RwLock<Registry>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.read();
        f.debug_struct("EventRouter")
            .field("table", &registry.table.keys().collect::<Vec<_>>())
            .field("subscribers", &registry.subscribers.len())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `handlers` into the table.
    pub fn set_handlers(&self, handlers: ChatEventHandlers) {
        let mut registry = self.write();
        for (kind, handler) in handlers.handlers {
            registry.table.insert(kind, handler);
        }
    }

    pub fn has_handler(&self, kind: ChatEventKind) -> bool {
        self.read().table.contains_key(&kind)
    }

    pub fn subscribe<F>(&self, kind: ChatEventKind, handler: F) -> Subscription
    where
        F: Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = Subscription {
            id: self.next_subscription.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        self.write()
            .subscribers
            .push((subscription, Arc::new(handler)));
        subscription
    }

    /// Remove one subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut registry = self.write();
        let before = registry.subscribers.len();
        registry
            .subscribers
            .retain(|(existing, _)| *existing != subscription);
        registry.subscribers.len() != before
    }

    /// Deliver `event` to every handler for its kind. Returns how many
    /// handlers completed successfully.
    pub fn dispatch(&self, event: &ChatEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may register or unsubscribe while running.
        let handlers: Vec<EventHandler> = {
            let registry = self.read();
            registry
                .table
                .get(&kind)
                .cloned()
                .into_iter()
                .chain(
                    registry
                        .subscribers
                        .iter()
                        .filter(|(subscription, _)| subscription.kind == kind)
                        .map(|(_, handler)| handler.clone()),
                )
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => crate::log_error!("{} handler failed: {:#}", kind, e),
                Err(_) => crate::log_error!("{} handler panicked", kind),
            }
        }
        delivered
    }

    /// Decode a `push` frame and dispatch it. Unknown and malformed events
    /// are dropped.
    pub fn dispatch_push(&self, target: &str, arguments: &[Value]) -> usize {
        match ChatEvent::from_push(target, arguments) {
            Ok(event) => self.dispatch(&event),
            Err(e) if e.is_unknown_target() => {
                crate::log_debug!("ignoring unknown event '{}'", target);
                0
            }
            Err(e) => {
                crate::log_warn!("dropping malformed '{}' event: {}", target, e);
                0
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fitchat_shared::{MessageType, ParticipantRole};
    use std::sync::Mutex;

    fn message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation_id: "conv-42".to_string(),
            sender_id: "advisor-1".to_string(),
            sender_role: ParticipantRole::Advisor,
            content: "hello".to_string(),
            message_type: MessageType::Text,
            attachment_url: None,
            created_at: Utc::now(),
            is_read: false,
        }
    }

    fn typing(user: &str) -> ChatEvent {
        ChatEvent::UserTyping(TypingSignal {
            conversation_id: "conv-42".to_string(),
            user_id: user.to_string(),
            user_name: None,
        })
    }

    #[test]
    fn merge_keeps_handlers_for_absent_entries() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        router.set_handlers(ChatEventHandlers::new().on_receive_message(move |m| {
            sink.lock().expect("lock").push(format!("message:{}", m.id));
            Ok(())
        }));
        let sink = seen.clone();
        router.set_handlers(ChatEventHandlers::new().on_user_typing(move |t| {
            sink.lock().expect("lock").push(format!("typing:{}", t.user_id));
            Ok(())
        }));

        router.dispatch(&ChatEvent::ReceiveMessage(message("m1")));
        router.dispatch(&typing("u1"));
        assert_eq!(
            seen.lock().expect("lock").as_slice(),
            &["message:m1".to_string(), "typing:u1".to_string()]
        );
    }

    #[test]
    fn present_entry_replaces_previous_handler() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        router.set_handlers(ChatEventHandlers::new().on_user_typing(move |_| {
            sink.lock().expect("lock").push("first");
            Ok(())
        }));
        let sink = seen.clone();
        router.set_handlers(ChatEventHandlers::new().on_user_typing(move |_| {
            sink.lock().expect("lock").push("second");
            Ok(())
        }));

        assert_eq!(router.dispatch(&typing("u1")), 1);
        assert_eq!(seen.lock().expect("lock").as_slice(), &["second"]);
    }

    #[test]
    fn failing_handler_keeps_receiving_later_events() {
        let router = EventRouter::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let sink = calls.clone();
        router.set_handlers(ChatEventHandlers::new().on_receive_message(move |m| {
            sink.lock().expect("lock").push(m.id.clone());
            if m.id == "m1" {
                anyhow::bail!("render failed");
            }
            Ok(())
        }));

        assert_eq!(router.dispatch(&ChatEvent::ReceiveMessage(message("m1"))), 0);
        assert_eq!(router.dispatch(&ChatEvent::ReceiveMessage(message("m2"))), 1);
        assert_eq!(
            calls.lock().expect("lock").as_slice(),
            &["m1".to_string(), "m2".to_string()]
        );
    }

    #[test]
    fn panicking_subscriber_does_not_stop_the_rest() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicU64::new(0));

        router.subscribe(ChatEventKind::UserTyping, |_| panic!("subscriber bug"));
        let counter = hits.clone();
        router.subscribe(ChatEventKind::UserTyping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(router.dispatch(&typing("u1")), 1);
        assert_eq!(router.dispatch(&typing("u2")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn table_handler_runs_before_subscribers_in_order() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink = order.clone();
        router.subscribe(ChatEventKind::UserTyping, move |_| {
            sink.lock().expect("lock").push("sub-1");
            Ok(())
        });
        let sink = order.clone();
        router.subscribe(ChatEventKind::UserTyping, move |_| {
            sink.lock().expect("lock").push("sub-2");
            Ok(())
        });
        let sink = order.clone();
        router.set_handlers(ChatEventHandlers::new().on_user_typing(move |_| {
            sink.lock().expect("lock").push("table");
            Ok(())
        }));

        router.dispatch(&typing("u1"));
        assert_eq!(
            order.lock().expect("lock").as_slice(),
            &["table", "sub-1", "sub-2"]
        );
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let router = EventRouter::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let sink = hits.clone();
        let first = router.subscribe(ChatEventKind::MessagesRead, move |_| {
            sink.lock().expect("lock").push("first");
            Ok(())
        });
        let sink = hits.clone();
        router.subscribe(ChatEventKind::MessagesRead, move |_| {
            sink.lock().expect("lock").push("second");
            Ok(())
        });

        assert!(router.unsubscribe(first));
        assert!(!router.unsubscribe(first));

        router.dispatch(&ChatEvent::MessagesRead(ReadReceipt {
            conversation_id: "conv-42".to_string(),
            user_id: "u1".to_string(),
        }));
        assert_eq!(hits.lock().expect("lock").as_slice(), &["second"]);
    }

    #[test]
    fn dispatch_push_drops_unknown_and_malformed_events() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        router.subscribe(ChatEventKind::UserOffline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(router.dispatch_push("SomethingNew", &[]), 0);
        assert_eq!(router.dispatch_push("UserOffline", &[Value::from(7)]), 0);
        assert_eq!(router.dispatch_push("UserOffline", &[Value::from("u1")]), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
