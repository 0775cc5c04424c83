//! Event bus over an open data channel.
//!
//! Inbound frames are decoded into [`ServerEvent`]s and handed synchronously
//! to the handlers subscribed to that event kind, in subscription order.
//! Outbound control messages are serialized and queued on the channel.
//!
//! Dispatch iterates over a snapshot of the subscriber list:
//! - a handler removed during dispatch is skipped if it has not run yet,
//! - a handler added during dispatch first sees the next event,
//! - every other handler runs exactly once.
//!
//! Once [`EventBus::close`] has been called nothing is dispatched or sent.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::base::{RealtimeError, RealtimeResult};
use super::messages::{ClientEvent, ConversationItem, ServerEvent, ServerEventKind, SessionUpdate};

/// Handler invoked for each matching inbound event.
pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Returned by [`EventBus::on`]; pass to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
    active: Arc<AtomicBool>,
}

struct BusInner {
    subscribers: RwLock<HashMap<ServerEventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle; all clones share subscribers and the channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus writing outbound frames to `outbound`.
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                outbound,
                closed: AtomicBool::new(false),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub fn on<F>(&self, kind: ServerEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber {
            id,
            handler: Arc::new(handler),
            active: Arc::new(AtomicBool::new(true)),
        };
        self.inner
            .subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(subscriber);
        trace!(event = %kind, ?id, "Subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                let removed = list.remove(pos);
                removed.active.store(false, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().values().map(Vec::len).sum()
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Decode one inbound text frame and dispatch it.
    pub fn dispatch_raw(&self, text: &str) -> RealtimeResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let event: ServerEvent = serde_json::from_str(text)?;
        self.dispatch(&event);
        Ok(())
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        if self.is_closed() {
            return 0;
        }
        let Some(kind) = event.kind() else {
            trace!("Ignoring unmodelled event");
            return 0;
        };

        let snapshot: Vec<Subscriber> = match self.inner.subscribers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut invoked = 0;
        for subscriber in snapshot {
            if self.is_closed() {
                break;
            }
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            (subscriber.handler)(event);
            invoked += 1;
        }
        invoked
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    pub fn send(&self, event: &ClientEvent) -> RealtimeResult<()> {
        if self.is_closed() {
            return Err(RealtimeError::NotConnected);
        }
        let text = serde_json::to_string(event)?;
        self.inner
            .outbound
            .send(text)
            .map_err(|_| RealtimeError::Channel("Data channel is closed".to_string()))
    }

    /// Update the remote session; also used to (re)register tools.
    pub fn update_session(&self, session: SessionUpdate) -> RealtimeResult<()> {
        self.send(&ClientEvent::SessionUpdate { session })
    }

    /// Ask the model to produce a response.
    pub fn create_response(&self) -> RealtimeResult<()> {
        self.send(&ClientEvent::ResponseCreate)
    }

    pub fn cancel_response(&self) -> RealtimeResult<()> {
        self.send(&ClientEvent::ResponseCancel)
    }

    /// Answer the function call identified by `call_id`.
    ///
    /// `result` is JSON-encoded into the item's `output` string.
    pub fn send_function_call_output(&self, call_id: &str, result: &Value) -> RealtimeResult<()> {
        let output = serde_json::to_string(result)?;
        debug!(call_id, "Sending function call output");
        self.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_call_output(call_id, output),
        })
    }

    /// Add a user text message to the conversation.
    pub fn send_text(&self, text: &str) -> RealtimeResult<()> {
        self.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Stop all dispatch and sends and drop every subscriber.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut subscribers = self.inner.subscribers.write();
        for list in subscribers.values() {
            for subscriber in list {
                subscriber.active.store(false, Ordering::SeqCst);
            }
        }
        subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn bus() -> (EventBus, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus::new(tx), rx)
    }

    fn speech_started() -> ServerEvent {
        ServerEvent::SpeechStarted {
            audio_start_ms: 0,
            item_id: "item".to_string(),
        }
    }

    fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let (bus, _rx) = bus();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=3 {
            let calls = calls.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| calls.lock().push(n));
        }
        let other = calls.clone();
        bus.on(ServerEventKind::SpeechStopped, move |_| other.lock().push(99));

        assert_eq!(bus.dispatch(&speech_started()), 3);
        assert_eq!(*calls.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_off_during_dispatch_skips_removed_handler_only() {
        let (bus, _rx) = bus();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let third_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        {
            let calls = calls.clone();
            let bus_handle = bus.clone();
            let third_id = third_id.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| {
                calls.lock().push(1);
                if let Some(id) = third_id.lock().take() {
                    bus_handle.off(id);
                }
            });
        }
        {
            let calls = calls.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| calls.lock().push(2));
        }
        {
            let calls = calls.clone();
            let id = bus.on(ServerEventKind::SpeechStarted, move |_| calls.lock().push(3));
            *third_id.lock() = Some(id);
        }
        {
            let calls = calls.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| calls.lock().push(4));
        }

        bus.dispatch(&speech_started());
        assert_eq!(*calls.lock(), vec![1, 2, 4]);

        calls.lock().clear();
        bus.dispatch(&speech_started());
        assert_eq!(*calls.lock(), vec![1, 2, 4]);
    }

    #[test]
    fn test_handler_unsubscribing_itself() {
        let (bus, _rx) = bus();
        let count = Arc::new(Mutex::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let id = {
            let count = count.clone();
            let bus_handle = bus.clone();
            let own_id = own_id.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| {
                *count.lock() += 1;
                if let Some(id) = *own_id.lock() {
                    bus_handle.off(id);
                }
            })
        };
        *own_id.lock() = Some(id);

        bus.dispatch(&speech_started());
        bus.dispatch(&speech_started());
        assert_eq!(*count.lock(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_added_during_dispatch_runs_from_next_event() {
        let (bus, _rx) = bus();
        let late_calls = Arc::new(Mutex::new(0));

        {
            let bus_handle = bus.clone();
            let late_calls = late_calls.clone();
            let added = Arc::new(AtomicBool::new(false));
            bus.on(ServerEventKind::SpeechStarted, move |_| {
                if !added.swap(true, Ordering::SeqCst) {
                    let late_calls = late_calls.clone();
                    bus_handle.on(ServerEventKind::SpeechStarted, move |_| {
                        *late_calls.lock() += 1;
                    });
                }
            });
        }

        bus.dispatch(&speech_started());
        assert_eq!(*late_calls.lock(), 0);
        bus.dispatch(&speech_started());
        assert_eq!(*late_calls.lock(), 1);
    }

    #[test]
    fn test_off_unknown_subscription() {
        let (bus, _rx) = bus();
        let id = bus.on(ServerEventKind::ResponseDone, |_| {});
        assert!(bus.off(id));
        assert!(!bus.off(id));
    }

    #[test]
    fn test_dispatch_raw_decodes_and_routes() {
        let (bus, _rx) = bus();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            bus.on(ServerEventKind::ResponseDone, move |event| {
                if let ServerEvent::ResponseDone { response } = event {
                    *seen.lock() = Some(response.id.clone());
                }
            });
        }

        bus.dispatch_raw(r#"{"type":"response.done","response":{"id":"resp_9","output":[]}}"#)
            .unwrap();
        assert_eq!(seen.lock().as_deref(), Some("resp_9"));

        // Unknown types are ignored, malformed frames are reported
        bus.dispatch_raw(r#"{"type":"rate_limits.updated"}"#).unwrap();
        assert!(matches!(
            bus.dispatch_raw("not json"),
            Err(RealtimeError::Serialization(_))
        ));
    }

    #[test]
    fn test_outbound_messages() {
        let (bus, mut rx) = bus();

        bus.send_function_call_output("abc", &json!({"topic": "x"}))
            .unwrap();
        bus.create_response().unwrap();
        bus.send_text("hello").unwrap();
        bus.cancel_response().unwrap();

        let output = recv_json(&mut rx);
        assert_eq!(output["type"], "conversation.item.create");
        assert_eq!(output["item"]["call_id"], "abc");
        let decoded: Value =
            serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, json!({"topic": "x"}));

        assert_eq!(recv_json(&mut rx)["type"], "response.create");

        let text = recv_json(&mut rx);
        assert_eq!(text["item"]["role"], "user");
        assert_eq!(text["item"]["content"][0]["text"], "hello");

        assert_eq!(recv_json(&mut rx)["type"], "response.cancel");
    }

    #[test]
    fn test_closed_bus_neither_dispatches_nor_sends() {
        let (bus, mut rx) = bus();
        let count = Arc::new(Mutex::new(0));
        {
            let count = count.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| *count.lock() += 1);
        }

        bus.close();

        assert_eq!(bus.dispatch(&speech_started()), 0);
        bus.dispatch_raw(r#"{"type":"input_audio_buffer.speech_started"}"#)
            .unwrap();
        assert_eq!(*count.lock(), 0);
        assert_eq!(bus.create_response(), Err(RealtimeError::NotConnected));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_close_during_dispatch_stops_remaining_handlers() {
        let (bus, _rx) = bus();
        let calls = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            let bus_handle = bus.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| {
                calls.lock().push(1);
                bus_handle.close();
            });
        }
        {
            let calls = calls.clone();
            bus.on(ServerEventKind::SpeechStarted, move |_| calls.lock().push(2));
        }

        bus.dispatch(&speech_started());
        assert_eq!(*calls.lock(), vec![1]);
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (bus, rx) = bus();
        drop(rx);
        assert!(matches!(
            bus.create_response(),
            Err(RealtimeError::Channel(_))
        ));
    }
}
