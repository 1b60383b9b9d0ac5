//! Callback dispatch.
//!
//! Unsolicited packets and connection events are queued and delivered to
//! registered handlers on a dedicated worker thread, so a slow handler
//! never stalls the read loop. Handlers are looked up when an event is
//! processed: once [`Dispatcher::unregister`] returns, no new invocation
//! starts, while one already running is allowed to finish.

use std::collections::HashMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::thread;

use brickwire_protocol::{EnumerateEvent, Packet, Uid, function};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::connection::{ConnectReason, DisconnectReason};

/// A registered callback.
pub type CallbackHandler = Arc<dyn Fn(&CallbackEvent) + Send + Sync>;

/// Who a callback listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackScope {
    /// Local connection events.
    Connection,
    /// One device.
    Device(u32),
    /// Every device.
    AnyDevice,
}

/// Registration key: scope plus function ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    pub scope: CallbackScope,
    pub function_id: u8,
}

impl CallbackKey {
    /// Fired after a connection is established.
    pub fn connected() -> Self {
        Self {
            scope: CallbackScope::Connection,
            function_id: function::CALLBACK_CONNECTED,
        }
    }

    /// Fired after a connection is closed.
    pub fn disconnected() -> Self {
        Self {
            scope: CallbackScope::Connection,
            function_id: function::CALLBACK_DISCONNECTED,
        }
    }

    /// Fired for every enumerate callback.
    pub fn enumerate() -> Self {
        Self::any_device(function::CALLBACK_ENUMERATE)
    }

    /// A callback of one device.
    pub fn device(uid: u32, function_id: u8) -> Self {
        Self {
            scope: CallbackScope::Device(uid),
            function_id,
        }
    }

    /// A callback of any device.
    pub fn any_device(function_id: u8) -> Self {
        Self {
            scope: CallbackScope::AnyDevice,
            function_id,
        }
    }
}

/// Event delivered to handlers.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    Connected(ConnectReason),
    Disconnected(DisconnectReason),
    Enumerate(EnumerateEvent),
    /// Raw device callback; the payload layout depends on the function ID.
    Device(Packet),
}

impl CallbackEvent {
    fn keys(&self) -> Vec<CallbackKey> {
        match self {
            Self::Connected(_) => vec![CallbackKey::connected()],
            Self::Disconnected(_) => vec![CallbackKey::disconnected()],
            Self::Enumerate(_) => vec![CallbackKey::enumerate()],
            Self::Device(packet) => vec![
                CallbackKey::device(packet.uid(), packet.function_id()),
                CallbackKey::any_device(packet.function_id()),
            ],
        }
    }
}

enum DispatchItem {
    Event(CallbackEvent),
    Flush(oneshot::Sender<()>),
}

type HandlerTable = Arc<RwLock<HashMap<CallbackKey, CallbackHandler>>>;

/// Queue plus worker thread delivering [`CallbackEvent`]s.
pub struct Dispatcher {
    handlers: HandlerTable,
    queue: mpsc::UnboundedSender<DispatchItem>,
}

impl Dispatcher {
    /// Starts the worker thread.
    ///
    /// The thread exits once the dispatcher is dropped and the queue drains.
    pub fn new() -> io::Result<Self> {
        let handlers: HandlerTable = Arc::default();
        let (queue, items) = mpsc::unbounded_channel();

        let table = handlers.clone();
        thread::Builder::new()
            .name("brickwire-callbacks".to_string())
            .spawn(move || worker(items, table))?;

        Ok(Self { handlers, queue })
    }

    /// Registers a handler, replacing any previous one for the same key.
    pub fn register<F>(&self, key: CallbackKey, handler: F)
    where
        F: Fn(&CallbackEvent) + Send + Sync + 'static,
    {
        self.write().insert(key, Arc::new(handler));
    }

    /// Removes the handler for `key`. Returns whether one was registered.
    pub fn unregister(&self, key: CallbackKey) -> bool {
        self.write().remove(&key).is_some()
    }

    /// Returns whether a handler is registered for `key`.
    pub fn is_registered(&self, key: CallbackKey) -> bool {
        self.read().contains_key(&key)
    }

    /// Queues an event for delivery.
    pub fn dispatch(&self, event: CallbackEvent) {
        if self.queue.send(DispatchItem::Event(event)).is_err() {
            warn!("callback worker is gone, dropping event");
        }
    }

    /// Waits until every event queued before this call was handled.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(DispatchItem::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<CallbackKey, CallbackHandler>> {
        self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<CallbackKey, CallbackHandler>> {
        self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn worker(mut items: mpsc::UnboundedReceiver<DispatchItem>, handlers: HandlerTable) {
    while let Some(item) = items.blocking_recv() {
        match item {
            DispatchItem::Event(event) => deliver(&event, &handlers),
            DispatchItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("callback worker stopped");
}

fn deliver(event: &CallbackEvent, handlers: &HandlerTable) {
    for key in event.keys() {
        let handler = handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned();

        let Some(handler) = handler else {
            continue;
        };

        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            match key.scope {
                CallbackScope::Device(uid) => error!(
                    uid = %Uid::new(uid),
                    function_id = key.function_id,
                    "callback handler panicked"
                ),
                _ => error!(function_id = key.function_id, "callback handler panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use super::*;

    fn device_packet(uid: u32, function_id: u8) -> Packet {
        Packet::new(uid, function_id, 0, false, vec![1, 2]).unwrap()
    }

    fn counter(dispatcher: &Dispatcher, key: CallbackKey) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        dispatcher.register(key, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn unregistered_handler_is_not_invoked() {
        let dispatcher = Dispatcher::new().unwrap();
        let key = CallbackKey::device(7, 4);
        let count = counter(&dispatcher, key);

        dispatcher.dispatch(CallbackEvent::Device(device_packet(7, 4)));
        dispatcher.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(dispatcher.unregister(key));
        dispatcher.dispatch(CallbackEvent::Device(device_packet(7, 4)));
        dispatcher.dispatch(CallbackEvent::Device(device_packet(7, 4)));
        dispatcher.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.unregister(key));
    }

    #[tokio::test]
    async fn routes_by_device_and_function() {
        let dispatcher = Dispatcher::new().unwrap();
        let own = counter(&dispatcher, CallbackKey::device(7, 4));
        let other = counter(&dispatcher, CallbackKey::device(8, 4));
        let any = counter(&dispatcher, CallbackKey::any_device(4));

        dispatcher.dispatch(CallbackEvent::Device(device_packet(7, 4)));
        dispatcher.dispatch(CallbackEvent::Device(device_packet(7, 5)));
        dispatcher.flush().await;

        assert_eq!(own.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert_eq!(any.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_events_do_not_collide_with_device_callbacks() {
        let dispatcher = Dispatcher::new().unwrap();
        let connected = counter(&dispatcher, CallbackKey::connected());
        let device = counter(&dispatcher, CallbackKey::any_device(function::CALLBACK_CONNECTED));

        dispatcher.dispatch(CallbackEvent::Connected(ConnectReason::Request));
        dispatcher.flush().await;

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(device.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let dispatcher = Dispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        dispatcher.register(CallbackKey::any_device(9), move |event| {
            if let CallbackEvent::Device(packet) = event {
                log.lock().unwrap().push(packet.uid());
            }
        });

        for uid in 1..=5 {
            dispatcher.dispatch(CallbackEvent::Device(device_packet(uid, 9)));
        }
        dispatcher.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_worker() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.register(CallbackKey::device(1, 1), |_| panic!("handler bug"));
        let count = counter(&dispatcher, CallbackKey::device(2, 1));

        dispatcher.dispatch(CallbackEvent::Device(device_packet(1, 1)));
        dispatcher.dispatch(CallbackEvent::Device(device_packet(2, 1)));
        dispatcher.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_invocation_completes_after_unregister() {
        let dispatcher = Dispatcher::new().unwrap();
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        let key = CallbackKey::device(3, 4);
        dispatcher.register(key, move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            done.fetch_add(1, Ordering::SeqCst);
        });

        // dispatch returns while the handler is still blocked
        dispatcher.dispatch(CallbackEvent::Device(device_packet(3, 4)));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        dispatcher.unregister(key);
        dispatcher.dispatch(CallbackEvent::Device(device_packet(3, 4)));
        release_tx.send(()).unwrap();
        dispatcher.flush().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
