//! Frame dispatcher
//!
//! Pub/sub broker between the transport's read loop and device handlers.
//! Subscribing opens the shared connection, unsubscribing closes it when the
//! last consumer leaves. Frames that match no subscription are expected
//! shared-bus traffic and dropped silently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::Frame;
use crate::transport::BusTransport;

/// Receiver of dispatched frames.
///
/// Handlers are awaited one after another for every frame, so per-subscriber
/// delivery order equals socket order. Order across subscribers is
/// unspecified; handlers must be idempotent with respect to it.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, frame: &Frame);
}

/// Identity a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingKey {
    pub identify: u16,
    pub slave_id: u16,
}

/// How inbound frames are matched against a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Deliver frames whose identify equals the key's identify. Slave
    /// verification stays in the handler: some devices answer with the
    /// slave field byte-swapped.
    Device,
    /// Wall-switch banks observe the whole bus: deliver unless the frame's
    /// identify belongs to some other subscription *and* its slave belongs
    /// to some other subscription.
    Bank,
}

/// Handle returned by [`Dispatcher::subscribe`]; required to unsubscribe
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct Subscription {
    key: RoutingKey,
    mode: RoutingMode,
    handler: Arc<dyn FrameHandler>,
}

/// Pub/sub broker over the shared transport
pub struct Dispatcher {
    transport: BusTransport,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Dispatcher {
    pub fn new(transport: BusTransport) -> Self {
        Self {
            transport,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler under a unique id and open the shared connection.
    /// A duplicate id replaces the previous subscription with a warning.
    pub async fn subscribe(
        &self,
        id: impl Into<String>,
        key: RoutingKey,
        mode: RoutingMode,
        handler: Arc<dyn FrameHandler>,
    ) -> SubscriptionHandle {
        let id = id.into();
        let replaced = {
            let mut subs = self.subscriptions.lock().await;
            subs.insert(id.clone(), Subscription { key, mode, handler })
                .is_some()
        };
        if replaced {
            // The slot was already counted against the transport refcount
            warn!("subscription replaced: {}", id);
        } else {
            debug!("subscriber added: {}", id);
            self.transport.open().await;
        }
        SubscriptionHandle { id }
    }

    /// Remove a subscription and close the shared connection if it was the
    /// last one.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let removed = {
            let mut subs = self.subscriptions.lock().await;
            subs.remove(&handle.id)
        };
        if removed.is_none() {
            debug!("no subscriber: {}", handle.id);
            return;
        }
        debug!("subscriber removed: {}", handle.id);
        self.transport.close().await;
    }

    /// Number of live subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Deliver one frame to every matching subscription
    pub async fn dispatch(&self, frame: &Frame) {
        let targets: Vec<(String, Arc<dyn FrameHandler>)> = {
            let subs = self.subscriptions.lock().await;
            subs.iter()
                .filter(|(id, sub)| Self::matches(id, sub, frame, &subs))
                .map(|(id, sub)| (id.clone(), Arc::clone(&sub.handler)))
                .collect()
        };

        if targets.is_empty() {
            trace!(
                "unrouted frame: identify={} slave={}",
                frame.identify,
                frame.slave_id
            );
            return;
        }

        for (id, handler) in targets {
            trace!("frame -> {}", id);
            handler.on_frame(frame).await;
        }
    }

    fn matches(
        id: &str,
        sub: &Subscription,
        frame: &Frame,
        all: &HashMap<String, Subscription>,
    ) -> bool {
        match sub.mode {
            RoutingMode::Device => frame.identify == sub.key.identify,
            RoutingMode::Bank => {
                // Skip only traffic that clearly belongs to another device:
                // both the identify and the slave are claimed by other
                // subscriptions and neither is ours.
                let foreign_identify = frame.identify != sub.key.identify
                    && all
                        .iter()
                        .any(|(other, s)| other != id && s.key.identify == frame.identify);
                let foreign_slave = frame.slave_id != sub.key.slave_id
                    && all
                        .iter()
                        .any(|(other, s)| other != id && s.key.slave_id == frame.slave_id);
                !(foreign_identify && foreign_slave)
            },
        }
    }

    /// Consume the transport's frame channel until cancelled or the channel
    /// closes. Frames are handled strictly in arrival order.
    pub fn spawn(
        self: Arc<Self>,
        mut frames_rx: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames_rx.recv() => match frame {
                        Some(frame) => self.dispatch(&frame).await,
                        None => break,
                    },
                }
            }
            debug!("dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FC_READ_HOLDING;
    use crate::transport::BusTransportConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl FrameHandler for CountingHandler {
        async fn on_frame(&self, _frame: &Frame) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_dispatcher() -> Dispatcher {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = BusTransportConfig {
            host: "127.0.0.1".to_string(),
            port: 59998,
            connect_timeout: Duration::from_millis(100),
            initial_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(100),
        };
        // The receiver half is dropped: these tests never connect
        Dispatcher::new(BusTransport::new(config, tx).unwrap())
    }

    fn frame(identify: u16, slave_id: u16) -> Frame {
        Frame {
            identify,
            slave_id,
            function_code: FC_READ_HOLDING,
            payload: Bytes::from_static(&[0x00, 0x01]),
        }
    }

    fn handler() -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_live_count_tracks_subscriptions() {
        let dispatcher = test_dispatcher();
        let h = handler();

        let a = dispatcher
            .subscribe("a", RoutingKey { identify: 51, slave_id: 5 }, RoutingMode::Bank, h.clone())
            .await;
        let b = dispatcher
            .subscribe("b", RoutingKey { identify: 52, slave_id: 5 }, RoutingMode::Bank, h.clone())
            .await;
        assert_eq!(dispatcher.subscription_count().await, 2);
        assert_eq!(dispatcher.transport.subscriber_count().await, 2);

        dispatcher.unsubscribe(a).await;
        assert_eq!(dispatcher.transport.subscriber_count().await, 1);

        dispatcher.unsubscribe(b).await;
        assert_eq!(dispatcher.transport.subscriber_count().await, 0);
        assert!(!dispatcher.transport.is_connected());
    }

    #[tokio::test]
    async fn test_device_mode_matches_identify_only() {
        let dispatcher = test_dispatcher();
        let h = handler();
        let _sub = dispatcher
            .subscribe("curtain", RoutingKey { identify: 0x8C, slave_id: 2 }, RoutingMode::Device, h.clone())
            .await;

        dispatcher.dispatch(&frame(0x8C, 0x0200)).await;
        dispatcher.dispatch(&frame(51, 2)).await;
        assert_eq!(h.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bank_mode_excludes_foreign_traffic() {
        let dispatcher = test_dispatcher();
        let own = handler();
        let other = handler();

        let _a = dispatcher
            .subscribe("a", RoutingKey { identify: 51, slave_id: 5 }, RoutingMode::Bank, own.clone())
            .await;
        let _b = dispatcher
            .subscribe("b", RoutingKey { identify: 71, slave_id: 7 }, RoutingMode::Bank, other.clone())
            .await;

        // Clearly another device's traffic: skipped for "a", kept for "b"
        dispatcher.dispatch(&frame(71, 7)).await;
        assert_eq!(own.seen.load(Ordering::SeqCst), 0);
        assert_eq!(other.seen.load(Ordering::SeqCst), 1);

        // Unknown identify and slave: delivered everywhere, handlers filter
        dispatcher.dispatch(&frame(99, 9)).await;
        assert_eq!(own.seen.load(Ordering::SeqCst), 1);
        assert_eq!(other.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bank_mode_delivers_sibling_traffic() {
        let dispatcher = test_dispatcher();
        let one = handler();
        let two = handler();

        // Two buttons of the same bank share the slave
        let _a = dispatcher
            .subscribe("s5-1", RoutingKey { identify: 51, slave_id: 5 }, RoutingMode::Bank, one.clone())
            .await;
        let _b = dispatcher
            .subscribe("s5-2", RoutingKey { identify: 52, slave_id: 5 }, RoutingMode::Bank, two.clone())
            .await;

        // A reply correlated to button 2 must still reach button 1: the
        // slave is shared, so the traffic is not foreign
        dispatcher.dispatch(&frame(52, 5)).await;
        assert_eq!(one.seen.load(Ordering::SeqCst), 1);
        assert_eq!(two.seen.load(Ordering::SeqCst), 1);
    }
}
