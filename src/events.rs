//! In-process event dispatcher
//!
//! Components publish typed [`Event`]s; subscribers declare at registration
//! which [`Topic`]s they handle. Delivery is sequential in subscription
//! order. A failing handler is logged and skipped, the remaining handlers
//! still run.
//!
//! Handlers may answer with follow-up events. Those are queued and delivered
//! after the current event has reached every subscriber, which lets a handler
//! trigger further work without holding a handle to the dispatcher itself.

use crate::records::{BlockRecord, Key, TransactionRecord};
use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event categories subscribers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Registration,
    Block,
    Transaction,
    Webhook,
    RenewalDue,
    Alert,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Registration => "registration",
            Self::Block => "block",
            Self::Transaction => "transaction",
            Self::Webhook => "webhook",
            Self::RenewalDue => "renewal_due",
            Self::Alert => "alert",
        };
        f.write_str(name)
    }
}

/// Payload of each topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An address was added to the registry.
    Registration { address: Address },
    /// A block was persisted.
    Block { block: BlockRecord },
    /// A relevant transaction was persisted, or re-observed by a backfill.
    Transaction {
        transaction: TransactionRecord,
        backfill: bool,
    },
    /// A webhook delivery passed signature verification.
    Webhook { payload: Value },
    /// A key is within its renewal window.
    RenewalDue { key: Key },
    /// A network loop kept failing.
    Alert {
        network: u64,
        consecutive_failures: u32,
        reason: String,
    },
}

impl Event {
    /// Topic of this event.
    pub fn topic(&self) -> Topic {
        match self {
            Self::Registration { .. } => Topic::Registration,
            Self::Block { .. } => Topic::Block,
            Self::Transaction { .. } => Topic::Transaction,
            Self::Webhook { .. } => Topic::Webhook,
            Self::RenewalDue { .. } => Topic::RenewalDue,
            Self::Alert { .. } => Topic::Alert,
        }
    }
}

/// A subscriber of the dispatcher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    /// Whether this handler wants events of `topic`.
    fn handles(&self, topic: Topic) -> bool;

    /// Handle an event, optionally returning follow-up events.
    async fn handle(&self, event: &Event) -> Result<Vec<Event>>;
}

/// Outcome of a single [`EventDispatcher::emit`] call, follow-ups included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Events delivered (the emitted event plus follow-ups).
    pub events: usize,
    /// Successful handler invocations.
    pub delivered: usize,
    /// Handler invocations that returned an error.
    pub failed: usize,
}

/// Single-process publish/subscribe hub.
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    /// Start registering subscribers.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Deliver `event` to every subscriber of its topic, then deliver the
    /// follow-up events they produced.
    pub async fn emit(&self, event: Event) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            report.events += 1;
            let topic = event.topic();
            for handler in self.handlers.iter().filter(|h| h.handles(topic)) {
                match handler.handle(&event).await {
                    Ok(follow_ups) => {
                        report.delivered += 1;
                        queue.extend(follow_ups);
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            handler = handler.name(),
                            %topic,
                            "event handler failed: {:#}",
                            e
                        );
                    }
                }
            }
            debug!(%topic, "event dispatched");
        }

        report
    }
}

/// Collects subscribers before the dispatcher is shared.
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl DispatcherBuilder {
    /// Register a subscriber. Delivery follows registration order.
    pub fn subscribe(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Freeze the subscriber list.
    pub fn build(self) -> EventDispatcher {
        EventDispatcher {
            handlers: self.handlers,
        }
    }
}

/// Logs every event it receives at debug level, and alerts at error level.
pub struct EventLogger;

#[async_trait]
impl EventHandler for EventLogger {
    fn name(&self) -> &'static str {
        "event-logger"
    }

    fn handles(&self, _topic: Topic) -> bool {
        true
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        match event {
            Event::Alert {
                network,
                consecutive_failures,
                reason,
            } => tracing::error!(
                network,
                consecutive_failures,
                "ALERT: network loop failing: {}",
                reason
            ),
            Event::Transaction {
                transaction,
                backfill,
            } => debug!(
                network = transaction.network,
                block = transaction.block_number,
                backfill,
                "transaction 0x{:x}",
                transaction.hash
            ),
            other => debug!(topic = %other.topic(), "event"),
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every event of the topics it subscribes to.
    pub(crate) struct Recorder {
        topics: Vec<Topic>,
        pub(crate) seen: Mutex<Vec<Event>>,
    }

    impl Recorder {
        pub(crate) fn new(topics: &[Topic]) -> Arc<Self> {
            Arc::new(Self {
                topics: topics.to_vec(),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn events(&self) -> Vec<Event> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn handles(&self, topic: Topic) -> bool {
            self.topics.contains(&topic)
        }

        async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;
    use alloy_primitives::address;
    use serde_json::json;

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn handles(&self, _topic: Topic) -> bool {
            true
        }

        async fn handle(&self, _event: &Event) -> Result<Vec<Event>> {
            anyhow::bail!("boom")
        }
    }

    /// Turns every webhook into a registration follow-up.
    struct Chaining;

    #[async_trait]
    impl EventHandler for Chaining {
        fn name(&self) -> &'static str {
            "chaining"
        }

        fn handles(&self, topic: Topic) -> bool {
            topic == Topic::Webhook
        }

        async fn handle(&self, _event: &Event) -> Result<Vec<Event>> {
            Ok(vec![Event::Registration {
                address: address!("0000000000000000000000000000000000000abc"),
            }])
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let recorder = Recorder::new(&[Topic::Registration]);
        let dispatcher = EventDispatcher::builder()
            .subscribe(Arc::new(Failing))
            .subscribe(recorder.clone())
            .build();

        let report = dispatcher
            .emit(Event::Registration {
                address: Address::ZERO,
            })
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let recorder = Recorder::new(&[Topic::Alert]);
        let dispatcher = EventDispatcher::builder().subscribe(recorder.clone()).build();

        dispatcher
            .emit(Event::Registration {
                address: Address::ZERO,
            })
            .await;
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_follow_up_events_are_delivered() {
        let recorder = Recorder::new(&[Topic::Webhook, Topic::Registration]);
        let dispatcher = EventDispatcher::builder()
            .subscribe(Arc::new(Chaining))
            .subscribe(recorder.clone())
            .build();

        let report = dispatcher
            .emit(Event::Webhook {
                payload: json!({}),
            })
            .await;

        assert_eq!(report.events, 2);
        let topics: Vec<Topic> = recorder.events().iter().map(Event::topic).collect();
        assert_eq!(topics, vec![Topic::Webhook, Topic::Registration]);
    }
}
