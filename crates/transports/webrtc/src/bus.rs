//! Messaging-bus seam
//!
//! The bridge only needs typed per-topic publish/subscribe. [`LocalBus`] is
//! the in-process implementation used when no external bus is attached.

use crate::config::Mode;
use crate::msgs::BusMessage;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default per-topic queue depth
pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

/// Typed per-topic publish/subscribe
pub trait MessageBus: Send + Sync {
    /// Receive messages of `type_name` published on `topic`
    fn subscribe(&self, topic: &str, type_name: &str) -> Result<mpsc::Receiver<BusMessage>>;

    /// Publish `msg` on `topic`. Publishing with no subscribers is not an error.
    fn publish(&self, topic: &str, msg: BusMessage) -> Result<()>;
}

/// In-process bus on `tokio::sync::broadcast`
///
/// Each subscription gets a forwarding task that filters by type, so
/// `subscribe` must be called from within a tokio runtime.
pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl MessageBus for LocalBus {
    fn subscribe(&self, topic: &str, type_name: &str) -> Result<mpsc::Receiver<BusMessage>> {
        if topic.is_empty() {
            return Err(Error::InvalidConfig("cannot subscribe to empty topic".to_string()));
        }

        let mut source = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);
        let topic = topic.to_string();
        let type_name = type_name.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if msg.type_name() != type_name {
                            debug!(
                                topic = %topic,
                                msg_type = msg.type_name(),
                                "Dropping message of unexpected type"
                            );
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic, skipped = n, "Subscriber lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(topic = %topic, "Subscription closed");
        });

        Ok(rx)
    }

    fn publish(&self, topic: &str, msg: BusMessage) -> Result<()> {
        // A send error only means nobody is listening yet
        let _ = self.sender(topic).send(msg);
        Ok(())
    }
}

/// Bus node name for a bridged topic
pub fn node_name(mode: Mode, type_name: &str, name_out: &str) -> String {
    format!("webrtc_ros_bridge_{}_{}_{}", mode, type_name, name_out).replace('/', "_")
}

/// Frame rate over a sliding window, reported at most once per second
#[derive(Debug)]
pub struct FpsMeter {
    label: String,
    window: VecDeque<Instant>,
    capacity: usize,
    last_report: Option<Instant>,
}

impl FpsMeter {
    pub const WINDOW: usize = 30;
    const REPORT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            window: VecDeque::with_capacity(Self::WINDOW),
            capacity: Self::WINDOW,
            last_report: None,
        }
    }

    /// Record a frame now; logs and returns the rate when a report is due
    pub fn tick(&mut self) -> Option<f64> {
        let fps = self.tick_at(Instant::now())?;
        info!(topic = %self.label, fps, "Frame rate");
        Some(fps)
    }

    /// Record a frame at `now`; returns the windowed rate when a report is due
    pub fn tick_at(&mut self, now: Instant) -> Option<f64> {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(now);

        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= Self::REPORT_INTERVAL);
        if !due || self.window.len() < 2 {
            return None;
        }

        let first = *self.window.front()?;
        let span = now.duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return None;
        }
        self.last_report = Some(now);
        Some((self.window.len() - 1) as f64 / span)
    }
}
