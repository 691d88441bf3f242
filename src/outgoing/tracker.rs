use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::{OutgoingConfig, Result};
use crate::protocol::{ModemHandle, Record};
use crate::time::WindowClock;
use super::message::{normalize_tx_text, MessageHandle, MessageStatus, OutgoingMessage, StatusChange};

struct Tracked {
    message: OutgoingMessage,
    status_tx: watch::Sender<MessageStatus>,
}

/// Infers the lifecycle of outgoing messages from the modem's transmit text
///
/// The modem never acknowledges a transmission. A message is taken to be
/// sending while its text shows in the transmit field and sent once it has
/// left it. A message never seen there fails after the maximum age.
pub struct OutgoingMessageTracker {
    modem: ModemHandle,
    windows: Arc<WindowClock>,
    config: OutgoingConfig,
    queue: Mutex<VecDeque<Tracked>>,
    pass: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<StatusChange>,
    enabled: AtomicBool,
    paused: AtomicBool,
}

impl OutgoingMessageTracker {
    /// Creates a tracker and the receiver for its status changes
    pub fn new(
        modem: ModemHandle,
        windows: Arc<WindowClock>,
        config: OutgoingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<StatusChange>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let tracker = OutgoingMessageTracker {
            modem,
            windows,
            config,
            queue: Mutex::new(VecDeque::new()),
            pass: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            events,
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
        };
        (tracker, events_rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Tracked>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends a message to the modem and starts tracking it
    pub async fn enqueue(&self, destination: &str, body: &str) -> Result<MessageHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = OutgoingMessage::new(id, destination, body, self.windows.clock().now());

        self.modem.send(Record::send_message(message.render())).await?;

        let (status_tx, status_rx) = watch::channel(MessageStatus::Queued);
        debug!(id, text = %message.render(), "message queued");
        self.lock().push_back(Tracked { message, status_tx });

        Ok(MessageHandle::new(id, status_rx))
    }

    /// Age at which an unsent message fails at the current speed
    pub fn max_age(&self) -> Duration {
        self.config.max_age(self.windows.speed())
    }

    /// Messages still in flight, oldest first
    pub fn pending(&self) -> Vec<OutgoingMessage> {
        self.lock().iter().map(|t| t.message.clone()).collect()
    }

    /// Number of messages in flight
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs one pass against the last known transmit text
    pub async fn poll(&self) -> Vec<StatusChange> {
        let tx_text = self.modem.state().tx_text();
        let now = self.windows.clock().now();
        self.poll_at(tx_text.as_deref(), now, self.max_age()).await
    }

    /// Runs one pass against `tx_text` at `now`
    ///
    /// Unknown transmit text skips matching but still enforces the age limit.
    /// Messages enqueued while the pass runs are picked up by the next one.
    pub async fn poll_at(&self, tx_text: Option<&str>, now: SystemTime, max_age: Duration) -> Vec<StatusChange> {
        let _pass = self.pass.lock().await;
        let tx_text = tx_text.map(normalize_tx_text);

        let in_flight: Vec<Tracked> = self.lock().drain(..).collect();
        let mut survivors = VecDeque::with_capacity(in_flight.len());
        let mut changes = Vec::new();

        for mut tracked in in_flight {
            let next = match (&tx_text, tracked.message.status) {
                (Some(text), MessageStatus::Queued) if tracked.message.matches(text) => {
                    Some(MessageStatus::Sending)
                }
                (Some(text), MessageStatus::Sending) if !tracked.message.matches(text) => {
                    Some(MessageStatus::Sent)
                }
                _ if tracked.message.age(now) >= max_age => Some(MessageStatus::Failed),
                _ => None,
            };

            if let Some(status) = next {
                if let Some(previous) = tracked.message.advance(status, now) {
                    let change = StatusChange { message: tracked.message.clone(), previous };
                    self.publish(&tracked, change.clone());
                    changes.push(change);
                }
            }

            if !tracked.message.status.is_terminal() {
                survivors.push_back(tracked);
            }
        }

        let mut queue = self.lock();
        survivors.extend(queue.drain(..));
        *queue = survivors;

        changes
    }

    fn publish(&self, tracked: &Tracked, change: StatusChange) {
        let message = &change.message;
        match message.status {
            MessageStatus::Failed => warn!(
                id = message.id,
                text = %message.render(),
                age = ?message.age(message.last_status_change_at),
                "message failed to send"
            ),
            status => info!(id = message.id, %status, text = %message.render(), "message status changed"),
        }

        tracked.status_tx.send_replace(message.status);
        // nobody listening is fine
        let _ = self.events.send(change);
    }

    /// Resumes polling
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stops polling
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether polling is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Suspends polling without disabling
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Lifts a pause
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether polling is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Polling task
    ///
    /// Each cycle asks the modem for fresh transmit text and checks every
    /// message against the last copy received.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if !self.is_enabled() || self.is_paused() {
                continue;
            }

            if let Err(e) = self.modem.request_tx_text() {
                debug!("Transmit text request skipped: {}", e);
            }
            self.poll().await;
        }
        debug!("outgoing tracker stopped");
    }
}
