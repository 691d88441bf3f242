use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::core::{ADJACENCY_GRACE, EOM};
use crate::protocol::{Record, RecordType};
use crate::time::util::time_diff;
use crate::time::WindowClock;

#[derive(Debug, Clone)]
struct Fragment {
    body: String,
    received_at: SystemTime,
}

/// A complete message rebuilt from one or more directed fragments
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    /// Sending station
    pub origin: String,
    /// Destination from the final fragment, when known
    pub destination: Option<String>,
    /// Message text without the end-of-message marker
    pub text: String,
    /// When the final fragment arrived
    pub received_at: SystemTime,
    /// Number of fragments combined
    pub fragments: usize,
}

/// Rebuilds messages that span several transmit windows
///
/// Fragments are grouped per origin. A fragment joins the group when it
/// arrived within one window (plus a second of grace) of the previous one;
/// otherwise the group is stale and starts again. The end-of-message marker
/// closes the group.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    groups: HashMap<String, Vec<Fragment>>,
}

fn adjacent(a: SystemTime, b: SystemTime, window: Duration) -> bool {
    time_diff(a, b) < window + ADJACENCY_GRACE
}

impl FragmentAssembler {
    /// Creates an assembler with no pending groups
    pub fn new() -> Self {
        FragmentAssembler::default()
    }

    /// Origins with a partial message pending
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no partial message is pending
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Fragments held for `origin`
    pub fn pending(&self, origin: &str) -> usize {
        self.groups.get(origin).map_or(0, Vec::len)
    }

    /// Adds a fragment, returning the message it completes
    pub fn process(
        &mut self,
        origin: &str,
        destination: Option<&str>,
        body: &str,
        received_at: SystemTime,
        window: Duration,
    ) -> Option<AssembledMessage> {
        let fragment = Fragment { body: body.to_string(), received_at };
        let complete = body.contains(EOM);

        let parts = match self.groups.remove(origin) {
            Some(mut group) => {
                let joins = group
                    .last()
                    .map_or(false, |last| adjacent(last.received_at, received_at, window));
                if !joins {
                    debug!(origin, dropped = group.len(), "stale fragments discarded");
                    group.clear();
                }
                group.push(fragment);
                group
            }
            None => vec![fragment],
        };

        if !complete {
            trace!(origin, parts = parts.len(), "fragment held");
            self.groups.insert(origin.to_string(), parts);
            return None;
        }

        let text: String = parts
            .iter()
            .flat_map(|part| part.body.chars())
            .filter(|c| *c != EOM)
            .collect();

        Some(AssembledMessage {
            origin: origin.to_string(),
            destination: destination.map(str::to_string),
            text: text.trim().to_string(),
            received_at,
            fragments: parts.len(),
        })
    }

    /// Adds the fragment carried by a directed record
    ///
    /// The record's own timestamp is used when present.
    pub fn process_record(
        &mut self,
        record: &Record,
        received_at: SystemTime,
        window: Duration,
    ) -> Option<AssembledMessage> {
        if record.record_type() != Some(RecordType::RxDirected) {
            return None;
        }
        let origin = record.origin()?.to_uppercase();
        let received_at = record.timestamp().unwrap_or(received_at);
        self.process(&origin, record.destination(), record.text(), received_at, window)
    }

    /// Drops groups that can no longer be continued by a fragment stamped `now`
    ///
    /// `now` must be on the same clock as the fragment stamps.
    pub fn prune(&mut self, now: SystemTime, window: Duration) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| {
            group.last().map_or(false, |last| {
                now <= last.received_at || adjacent(last.received_at, now, window)
            })
        });
        before - self.groups.len()
    }

    /// Assembler task
    ///
    /// Consumes directed records and forwards every completed message to
    /// `sink` until shutdown or until either channel closes.
    pub async fn run(
        mut self,
        windows: Arc<WindowClock>,
        mut records: mpsc::Receiver<Record>,
        sink: mpsc::Sender<AssembledMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let record = tokio::select! {
                record = records.recv() => record,
                _ = shutdown.changed() => break,
            };
            let Some(record) = record else {
                break;
            };

            let now = windows.clock().now();
            let window = windows.window_duration();
            // fragments carry the modem's stamps, which may lag local time
            let stamped = record.timestamp().unwrap_or(now);
            self.prune(stamped, window);

            if let Some(message) = self.process_record(&record, now, window) {
                debug!(origin = %message.origin, fragments = message.fragments, "message assembled");
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        }
        debug!("fragment assembler stopped");
    }
}
