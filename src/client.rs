//! Client wiring every component to the modem record interface
//!
//! The [`Client`] owns the shared state, dispatches incoming records to the
//! components that care about them, and runs every background task under a
//! single shutdown signal.
//!
//! # Examples
//!
//! ```no_run
//! use futures::stream;
//! use slotwise::client::Client;
//! use slotwise::core::Config;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> slotwise::Result<()> {
//!     let (record_tx, _outgoing) = mpsc::channel(100);
//!     let (client, mut channels) = Client::new(Config::default(), record_tx)?;
//!     client.start();
//!
//!     // records read from the modem connection
//!     let incoming = stream::iter(Vec::new());
//!     tokio::spawn({
//!         let client = client.clone();
//!         async move { client.consume(incoming).await }
//!     });
//!
//!     client.enqueue("W1AW", "HELLO").await?;
//!     while let Some(change) = channels.status.recv().await {
//!         println!("{} is {}", change.message.render(), change.status());
//!     }
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::beacon::{ActivityLog, BeaconScheduler};
use crate::core::{Clock, Config, Result};
use crate::outgoing::{MessageHandle, OutgoingMessageTracker, StatusChange};
use crate::protocol::{ModemHandle, Record, RecordType, StateKey, StateStore, StateValue};
use crate::rx::{AssembledMessage, FragmentAssembler};
use crate::spectrum::{OffsetArbiter, OffsetMonitor, SpectrumAllocator, SpotLog};
use crate::time::WindowClock;

/// Receivers for events produced by a running client
pub struct ClientChannels {
    /// Outgoing message status changes
    pub status: mpsc::UnboundedReceiver<StatusChange>,
    /// Messages rebuilt from directed fragments
    pub assembled: mpsc::Receiver<AssembledMessage>,
}

type AssemblerPipe = (mpsc::Receiver<Record>, mpsc::Sender<AssembledMessage>);

/// Client-side control layer for the modem
pub struct Client {
    config: Config,
    clock: Clock,
    modem: ModemHandle,
    windows: Arc<WindowClock>,
    spots: Arc<SpotLog>,
    arbiter: Arc<OffsetArbiter>,
    primary: Arc<OffsetMonitor>,
    beacon_monitor: Arc<OffsetMonitor>,
    tracker: Arc<OutgoingMessageTracker>,
    beacon: Arc<BeaconScheduler>,
    activity: Arc<ActivityLog>,
    directed_tx: mpsc::Sender<Record>,
    assembler: Mutex<Option<AssemblerPipe>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Creates a client sending requests through `record_tx`
    pub fn new(config: Config, record_tx: mpsc::Sender<Record>) -> Result<(Arc<Client>, ClientChannels)> {
        Client::with_clock(config, record_tx, Clock::new())
    }

    /// Creates a client on an explicit clock
    pub fn with_clock(
        config: Config,
        record_tx: mpsc::Sender<Record>,
        clock: Clock,
    ) -> Result<(Arc<Client>, ClientChannels)> {
        config.validate()?;

        let state = Arc::new(StateStore::new());
        if let Some(callsign) = &config.callsign {
            state.set(StateKey::Callsign, StateValue::Text(callsign.trim().to_uppercase()));
        }
        let modem = ModemHandle::new(record_tx, Arc::clone(&state));
        let windows = Arc::new(WindowClock::new(clock, config.speed));
        let retention = config.spectrum.max_age.max(config.beacon.band.max_age);
        let spots = Arc::new(SpotLog::with_retention(retention));
        let activity = Arc::new(ActivityLog::new());

        let (arbiter, primary_gate, beacon_gate) = OffsetArbiter::new();
        let primary = Arc::new(OffsetMonitor::new(
            SpectrumAllocator::new(config.spectrum.clone()),
            primary_gate.clone(),
            modem.clone(),
            Arc::clone(&spots),
            Arc::clone(&windows),
        ));
        let beacon_monitor = Arc::new(OffsetMonitor::new(
            SpectrumAllocator::new(config.beacon.band.clone()),
            beacon_gate,
            modem.clone(),
            Arc::clone(&spots),
            Arc::clone(&windows),
        ));

        let (tracker, status) =
            OutgoingMessageTracker::new(modem.clone(), Arc::clone(&windows), config.outgoing.clone());
        let tracker = Arc::new(tracker);

        let beacon = Arc::new(BeaconScheduler::new(
            config.beacon.clone(),
            modem.clone(),
            Arc::clone(&windows),
            Arc::clone(&tracker),
            primary_gate,
            Arc::clone(&beacon_monitor),
            Arc::clone(&activity),
        ));

        let (directed_tx, directed_rx) = mpsc::channel(config.channel_capacity);
        let (assembled_tx, assembled) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let client = Client {
            config,
            clock,
            modem,
            windows,
            spots,
            arbiter,
            primary,
            beacon_monitor,
            tracker,
            beacon,
            activity,
            directed_tx,
            assembler: Mutex::new(Some((directed_rx, assembled_tx))),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(client), ClientChannels { status, assembled }))
    }

    /// Client configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Last-known modem state
    pub fn state(&self) -> &Arc<StateStore> {
        self.modem.state()
    }

    /// Handle for sending records to the modem
    pub fn modem(&self) -> &ModemHandle {
        &self.modem
    }

    /// Window boundary prediction
    pub fn windows(&self) -> &Arc<WindowClock> {
        &self.windows
    }

    /// Recently heard signals
    pub fn spots(&self) -> &Arc<SpotLog> {
        &self.spots
    }

    /// Offset arbitration between the allocators
    pub fn arbiter(&self) -> &Arc<OffsetArbiter> {
        &self.arbiter
    }

    /// Primary offset monitor
    pub fn offset_monitor(&self) -> &Arc<OffsetMonitor> {
        &self.primary
    }

    /// Beacon-band offset monitor
    pub fn beacon_monitor(&self) -> &Arc<OffsetMonitor> {
        &self.beacon_monitor
    }

    /// Outgoing message tracker
    pub fn tracker(&self) -> &Arc<OutgoingMessageTracker> {
        &self.tracker
    }

    /// Beacon scheduler
    pub fn beacon(&self) -> &Arc<BeaconScheduler> {
        &self.beacon
    }

    /// Recent traffic log
    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    /// Spawns every background task
    ///
    /// Calling this again after the first start does nothing.
    pub fn start(&self) {
        let Some((directed_rx, assembled_tx)) = self.assembler.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            debug!("client already started");
            return;
        };

        let windows = Arc::clone(&self.windows);
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn(async move { windows.run(shutdown).await });

        let primary = Arc::clone(&self.primary);
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn(async move { primary.run(shutdown).await });

        let beacon_monitor = Arc::clone(&self.beacon_monitor);
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn(async move { beacon_monitor.run(shutdown).await });

        let tracker = Arc::clone(&self.tracker);
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn(async move { tracker.run(shutdown).await });

        let beacon = Arc::clone(&self.beacon);
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn(async move { beacon.run(shutdown).await });

        let windows = Arc::clone(&self.windows);
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn(FragmentAssembler::new().run(windows, directed_rx, assembled_tx, shutdown));

        if self.config.beacon.enabled {
            self.beacon.enable();
        }
        info!(speed = %self.windows.speed(), "client started");
    }

    /// Signals every task to stop and waits for them
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("client stopped");
    }

    /// Sends a directed message and tracks it
    pub async fn enqueue(&self, destination: &str, body: &str) -> Result<MessageHandle> {
        let handle = self.tracker.enqueue(destination, body).await?;
        self.activity.note_outgoing(self.clock.now());
        Ok(handle)
    }

    fn is_local(&self, callsign: Option<&str>) -> bool {
        match (callsign, self.state().callsign()) {
            (Some(call), Some(local)) => call.eq_ignore_ascii_case(&local),
            _ => false,
        }
    }

    /// Routes one incoming record
    pub async fn handle_record(&self, record: Record) {
        let now = self.clock.now();
        let changed = self.state().apply(&record);

        match record.record_type() {
            Some(RecordType::TxFrame) => {
                self.windows.observe_frame(record.timestamp().unwrap_or(now));
            }
            Some(RecordType::ModeSpeed) => {
                if let Some(speed) = record.speed() {
                    self.windows.set_speed(speed);
                }
            }
            Some(RecordType::RigFreq) => {
                if changed.contains(&StateKey::Dial) {
                    self.beacon.note_frequency_change(now);
                }
            }
            Some(RecordType::TxText) => {
                if changed.contains(&StateKey::TxText) && !record.text().trim().is_empty() {
                    self.activity.note_outgoing(now);
                }
            }
            Some(RecordType::RxSpot) => {
                self.spots.record_from(&record, now);
            }
            Some(RecordType::RxActivity) => {
                self.windows.observe_receive(now);
                self.spots.record_from(&record, now);
            }
            Some(RecordType::RxDirected) => {
                self.windows.observe_receive(now);
                self.spots.record_from(&record, now);
                if self.is_local(record.origin()) || self.is_local(record.destination()) {
                    self.activity.note_exchange(now);
                }
                if let Err(e) = self.directed_tx.try_send(record) {
                    warn!("Directed message dropped: {}", e);
                }
            }
            _ => {}
        }
    }

    /// Feeds records from the modem until the stream ends or shutdown
    pub async fn consume<S>(&self, records: S)
    where
        S: Stream<Item = Record>,
    {
        futures::pin_mut!(records);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let record = tokio::select! {
                record = records.next() => record,
                _ = shutdown.changed() => break,
            };
            match record {
                Some(record) => self.handle_record(record).await,
                None => break,
            }
        }
        debug!("record stream finished");
    }
}
