//! Poll orchestration: drives the acquire, classify, detect, persist cycle.
//!
//! The orchestrator owns the driver session and the event detector; it is the
//! only writer of both. Cycles run on a fixed start-to-start interval, missed
//! ticks are delayed rather than stacked, and a manual trigger runs the same
//! cycle path between scheduled ticks. Authentication is lazy: sessions are
//! established on demand and refreshed at most once per cycle when the modem
//! rejects one mid-fetch.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::classify;
use crate::detector::{DetectorTuning, EventDetector};
use crate::driver::{Credentials, DriverSession, Endpoint, ModemDriver};
use crate::error::PollError;
use crate::model::{ConnectionInfo, DeviceInfo, StoredSnapshot};
use crate::store::Store;
use crate::thresholds::ThresholdStore;

/// Most recent persisted snapshot, with staleness marked when newer cycles
/// have been failing.
#[derive(Debug, Clone)]
pub struct LatestSnapshot {
    pub stored: StoredSnapshot,
    pub stale_since: Option<DateTime<Utc>>,
}

/// Shared cell holding the latest snapshot. Readers load lock-free; the
/// orchestrator is the only writer.
#[derive(Clone, Default)]
pub struct LatestCell(Arc<ArcSwapOption<LatestSnapshot>>);

impl LatestCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<LatestSnapshot>> {
        self.0.load_full()
    }

    fn publish(&self, stored: StoredSnapshot) {
        self.0.store(Some(Arc::new(LatestSnapshot {
            stored,
            stale_since: None,
        })));
    }

    /// Keep the last good snapshot but flag it as stale. The timestamp of the
    /// first failed cycle is retained across repeated failures.
    fn mark_stale(&self, now: DateTime<Utc>) {
        let Some(current) = self.0.load_full() else {
            return;
        };
        if current.stale_since.is_some() {
            return;
        }
        self.0.store(Some(Arc::new(LatestSnapshot {
            stored: current.stored.clone(),
            stale_since: Some(now),
        })));
    }
}

/// Handle for requesting an immediate out-of-schedule poll.
#[derive(Clone)]
pub struct PollHandle {
    trigger: mpsc::Sender<()>,
}

impl PollHandle {
    /// Returns false when a trigger is already pending or the poller is gone.
    pub fn trigger(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }
}

pub struct Poller {
    driver: Box<dyn ModemDriver>,
    endpoint: Endpoint,
    credentials: Credentials,
    thresholds: Arc<ThresholdStore>,
    store: Store,
    latest: LatestCell,
    detector: EventDetector,
    session: Option<DriverSession>,
    cached_device: Option<DeviceInfo>,
    cached_connection: Option<ConnectionInfo>,
    interval: Duration,
    fetch_retries: u32,
    trigger_rx: mpsc::Receiver<()>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Box<dyn ModemDriver>,
        endpoint: Endpoint,
        credentials: Credentials,
        thresholds: Arc<ThresholdStore>,
        store: Store,
        latest: LatestCell,
        tuning: DetectorTuning,
        interval: Duration,
        fetch_retries: u32,
    ) -> (Self, PollHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let poller = Poller {
            driver,
            endpoint,
            credentials,
            thresholds,
            store,
            latest,
            detector: EventDetector::new(tuning),
            session: None,
            cached_device: None,
            cached_connection: None,
            interval,
            fetch_retries,
            trigger_rx,
        };
        (poller, PollHandle { trigger: trigger_tx })
    }

    /// Run until cancelled. The first cycle runs immediately.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            family = self.driver.family(),
            interval_secs = self.interval.as_secs(),
            "poller running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(()) = self.trigger_rx.recv() => {
                    debug!("manual poll triggered");
                }
            }
            if let Err(err) = self.cycle(&cancel).await {
                error!(error = %err, "poll cycle failed");
                self.latest.mark_stale(Utc::now());
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        info!("poller stopped");
    }

    async fn authenticate(&mut self) -> Result<(), PollError> {
        let session = self
            .driver
            .authenticate(&self.endpoint, &self.credentials)
            .await?;
        self.session = Some(session);
        Ok(())
    }

    /// One full poll cycle: acquire, classify, detect, persist, publish.
    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<(), PollError> {
        if let Err(err) = self.thresholds.reload_if_changed() {
            // The active table stays in effect until the file is fixed.
            warn!(error = %err, "threshold reload failed");
        }
        let table = self.thresholds.current();

        let mut reauthed = false;
        let mut attempt = 0u32;
        let mut raw = loop {
            if self.session.is_none() {
                self.authenticate().await?;
            }
            let Some(session) = self.session.as_ref() else {
                continue;
            };
            match self.driver.fetch_channels(session, &self.endpoint).await {
                Ok(raw) => break raw,
                Err(err) if err.is_session_expired() && !reauthed => {
                    debug!("session rejected, re-authenticating");
                    reauthed = true;
                    self.session = None;
                }
                Err(err) if attempt < self.fetch_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(2 * u64::from(attempt));
                    warn!(error = %err, attempt, "fetch failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => {
                    if err.is_session_expired() {
                        self.session = None;
                    }
                    return Err(err.into());
                }
            }
        };

        self.refresh_metadata().await;
        if let Some(device) = &self.cached_device {
            raw.device = device.clone();
        }
        raw.connection = self.cached_connection.clone();

        let classification = classify(&raw, &table);
        let events = self.detector.update(&raw, &classification);
        let stored = self
            .store
            .append(raw, classification, events)
            .await?;

        info!(
            health = %stored.classification.aggregate,
            channels = stored.raw.channels.len(),
            events = stored.events.len(),
            "poll cycle complete"
        );
        self.latest.publish(stored);
        Ok(())
    }

    /// Device and connection info change rarely; failures here never fail the
    /// cycle, the last known values are reused.
    async fn refresh_metadata(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        match self.driver.fetch_device_info(session, &self.endpoint).await {
            Ok(device) => self.cached_device = Some(device),
            Err(err) => debug!(error = %err, "device info fetch failed, keeping cache"),
        }
        match self
            .driver
            .fetch_connection_info(session, &self.endpoint)
            .await
        {
            Ok(Some(connection)) => self.cached_connection = Some(connection),
            Ok(None) => {}
            Err(err) => debug!(error = %err, "connection info fetch failed, keeping cache"),
        }
    }
}
