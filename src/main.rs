use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cablewatch::config::{ModemKind, Settings};
use cablewatch::driver::{ArrisDriver, FritzDriver, ModemDriver};
use cablewatch::poller::{LatestCell, PollHandle, Poller};
use cablewatch::store::Store;
use cablewatch::thresholds::ThresholdStore;

/// Bound on how long shutdown waits for an in-flight cycle to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let settings = Settings::parse();
    settings.validate()?;

    let thresholds = match &settings.thresholds_file {
        Some(path) => Arc::new(ThresholdStore::from_file(path.clone())?),
        None => Arc::new(ThresholdStore::builtin()),
    };
    let store = Store::open(settings.database_path(), settings.history_days)?;

    let driver: Box<dyn ModemDriver> = match settings.modem_type {
        ModemKind::Fritz => Box::new(FritzDriver::new()),
        ModemKind::Arris => Box::new(ArrisDriver::new()),
    };
    info!(
        family = driver.family(),
        url = %settings.modem_url,
        interval_secs = settings.poll_interval,
        "cablewatch starting"
    );

    let latest = LatestCell::new();
    let (poller, handle) = Poller::new(
        driver,
        settings.endpoint(),
        settings.credentials()?,
        thresholds,
        store,
        latest,
        settings.tuning(),
        Duration::from_secs(settings.poll_interval),
        settings.fetch_retries,
    );

    let cancel = CancellationToken::new();
    let poller_task = tokio::spawn(poller.run(cancel.clone()));
    spawn_manual_poll_listener(handle);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, poller_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "poller task panicked"),
        Err(_) => warn!("poller did not stop within the grace period"),
    }
    Ok(())
}

/// SIGUSR1 requests an immediate poll outside the schedule.
#[cfg(unix)]
fn spawn_manual_poll_listener(handle: PollHandle) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGUSR1, manual polls disabled");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            if !handle.trigger() {
                warn!("manual poll request dropped, one already pending");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_manual_poll_listener(_handle: PollHandle) {}
