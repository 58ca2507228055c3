//! SQLite-backed snapshot and event history.
//!
//! All database access runs on one dedicated worker thread; async callers
//! hand it closures over an mpsc channel and await the reply on a oneshot.
//! rusqlite connections are not Sync, and a single writer sidesteps SQLite's
//! locking entirely.
//!
//! Snapshots are write-once: one row per poll cycle with the full raw and
//! classified payloads as JSON, plus denormalized summary columns that trend
//! aggregation can scan without touching the JSON. Events reference their
//! snapshot and are removed with it when retention evicts old rows.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row, Transaction};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::model::{
    Classification, Direction, Event, EventKind, RawSnapshot, Severity, StoredEvent,
    StoredSnapshot,
};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE snapshots (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at         TEXT NOT NULL,
    health              TEXT NOT NULL,
    ds_total            INTEGER NOT NULL,
    us_total            INTEGER NOT NULL,
    ds_power_min        REAL NOT NULL,
    ds_power_max        REAL NOT NULL,
    ds_power_avg        REAL NOT NULL,
    us_power_min        REAL NOT NULL,
    us_power_max        REAL NOT NULL,
    us_power_avg        REAL NOT NULL,
    ds_snr_min          REAL NOT NULL,
    ds_snr_avg          REAL NOT NULL,
    correctable_total   INTEGER NOT NULL,
    uncorrectable_total INTEGER NOT NULL,
    raw_json            TEXT NOT NULL,
    classification_json TEXT NOT NULL
);
CREATE INDEX idx_snapshots_captured_at ON snapshots (captured_at);

CREATE TABLE events (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id    INTEGER NOT NULL REFERENCES snapshots (id) ON DELETE CASCADE,
    kind           TEXT NOT NULL,
    severity       TEXT NOT NULL,
    channel_id     INTEGER,
    direction      TEXT,
    previous_value TEXT,
    new_value      TEXT,
    message        TEXT NOT NULL,
    observed_at    TEXT NOT NULL
);
CREATE INDEX idx_events_snapshot_id ON events (snapshot_id);
CREATE INDEX idx_events_observed_at ON events (observed_at);
";

/// Trend aggregation granularity, mapped to a strftime bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Day,
    Week,
    Month,
}

impl Bucket {
    fn strftime(&self) -> &'static str {
        match self {
            Bucket::Day => "%Y-%m-%d",
            Bucket::Week => "%Y-%W",
            Bucket::Month => "%Y-%m",
        }
    }
}

/// One aggregated trend row, keyed by its bucket label.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendBucket {
    pub bucket: String,
    pub samples: u64,
    pub ds_power_min: f64,
    pub ds_power_max: f64,
    pub ds_power_avg: f64,
    pub us_power_avg: f64,
    pub ds_snr_min: f64,
    pub ds_snr_avg: f64,
    pub uncorrectable_max: u64,
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = guard.take() {
            if self.sender.send(DbCommand::Shutdown).is_err() {
                error!("store worker already gone at shutdown");
            }
            if handle.join().is_err() {
                error!("store worker panicked");
            }
        }
    }
}

/// Handle to the history database. Cheap to clone; all clones share the
/// worker thread.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    retention_days: u32,
}

fn timestamp(dt: DateTime<Utc>) -> String {
    // Fixed precision keeps lexicographic and chronological order identical.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("invalid timestamp '{value}'")))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("value {value} exceeds INTEGER range")))
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    let tx = conn.transaction()?;
    if version < 1 {
        tx.execute_batch(SCHEMA_V1)?;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

impl Store {
    /// Open (or create) the database at `path`. `retention_days` of zero
    /// disables eviction.
    pub fn open(path: PathBuf, retention_days: u32) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();
        let worker_path = path.clone();

        let worker = thread::Builder::new()
            .name("cablewatch-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&worker_path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };
                let init = conn
                    .pragma_update(None, "journal_mode", "WAL")
                    .and_then(|_| conn.pragma_update(None, "foreign_keys", "ON"))
                    .map_err(StoreError::from)
                    .and_then(|_| migrate(&mut conn));
                if ready_tx.send(init).is_err() {
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
                debug!("store worker shutting down");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(StoreError::WorkerGone),
        }
        info!(path = %path.display(), retention_days, "history database ready");

        Ok(Store {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            retention_days,
        })
    }

    async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = DbCommand::Execute(Box::new(move |conn| {
            let _ = reply_tx.send(task(conn));
        }));
        self.inner
            .sender
            .send(command)
            .map_err(|_| StoreError::WorkerGone)?;
        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Persist one poll cycle atomically: the snapshot row, its events, and
    /// the retention sweep all commit or roll back together.
    pub async fn append(
        &self,
        raw: RawSnapshot,
        classification: Classification,
        events: Vec<Event>,
    ) -> Result<StoredSnapshot, StoreError> {
        let retention_days = self.retention_days;
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let id = insert_snapshot(&tx, &raw, &classification)?;
            let mut stored_events = Vec::with_capacity(events.len());
            for event in events {
                let event_id = insert_event(&tx, id, &event)?;
                stored_events.push(StoredEvent {
                    id: event_id,
                    snapshot_id: id,
                    event,
                });
            }
            if retention_days > 0 {
                let cutoff = timestamp(Utc::now() - Duration::days(i64::from(retention_days)));
                let evicted =
                    tx.execute("DELETE FROM snapshots WHERE captured_at < ?1", params![cutoff])?;
                if evicted > 0 {
                    debug!(evicted, "retention evicted old snapshots");
                }
            }
            tx.commit()?;

            Ok(StoredSnapshot {
                id,
                captured_at: raw.captured_at,
                raw,
                classification,
                events: stored_events.into_iter().map(|se| se.event).collect(),
            })
        })
        .await
    }

    /// Most recent snapshot, if any.
    pub async fn latest(&self) -> Result<Option<StoredSnapshot>, StoreError> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, captured_at, raw_json, classification_json
                 FROM snapshots ORDER BY id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(read_snapshot(conn, row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Snapshots within `[from, to]`, oldest first, at most `limit` rows.
    /// Pass the last returned id as `after_id` to resume; the cursor stays
    /// valid across retention sweeps because ids are monotonic.
    pub async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        after_id: Option<i64>,
    ) -> Result<Vec<StoredSnapshot>, StoreError> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, captured_at, raw_json, classification_json
                 FROM snapshots
                 WHERE captured_at >= ?1 AND captured_at <= ?2 AND id > ?3
                 ORDER BY id ASC LIMIT ?4",
            )?;
            let mut rows = stmt.query(params![
                timestamp(from),
                timestamp(to),
                after_id.unwrap_or(0),
                limit as i64,
            ])?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(read_snapshot(conn, row)?);
            }
            Ok(snapshots)
        })
        .await
    }

    /// Events observed at or after `since`, oldest first.
    pub async fn events_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, snapshot_id, kind, severity, channel_id, direction,
                        previous_value, new_value, message, observed_at
                 FROM events WHERE observed_at >= ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query(params![timestamp(since)])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(read_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    /// Summary trends over `[from, to]`, grouped into calendar buckets. Works
    /// off the denormalized columns only.
    pub async fn aggregate(
        &self,
        bucket: Bucket,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrendBucket>, StoreError> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT strftime('{}', captured_at) AS bucket,
                        COUNT(*),
                        MIN(ds_power_min), MAX(ds_power_max), AVG(ds_power_avg),
                        AVG(us_power_avg),
                        MIN(ds_snr_min), AVG(ds_snr_avg),
                        MAX(uncorrectable_total)
                 FROM snapshots
                 WHERE captured_at >= ?1 AND captured_at <= ?2
                 GROUP BY bucket ORDER BY bucket ASC",
                bucket.strftime()
            ))?;
            let mut rows = stmt.query(params![timestamp(from), timestamp(to)])?;
            let mut buckets = Vec::new();
            while let Some(row) = rows.next()? {
                buckets.push(TrendBucket {
                    bucket: row.get(0)?,
                    samples: row.get::<_, i64>(1)? as u64,
                    ds_power_min: row.get(2)?,
                    ds_power_max: row.get(3)?,
                    ds_power_avg: row.get(4)?,
                    us_power_avg: row.get(5)?,
                    ds_snr_min: row.get(6)?,
                    ds_snr_avg: row.get(7)?,
                    uncorrectable_max: row.get::<_, i64>(8)? as u64,
                });
            }
            Ok(buckets)
        })
        .await
    }
}

fn insert_snapshot(
    tx: &Transaction<'_>,
    raw: &RawSnapshot,
    classification: &Classification,
) -> Result<i64, StoreError> {
    let s = &classification.summary;
    tx.execute(
        "INSERT INTO snapshots (
            captured_at, health, ds_total, us_total,
            ds_power_min, ds_power_max, ds_power_avg,
            us_power_min, us_power_max, us_power_avg,
            ds_snr_min, ds_snr_avg,
            correctable_total, uncorrectable_total,
            raw_json, classification_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            timestamp(raw.captured_at),
            classification.aggregate.as_str(),
            s.ds_total,
            s.us_total,
            s.ds_power_min,
            s.ds_power_max,
            s.ds_power_avg,
            s.us_power_min,
            s.us_power_max,
            s.us_power_avg,
            s.ds_snr_min,
            s.ds_snr_avg,
            to_i64(s.correctable_total)?,
            to_i64(s.uncorrectable_total)?,
            serde_json::to_string(raw)?,
            serde_json::to_string(classification)?,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_event(tx: &Transaction<'_>, snapshot_id: i64, event: &Event) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO events (
            snapshot_id, kind, severity, channel_id, direction,
            previous_value, new_value, message, observed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            snapshot_id,
            event.kind.as_str(),
            event.severity.as_str(),
            event.channel_id,
            event.direction.map(|d| d.as_str()),
            event.previous_value,
            event.new_value,
            event.message,
            timestamp(event.observed_at),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn read_snapshot(conn: &Connection, row: &Row<'_>) -> Result<StoredSnapshot, StoreError> {
    let id: i64 = row.get(0)?;
    let captured_at = parse_timestamp(&row.get::<_, String>(1)?)?;
    let raw: RawSnapshot = serde_json::from_str(&row.get::<_, String>(2)?)?;
    let classification: Classification = serde_json::from_str(&row.get::<_, String>(3)?)?;

    let mut stmt = conn.prepare(
        "SELECT id, snapshot_id, kind, severity, channel_id, direction,
                previous_value, new_value, message, observed_at
         FROM events WHERE snapshot_id = ?1 ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(params![id])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(read_event(row)?.event);
    }

    Ok(StoredSnapshot {
        id,
        captured_at,
        raw,
        classification,
        events,
    })
}

fn read_event(row: &Row<'_>) -> Result<StoredEvent, StoreError> {
    let kind_str: String = row.get(2)?;
    let kind = EventKind::parse(&kind_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown event kind '{kind_str}'")))?;
    let severity_str: String = row.get(3)?;
    let severity = Severity::parse(&severity_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown severity '{severity_str}'")))?;
    let direction = row
        .get::<_, Option<String>>(5)?
        .map(|s| {
            Direction::parse(&s)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown direction '{s}'")))
        })
        .transpose()?;

    Ok(StoredEvent {
        id: row.get(0)?,
        snapshot_id: row.get(1)?,
        event: Event {
            kind,
            severity,
            channel_id: row.get(4)?,
            direction,
            previous_value: row.get(6)?,
            new_value: row.get(7)?,
            message: row.get(8)?,
            observed_at: parse_timestamp(&row.get::<_, String>(9)?)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::classify;
    use crate::model::{
        ChannelReading, DeviceInfo, DocsisVersion, Modulation,
    };
    use crate::thresholds::ThresholdTable;
    use chrono::TimeZone;

    fn snapshot_at(at: DateTime<Utc>, power: f64) -> (RawSnapshot, Classification) {
        let raw = RawSnapshot {
            captured_at: at,
            device: DeviceInfo {
                model: "Test Modem".into(),
                firmware: "1.0".into(),
                uptime_seconds: Some(3600),
            },
            connection: None,
            channels: vec![ChannelReading {
                channel_id: 1,
                direction: Direction::Downstream,
                frequency_hz: 602_000_000,
                power_dbmv: power,
                snr_db: Some(38.0),
                modulation: Modulation::new("256QAM"),
                correctable_errors: 5,
                uncorrectable_errors: 1,
                docsis_version: DocsisVersion::V31,
            }],
        };
        let classification = classify(&raw, &ThresholdTable::default());
        (raw, classification)
    }

    fn event_at(at: DateTime<Utc>) -> Event {
        Event {
            kind: EventKind::PowerDrift,
            severity: Severity::Warning,
            channel_id: Some(1),
            direction: Some(Direction::Downstream),
            previous_value: Some("3.0".into()),
            new_value: Some("6.0".into()),
            message: "downstream channel 1 power drifted".into(),
            observed_at: at,
        }
    }

    fn open_store(dir: &tempfile::TempDir, retention_days: u32) -> Store {
        Store::open(dir.path().join("history.db"), retention_days).unwrap()
    }

    #[tokio::test]
    async fn append_then_latest_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0);
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let (raw, classification) = snapshot_at(at, 3.5);

        let stored = store
            .append(raw.clone(), classification.clone(), vec![event_at(at)])
            .await
            .unwrap();
        let fetched = store.latest().await.unwrap().unwrap();

        assert_eq!(fetched.id, stored.id);
        assert_eq!(fetched.raw, raw);
        assert_eq!(fetched.classification, classification);
        assert_eq!(fetched.events, vec![event_at(at)]);
    }

    #[tokio::test]
    async fn empty_store_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0);
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_evicts_snapshots_and_their_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 7);

        let old = Utc::now() - Duration::days(30);
        let (raw, cls) = snapshot_at(old, 3.0);
        store.append(raw, cls, vec![event_at(old)]).await.unwrap();

        let now = Utc::now();
        let (raw, cls) = snapshot_at(now, 4.0);
        store.append(raw, cls, vec![]).await.unwrap();

        let all = store
            .query_range(now - Duration::days(365), now + Duration::days(1), 100, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].raw.channels[0].power_dbmv, 4.0);

        let events = store
            .events_since(now - Duration::days(365))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0);
        let old = Utc::now() - Duration::days(3650);
        let (raw, cls) = snapshot_at(old, 3.0);
        store.append(raw, cls, vec![]).await.unwrap();
        let (raw, cls) = snapshot_at(Utc::now(), 4.0);
        store.append(raw, cls, vec![]).await.unwrap();

        let all = store
            .query_range(
                old - Duration::days(1),
                Utc::now() + Duration::days(1),
                100,
                None,
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn range_query_pages_by_id_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0);
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            let (raw, cls) = snapshot_at(base + Duration::minutes(i), i as f64);
            store.append(raw, cls, vec![]).await.unwrap();
        }

        let from = base - Duration::hours(1);
        let to = base + Duration::hours(1);
        let page1 = store.query_range(from, to, 2, None).await.unwrap();
        assert_eq!(page1.len(), 2);
        let page2 = store
            .query_range(from, to, 2, Some(page1[1].id))
            .await
            .unwrap();
        assert_eq!(page2.len(), 2);
        let page3 = store
            .query_range(from, to, 2, Some(page2[1].id))
            .await
            .unwrap();
        assert_eq!(page3.len(), 1);

        let powers: Vec<f64> = page1
            .iter()
            .chain(&page2)
            .chain(&page3)
            .map(|s| s.raw.channels[0].power_dbmv)
            .collect();
        assert_eq!(powers, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn daily_aggregation_buckets_by_calendar_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0);
        let day1 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        for power in [2.0, 6.0] {
            let (raw, cls) = snapshot_at(day1 + Duration::minutes(power as i64), power);
            store.append(raw, cls, vec![]).await.unwrap();
        }
        let day2 = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let (raw, cls) = snapshot_at(day2, 10.0);
        store.append(raw, cls, vec![]).await.unwrap();

        let trends = store
            .aggregate(Bucket::Day, day1 - Duration::days(1), day2 + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(trends.len(), 2);
        assert_eq!(trends[0].bucket, "2026-03-01");
        assert_eq!(trends[0].samples, 2);
        assert_eq!(trends[0].ds_power_min, 2.0);
        assert_eq!(trends[0].ds_power_max, 6.0);
        assert_eq!(trends[0].ds_power_avg, 4.0);
        assert_eq!(trends[1].bucket, "2026-03-02");
        assert_eq!(trends[1].samples, 1);
    }

    #[tokio::test]
    async fn events_since_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, 0);
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let (raw, cls) = snapshot_at(t1, 3.0);
        store.append(raw, cls, vec![event_at(t1)]).await.unwrap();
        let (raw, cls) = snapshot_at(t2, 3.0);
        store.append(raw, cls, vec![event_at(t2)]).await.unwrap();

        let events = store.events_since(t2).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.observed_at, t2);

        let events = store.events_since(t1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        {
            let store = Store::open(path.clone(), 0).unwrap();
            let (raw, cls) = snapshot_at(at, 3.5);
            store.append(raw, cls, vec![]).await.unwrap();
        }
        let store = Store::open(path, 0).unwrap();
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.captured_at, at);
    }
}
