//! Durable storage for device rows and telemetry history.
//!
//! The engine talks to storage only through the [`DurableStore`] trait.
//! [`SqliteStore`] is the shipped implementation.
//!
//! Schema:
//!
//! - `device_history`: one append-only row per [`HistoryRecord`]; timestamps
//!   are Unix milliseconds. Indexed on `(device_id, ts)` for range queries.
//! - `devices`: latest persisted [`DeviceState`] per device, upserted by the
//!   synchronizer and read back on startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::error::StoreError;
use crate::model::{DeviceState, DeviceStatus, GeoPoint, HistoryRecord};

/// Operations the engine needs from a durable store.
///
/// `insert_history_batch` must be atomic: either every record in the batch is
/// committed or none is.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<(), StoreError>;

    /// History for one device with `start <= timestamp <= end`, ascending by
    /// timestamp regardless of insertion order.
    async fn query_range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    async fn upsert_device(&self, state: &DeviceState) -> Result<(), StoreError>;

    async fn upsert_devices(&self, states: &[DeviceState]) -> Result<(), StoreError> {
        for state in states {
            self.upsert_device(state).await?;
        }
        Ok(())
    }

    async fn query_all_devices(&self) -> Result<Vec<DeviceState>, StoreError>;

    /// Retention purge. Returns the number of records deleted.
    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Administrative purge of one device's history and device row.
    async fn purge_device(&self, device_id: &str) -> Result<u64, StoreError>;
}

/// SQLite-backed [`DurableStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:coldtrack.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database gets its own database,
        // so keep exactly one and never recycle it.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                status INTEGER NOT NULL,
                temperature REAL NOT NULL,
                humidity REAL NOT NULL,
                oxygen_level REAL NOT NULL,
                latitude REAL,
                longitude REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_device_history_device_ts
            ON device_history(device_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status INTEGER NOT NULL,
                temperature REAL NOT NULL,
                humidity REAL NOT NULL,
                oxygen_level REAL NOT NULL,
                latitude REAL,
                longitude REAL,
                speed REAL,
                last_update INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Total number of history rows, across all devices.
    pub async fn history_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as total FROM device_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }
}

fn status_from_row(row: &SqliteRow) -> Result<DeviceStatus, StoreError> {
    let code: i64 = row.try_get("status")?;
    DeviceStatus::from_code(code)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown status code {code}")))
}

fn time_from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::CorruptRow(format!("timestamp out of range: {millis}")))
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryRecord, StoreError> {
    Ok(HistoryRecord {
        device_id: row.try_get("device_id")?,
        timestamp: time_from_millis(row.try_get("ts")?)?,
        status: status_from_row(row)?,
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        oxygen_level: row.try_get("oxygen_level")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
    })
}

fn device_from_row(row: &SqliteRow) -> Result<DeviceState, StoreError> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;

    Ok(DeviceState {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: status_from_row(row)?,
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        oxygen_level: row.try_get("oxygen_level")?,
        location: latitude.zip(longitude).map(|(lat, lng)| GeoPoint::new(lat, lng)),
        speed: row.try_get("speed")?,
        last_update: time_from_millis(row.try_get("last_update")?)?,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO device_history
                    (device_id, ts, status, temperature, humidity, oxygen_level, latitude, longitude)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.device_id)
            .bind(record.timestamp.timestamp_millis())
            .bind(record.status.code())
            .bind(record.temperature)
            .bind(record.humidity)
            .bind(record.oxygen_level)
            .bind(record.latitude)
            .bind(record.longitude)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, ts, status, temperature, humidity, oxygen_level, latitude, longitude
            FROM device_history
            WHERE device_id = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(device_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    async fn upsert_device(&self, state: &DeviceState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devices
                (id, name, status, temperature, humidity, oxygen_level, latitude, longitude, speed, last_update)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                temperature = excluded.temperature,
                humidity = excluded.humidity,
                oxygen_level = excluded.oxygen_level,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                speed = excluded.speed,
                last_update = excluded.last_update
            "#,
        )
        .bind(&state.id)
        .bind(&state.name)
        .bind(state.status.code())
        .bind(state.temperature)
        .bind(state.humidity)
        .bind(state.oxygen_level)
        .bind(state.location.map(|p| p.lat))
        .bind(state.location.map(|p| p.lng))
        .bind(state.speed)
        .bind(state.last_update.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_all_devices(&self) -> Result<Vec<DeviceState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, status, temperature, humidity, oxygen_level, latitude, longitude, speed, last_update
            FROM devices
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(device_from_row).collect()
    }

    async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM device_history WHERE ts < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_device(&self, device_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM device_history WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn record(device_id: &str, timestamp: DateTime<Utc>, temperature: f64) -> HistoryRecord {
        HistoryRecord {
            device_id: device_id.to_string(),
            timestamp,
            status: DeviceStatus::Normal,
            temperature,
            humidity: 50.0,
            oxygen_level: 20.9,
            latitude: Some(31.23),
            longitude: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_query_range() {
        let store = setup_test_store().await;
        let now = Utc::now();

        store
            .insert_history_batch(&[
                record("a", now - Duration::minutes(2), 3.0),
                record("a", now - Duration::minutes(1), 4.0),
                record("b", now, 9.0),
            ])
            .await
            .unwrap();

        let history = store
            .query_range("a", now - Duration::hours(1), now)
            .await
            .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].temperature, 3.0);
        assert_eq!(history[1].temperature, 4.0);
        assert_eq!(history[0].latitude, Some(31.23));
        assert_eq!(history[0].longitude, None);
    }

    #[tokio::test]
    async fn test_query_range_sorts_out_of_order_inserts() {
        let store = setup_test_store().await;
        let now = Utc::now();

        store
            .insert_history_batch(&[record("a", now, 2.0)])
            .await
            .unwrap();
        store
            .insert_history_batch(&[record("a", now - Duration::seconds(30), 1.0)])
            .await
            .unwrap();

        let history = store
            .query_range("a", now - Duration::minutes(1), now)
            .await
            .unwrap();

        let temperatures: Vec<f64> = history.iter().map(|r| r.temperature).collect();
        assert_eq!(temperatures, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_upsert_device_overwrites() {
        let store = setup_test_store().await;
        let mut state = DeviceState {
            id: "reefer-1".to_string(),
            name: "Reefer 1".to_string(),
            status: DeviceStatus::Normal,
            temperature: 4.0,
            humidity: 60.0,
            oxygen_level: 20.9,
            location: Some(GeoPoint::new(31.2, 121.5)),
            speed: Some(42.0),
            last_update: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        };
        store.upsert_device(&state).await.unwrap();

        state.status = DeviceStatus::Error;
        state.temperature = 11.5;
        store.upsert_device(&state).await.unwrap();

        let devices = store.query_all_devices().await.unwrap();
        assert_eq!(devices, vec![state]);
    }

    #[tokio::test]
    async fn test_purges() {
        let store = setup_test_store().await;
        let now = Utc::now();

        store
            .insert_history_batch(&[
                record("a", now - Duration::days(40), 1.0),
                record("a", now, 2.0),
                record("b", now, 3.0),
            ])
            .await
            .unwrap();

        let purged = store
            .purge_history_before(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let purged = store.purge_device("b").await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.history_count().await.unwrap(), 1);
    }
}
