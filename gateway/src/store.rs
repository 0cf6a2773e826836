use crate::errors::{Error, Result};
use crate::ingest::ReadingStore;
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{DeviceSummary, Reading, ShockAlertEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed store. `received_at` is the sole sort and range key for
/// both tables; there is no uniqueness constraint, so a record republished
/// from the edge offline buffer may be stored twice (accepted at-least-once
/// semantics).
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn latest_readings(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, Reading>(
            "SELECT device_id, temperature, humidity, shock_g, lat, lon, battery, door_open,
                    device_ts, received_at
             FROM readings
             WHERE device_id = $1
             ORDER BY received_at DESC
             LIMIT $2",
        )
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn latest_shock_alerts(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<ShockAlertEvent>> {
        let rows = sqlx::query_as::<_, ShockAlertEvent>(
            "SELECT device_id, shock_g, lat, lon, device_ts, received_at
             FROM shock_alerts
             WHERE device_id = $1
             ORDER BY received_at DESC
             LIMIT $2",
        )
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn devices_seen_since(&self, since: DateTime<Utc>) -> Result<Vec<DeviceSummary>> {
        let rows = sqlx::query_as::<_, DeviceSummary>(
            "SELECT device_id, MAX(received_at) AS last_seen, COUNT(*) AS readings
             FROM readings
             WHERE received_at >= $1
             GROUP BY device_id
             ORDER BY last_seen DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        with_transient_retry("insert reading", || async {
            sqlx::query(
                "INSERT INTO readings (device_id, temperature, humidity, shock_g, lat, lon,
                                       battery, door_open, device_ts, received_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&reading.device_id)
            .bind(reading.temperature)
            .bind(reading.humidity)
            .bind(reading.shock_g)
            .bind(reading.lat)
            .bind(reading.lon)
            .bind(reading.battery)
            .bind(reading.door_open)
            .bind(reading.device_ts)
            .bind(reading.received_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn insert_shock_alert(&self, event: &ShockAlertEvent) -> Result<()> {
        with_transient_retry("insert shock alert", || async {
            sqlx::query(
                "INSERT INTO shock_alerts (device_id, shock_g, lat, lon, device_ts, received_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&event.device_id)
            .bind(event.shock_g)
            .bind(event.lat)
            .bind(event.lon)
            .bind(event.device_ts)
            .bind(event.received_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

/// Retry an insert on transient connection-level failures, with exponential
/// backoff. Anything else fails immediately.
async fn with_transient_retry<F, Fut>(what: &str, op: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => match &e {
                Error::Database(db_err) => {
                    if attempts >= max_attempts || !is_transient_error(db_err) {
                        error!("{} failed permanently after {} attempts: {}", what, attempts, e);
                        DB_FAILURES_TOTAL.inc();
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        what, attempts, max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("{} failed with non-database error: {}", what, e);
                    return Err(e);
                }
            },
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-related SQLSTATE classes only
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
