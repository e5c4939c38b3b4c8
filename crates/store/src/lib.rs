use std::str::FromStr;
use std::time::Duration;

use fleetlock_contracts::{Command, CommandKind, CommandStatus, PositionSample, Vehicle};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

mod access;
mod commands;
mod positions;
mod registry;

pub use positions::{NewPosition, PositionPage};

#[derive(Debug)]
pub enum StoreError {
    /// Malformed or out-of-range input; user-correctable.
    InvalidArgument(&'static str),
    /// Telemetry for an IMEI that no vehicle is registered under.
    UnknownDevice,
    /// The vehicle does not exist or is owned by another tenant. The two
    /// cases are deliberately indistinguishable here; see `assert_ownership`.
    NotAccessible,
    /// Unknown command id on a status transition.
    CommandNotFound,
    /// The IMEI is already registered to a vehicle.
    Conflict,
    /// Attempt to leave a terminal command status, or to skip the state
    /// machine in some other way.
    InvalidTransition,
    Timeout,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidArgument(reason) => write!(f, "invalid argument: {}", reason),
            StoreError::UnknownDevice => write!(f, "imei is not registered"),
            StoreError::NotAccessible => write!(f, "vehicle not found or not accessible"),
            StoreError::CommandNotFound => write!(f, "command not found"),
            StoreError::Conflict => write!(f, "imei is already registered"),
            StoreError::InvalidTransition => write!(f, "command status transition is not allowed"),
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// Shared handle over the vehicles/positions/commands tables. Cloning is
/// cheap; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: sqlx::SqlitePool,
    write_timeout: Duration,
}

impl Store {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal);

        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            SqlitePoolOptions::new().max_connections(8).connect_with(options),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    pub(crate) fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
}

pub async fn migrate(pool: &sqlx::SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn vehicle_from_row(row: &SqliteRow) -> Result<Vehicle, StoreError> {
    Ok(Vehicle {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        plate: row.try_get("plate")?,
        imei: row.try_get("imei")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn position_from_row(row: &SqliteRow) -> Result<PositionSample, StoreError> {
    Ok(PositionSample {
        id: row.try_get("id")?,
        imei: row.try_get("imei")?,
        recorded_at: row.try_get("recorded_at")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        speed: row.try_get("speed")?,
        event: row.try_get("event")?,
    })
}

pub(crate) fn command_from_row(row: &SqliteRow) -> Result<Command, StoreError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = CommandKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::Sqlx(sqlx::Error::Decode("unrecognized command kind".into())))?;

    let status_raw: String = row.try_get("status")?;
    let status = CommandStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::Sqlx(sqlx::Error::Decode("unrecognized command status".into()))
    })?;

    Ok(Command {
        id: row.try_get("id")?,
        vehicle_id: row.try_get("vehicle_id")?,
        kind,
        status,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Maps a unique-constraint violation (duplicate IMEI) to `Conflict`. The
/// constraint lives in the schema, so two concurrent registrations can never
/// both succeed regardless of interleaving.
pub(crate) fn conflict_on_unique(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
        _ => StoreError::Sqlx(err),
    }
}
