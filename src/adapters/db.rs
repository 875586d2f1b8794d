use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::clock::{format_instant, parse_instant};
use crate::domain::models::{
    CarDetails, CarRecord, ControlCommand, LiveStatus, OutboxEntry, ReservationCandidate,
    ReservationRecord, ReservationStatus, SpotRecord,
};
use crate::domain::spot_state::SpotState;

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS spots (
    spot_number TEXT PRIMARY KEY,
    live_status TEXT NOT NULL DEFAULT 'available'
        CHECK (live_status IN ('available', 'occupied', 'disabled')),
    is_disabled INTEGER NOT NULL DEFAULT 0,
    buzzer_active INTEGER NOT NULL DEFAULT 0,
    buzzer_muted INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cars (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    license_plate TEXT NOT NULL,
    brand TEXT NOT NULL,
    model TEXT NOT NULL,
    color TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, license_plate)
);

CREATE TABLE IF NOT EXISTS reservations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    spot_number TEXT NOT NULL REFERENCES spots (spot_number) ON DELETE CASCADE,
    car_id TEXT REFERENCES cars (id) ON DELETE SET NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'canceled')),
    created_at TEXT NOT NULL,
    canceled_at TEXT,
    CHECK (start_time < end_time)
);

CREATE INDEX IF NOT EXISTS idx_reservations_spot_start
ON reservations (spot_number, start_time);

CREATE INDEX IF NOT EXISTS idx_reservations_user_end
ON reservations (user_id, end_time);

CREATE TABLE IF NOT EXISTS command_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    spot_number TEXT NOT NULL,
    command TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_command_outbox_spot
ON command_outbox (spot_number, id);
"#,
)];

const SPOT_COLUMNS: &str =
    "spot_number, live_status, is_disabled, buzzer_active, buzzer_muted, last_updated";

const RESERVATION_SELECT: &str = "SELECT r.id, r.user_id, u.username, r.spot_number,
        r.start_time, r.end_time, r.status, r.created_at,
        c.id, c.user_id, c.license_plate, c.brand, c.model, c.color
     FROM reservations r
     LEFT JOIN users u ON u.id = r.user_id
     LEFT JOIN cars c ON c.id = r.car_id";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

// ---------------------------------------------------------------------------
// spots

/// Inserts missing spots as available; existing rows are left untouched.
pub fn ensure_spots(
    connection: &Connection,
    spot_numbers: &[String],
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let mut statement = connection.prepare(
        "INSERT OR IGNORE INTO spots (spot_number, live_status, last_updated)
         VALUES (?1, 'available', ?2)",
    )?;

    let mut inserted = 0;
    for spot_number in spot_numbers {
        inserted += statement.execute(params![spot_number, format_instant(now)])?;
    }

    Ok(inserted)
}

pub fn get_spot(connection: &Connection, spot_number: &str) -> Result<Option<SpotRecord>, DbError> {
    let spot = connection
        .query_row(
            &format!("SELECT {SPOT_COLUMNS} FROM spots WHERE spot_number = ?1"),
            params![spot_number],
            spot_from_row,
        )
        .optional()?;

    Ok(spot)
}

pub fn list_spots(connection: &Connection) -> Result<Vec<SpotRecord>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {SPOT_COLUMNS} FROM spots
         ORDER BY CAST(spot_number AS INTEGER), spot_number"
    ))?;

    let rows = statement.query_map([], spot_from_row)?;

    let mut spots = Vec::new();
    for row in rows {
        spots.push(row?);
    }

    Ok(spots)
}

pub fn update_spot_state(
    connection: &Connection,
    spot_number: &str,
    state: &SpotState,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE spots
         SET live_status = ?2, is_disabled = ?3, buzzer_active = ?4, buzzer_muted = ?5,
             last_updated = ?6
         WHERE spot_number = ?1",
        params![
            spot_number,
            state.live_status.as_str(),
            state.is_disabled,
            state.buzzer_active,
            state.buzzer_muted,
            format_instant(now),
        ],
    )?;

    Ok(())
}

pub fn count_spots(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM spots", [], |row| row.get(0))?;
    Ok(count)
}

fn spot_from_row(row: &Row<'_>) -> rusqlite::Result<SpotRecord> {
    let live_status: String = row.get(1)?;

    Ok(SpotRecord {
        spot_number: row.get(0)?,
        live_status: LiveStatus::parse(&live_status)
            .ok_or_else(|| invalid_column(1, format!("unknown live status: {live_status}")))?,
        is_disabled: row.get(2)?,
        buzzer_active: row.get(3)?,
        buzzer_muted: row.get(4)?,
        last_updated: instant_column(row, 5)?,
    })
}

// ---------------------------------------------------------------------------
// users & cars

pub fn upsert_user(connection: &Connection, user_id: &str, username: &str) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO users (id, username) VALUES (?1, ?2)
         ON CONFLICT (id) DO UPDATE SET username = excluded.username",
        params![user_id, username],
    )?;

    Ok(())
}

/// Returns the user's car with this plate, creating it from `details` if absent.
pub fn find_or_create_car(
    connection: &Connection,
    user_id: &str,
    details: &CarDetails,
    now: DateTime<Utc>,
) -> Result<CarRecord, DbError> {
    let existing = connection
        .query_row(
            "SELECT id, user_id, license_plate, brand, model, color
             FROM cars WHERE user_id = ?1 AND license_plate = ?2",
            params![user_id, details.license_plate],
            car_from_row,
        )
        .optional()?;

    if let Some(car) = existing {
        return Ok(car);
    }

    let car = CarRecord {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        license_plate: details.license_plate.clone(),
        brand: details.brand.clone(),
        model: details.model.clone(),
        color: details.color.clone(),
    };

    connection.execute(
        "INSERT INTO cars (id, user_id, license_plate, brand, model, color, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            car.id,
            car.user_id,
            car.license_plate,
            car.brand,
            car.model,
            car.color,
            format_instant(now),
        ],
    )?;

    Ok(car)
}

pub fn get_car(connection: &Connection, car_id: &str) -> Result<Option<CarRecord>, DbError> {
    let car = connection
        .query_row(
            "SELECT id, user_id, license_plate, brand, model, color FROM cars WHERE id = ?1",
            params![car_id],
            car_from_row,
        )
        .optional()?;

    Ok(car)
}

/// Deletes a car. Reservations that referenced it keep existing without a car.
pub fn delete_car(connection: &Connection, car_id: &str) -> Result<bool, DbError> {
    let deleted = connection.execute("DELETE FROM cars WHERE id = ?1", params![car_id])?;
    Ok(deleted > 0)
}

fn car_from_row(row: &Row<'_>) -> rusqlite::Result<CarRecord> {
    Ok(CarRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        license_plate: row.get(2)?,
        brand: row.get(3)?,
        model: row.get(4)?,
        color: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// reservations

pub fn insert_reservation(
    connection: &Connection,
    id: &str,
    candidate: &ReservationCandidate,
    car_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO reservations (id, user_id, spot_number, car_id, start_time, end_time, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            candidate.user_id,
            candidate.spot_number,
            car_id,
            format_instant(candidate.start_time),
            format_instant(candidate.end_time),
            ReservationStatus::Active.as_str(),
            format_instant(created_at),
        ],
    )?;

    Ok(())
}

pub fn get_reservation(
    connection: &Connection,
    reservation_id: &str,
) -> Result<Option<ReservationRecord>, DbError> {
    let reservation = connection
        .query_row(
            &format!("{RESERVATION_SELECT} WHERE r.id = ?1"),
            params![reservation_id],
            reservation_from_row,
        )
        .optional()?;

    Ok(reservation)
}

pub fn attach_car(
    connection: &Connection,
    reservation_id: &str,
    car_id: &str,
) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE reservations SET car_id = ?2 WHERE id = ?1",
        params![reservation_id, car_id],
    )?;

    Ok(updated > 0)
}

/// Active reservations that could collide with `candidate`: the user's
/// bookings that have not ended yet and the spot's bookings overlapping the
/// requested interval.
pub fn list_admission_conflicts(
    connection: &Connection,
    candidate: &ReservationCandidate,
    now: DateTime<Utc>,
) -> Result<Vec<ReservationRecord>, DbError> {
    let mut statement = connection.prepare(&format!(
        "{RESERVATION_SELECT}
         WHERE r.status = 'active'
           AND ((r.user_id = ?1 AND r.end_time >= ?2)
             OR (r.spot_number = ?3 AND r.start_time < ?5 AND r.end_time > ?4))
         ORDER BY r.start_time"
    ))?;

    let rows = statement.query_map(
        params![
            candidate.user_id,
            format_instant(now),
            candidate.spot_number,
            format_instant(candidate.start_time),
            format_instant(candidate.end_time),
        ],
        reservation_from_row,
    )?;

    collect_reservations(rows)
}

/// All reservations (any status) starting in `[from, until)`, optionally for one spot.
pub fn list_reservations_starting_between(
    connection: &Connection,
    spot_number: Option<&str>,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<ReservationRecord>, DbError> {
    let mut statement = connection.prepare(&format!(
        "{RESERVATION_SELECT}
         WHERE r.start_time >= ?1 AND r.start_time < ?2
           AND (?3 IS NULL OR r.spot_number = ?3)
         ORDER BY r.start_time, r.id"
    ))?;

    let rows = statement.query_map(
        params![format_instant(from), format_instant(until), spot_number],
        reservation_from_row,
    )?;

    collect_reservations(rows)
}

/// Reservations whose end has not passed, newest start first.
pub fn list_upcoming_reservations(
    connection: &Connection,
    user_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<ReservationRecord>, DbError> {
    let mut statement = connection.prepare(&format!(
        "{RESERVATION_SELECT}
         WHERE r.end_time >= ?1 AND (?2 IS NULL OR r.user_id = ?2)
         ORDER BY r.start_time DESC, r.id"
    ))?;

    let rows = statement.query_map(
        params![format_instant(now), user_id],
        reservation_from_row,
    )?;

    collect_reservations(rows)
}

pub fn has_active_reservation_at(
    connection: &Connection,
    user_id: &str,
    spot_number: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let found: i64 = connection.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM reservations
            WHERE user_id = ?1 AND spot_number = ?2 AND status = 'active'
              AND start_time <= ?3 AND end_time >= ?3
        )",
        params![user_id, spot_number, format_instant(now)],
        |row| row.get(0),
    )?;

    Ok(found != 0)
}

/// Cancels the given reservations; returns how many were still active.
pub fn cancel_reservations(
    connection: &Connection,
    reservation_ids: &[String],
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let mut statement = connection.prepare(
        "UPDATE reservations SET status = 'canceled', canceled_at = ?2
         WHERE id = ?1 AND status = 'active'",
    )?;

    let mut updated = 0;
    for reservation_id in reservation_ids {
        updated += statement.execute(params![reservation_id, format_instant(now)])?;
    }

    Ok(updated)
}

pub fn count_reservations(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM reservations", [], |row| row.get(0))?;
    Ok(count)
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<ReservationRecord> {
    let status: String = row.get(6)?;
    let car_id: Option<String> = row.get(8)?;
    let car = match car_id {
        Some(id) => Some(CarRecord {
            id,
            user_id: row.get(9)?,
            license_plate: row.get(10)?,
            brand: row.get(11)?,
            model: row.get(12)?,
            color: row.get(13)?,
        }),
        None => None,
    };

    Ok(ReservationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        spot_number: row.get(3)?,
        car,
        start_time: instant_column(row, 4)?,
        end_time: instant_column(row, 5)?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| invalid_column(6, format!("unknown reservation status: {status}")))?,
        created_at: instant_column(row, 7)?,
    })
}

fn collect_reservations(
    rows: impl Iterator<Item = rusqlite::Result<ReservationRecord>>,
) -> Result<Vec<ReservationRecord>, DbError> {
    let mut reservations = Vec::new();
    for row in rows {
        reservations.push(row?);
    }

    Ok(reservations)
}

// ---------------------------------------------------------------------------
// command outbox

pub fn enqueue_command(
    connection: &Connection,
    spot_number: &str,
    command: ControlCommand,
    now: DateTime<Utc>,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO command_outbox (spot_number, command, created_at, next_attempt_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![spot_number, command.payload(), format_instant(now)],
    )?;

    Ok(connection.last_insert_rowid())
}

/// The oldest queued command of each spot, when its retry time has come.
/// Later commands for a spot stay queued until the ones before them leave.
pub fn list_ready_commands(
    connection: &Connection,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<OutboxEntry>, DbError> {
    let mut statement = connection.prepare(
        "SELECT o.id, o.spot_number, o.command, o.attempts
         FROM command_outbox o
         JOIN (
             SELECT spot_number, MIN(id) AS head_id
             FROM command_outbox
             GROUP BY spot_number
         ) heads ON heads.head_id = o.id
         WHERE o.next_attempt_at <= ?1
         ORDER BY o.id
         LIMIT ?2",
    )?;

    let rows = statement.query_map(params![format_instant(now), i64::from(limit)], |row| {
        let command: String = row.get(2)?;
        Ok(OutboxEntry {
            id: row.get(0)?,
            spot_number: row.get(1)?,
            command: ControlCommand::from_payload(&command)
                .ok_or_else(|| invalid_column(2, format!("unknown command: {command}")))?,
            attempts: row.get(3)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }

    Ok(entries)
}

pub fn remove_delivered_command(connection: &Connection, command_id: i64) -> Result<(), DbError> {
    connection.execute("DELETE FROM command_outbox WHERE id = ?1", params![command_id])?;
    Ok(())
}

pub fn record_command_failure(
    connection: &Connection,
    command_id: i64,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE command_outbox SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
         WHERE id = ?1",
        params![command_id, error, format_instant(next_attempt_at)],
    )?;

    Ok(())
}

pub fn count_pending_commands(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM command_outbox",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn instant_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_instant(&raw).ok_or_else(|| invalid_column(index, format!("invalid timestamp: {raw}")))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}
