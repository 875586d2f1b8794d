use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::auth::AuthContext;
use crate::domain::clock::{Clock, LocalCalendar};
use crate::domain::models::{
    CarDetails, ControlCommand, OutboxEntry, ReservationCandidate, ReservationRecord, SpotRecord,
};
use crate::domain::reservation_rules::{
    BlockedInterval, ConflictReason, blocked_intervals, validate_candidate,
};
use crate::domain::spot_state::{self, OccupancyRules, ReadingOutcome};
use crate::domain::status_resolver::{DisplayStatus, reserving_reservation, resolve};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("not authorized: {0}")]
    Unauthorized(&'static str),
    #[error("booking rejected: {0}")]
    Conflict(#[from] ConflictReason),
}

impl ServiceError {
    fn spot_not_found(spot_number: &str) -> Self {
        Self::NotFound {
            entity: "spot",
            id: spot_number.to_string(),
        }
    }

    fn reservation_not_found(reservation_id: &str) -> Self {
        Self::NotFound {
            entity: "reservation",
            id: reservation_id.to_string(),
        }
    }
}

/// Authoritative live state of every physical spot.
pub trait SpotRegistry {
    fn apply_distance_reading(
        &self,
        spot_number: &str,
        distance_cm: f64,
    ) -> Result<ReadingOutcome, ServiceError>;
    fn set_disabled(&self, spot_number: &str, disabled: bool) -> Result<SpotRecord, ServiceError>;
    fn mute_buzzer(
        &self,
        spot_number: &str,
        requestor: &AuthContext,
    ) -> Result<SpotRecord, ServiceError>;
    fn get_spot(&self, spot_number: &str) -> Result<SpotRecord, ServiceError>;
    fn list_spots(&self) -> Result<Vec<SpotRecord>, ServiceError>;
}

/// Admission and bookkeeping of reservations.
pub trait ReservationLedger {
    fn validate(&self, candidate: &ReservationCandidate) -> Result<(), ServiceError>;
    fn create(
        &self,
        candidate: &ReservationCandidate,
        car: Option<&CarDetails>,
    ) -> Result<ReservationRecord, ServiceError>;
    fn cancel(&self, reservation_ids: &[String], actor: &AuthContext)
    -> Result<usize, ServiceError>;
    fn get_reservation(&self, reservation_id: &str) -> Result<ReservationRecord, ServiceError>;
    fn attach_car(
        &self,
        reservation_id: &str,
        car: &CarDetails,
        actor: &AuthContext,
    ) -> Result<ReservationRecord, ServiceError>;
    fn delete_car(&self, car_id: &str, actor: &AuthContext) -> Result<(), ServiceError>;
    fn list_upcoming(&self, actor: &AuthContext) -> Result<Vec<ReservationRecord>, ServiceError>;
    fn reserved_intervals(
        &self,
        spot_number: &str,
        date: NaiveDate,
    ) -> Result<Vec<BlockedInterval>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotStatusView {
    pub spot: SpotRecord,
    pub status: DisplayStatus,
    pub reserving: Option<ReservationRecord>,
}

pub trait StatusReconciler {
    fn resolve_date(&self, date: NaiveDate) -> Result<Vec<SpotStatusView>, ServiceError>;
}

/// Pending control commands waiting for the publisher. Delivered commands
/// leave the outbox.
pub trait CommandOutbox {
    /// The next command of each spot whose retry time is at or before `now`.
    fn ready_commands(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, ServiceError>;
    fn mark_delivered(&self, command_id: i64) -> Result<(), ServiceError>;
    fn mark_failed(
        &self,
        command_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub schema_version: u32,
    pub spots_count: i64,
    pub reservations_count: i64,
    pub pending_commands: i64,
}

#[derive(Clone)]
pub struct SqliteParkingService {
    connection: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    calendar: LocalCalendar,
    rules: OccupancyRules,
}

impl SqliteParkingService {
    pub fn new(
        connection: Arc<Mutex<Connection>>,
        clock: Arc<dyn Clock>,
        calendar: LocalCalendar,
        rules: OccupancyRules,
    ) -> Self {
        Self {
            connection,
            clock,
            calendar,
            rules,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.calendar.today(self.clock.as_ref())
    }

    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    /// Books on behalf of `requester`. A user booking for themselves also
    /// records the display name their session carries.
    pub fn create_as(
        &self,
        candidate: &ReservationCandidate,
        car: Option<&CarDetails>,
        requester: &AuthContext,
    ) -> Result<ReservationRecord, ServiceError> {
        let username = match (requester.user_id(), requester.username.as_deref()) {
            (Some(user_id), Some(username)) if user_id == candidate.user_id => Some(username),
            _ => None,
        };

        self.admit(candidate, car, username)
    }

    pub fn diagnostics(&self) -> Result<DiagnosticsSnapshot, ServiceError> {
        self.with_connection(|connection| {
            Ok(DiagnosticsSnapshot {
                schema_version: db::schema_version(connection)?,
                spots_count: db::count_spots(connection)?,
                reservations_count: db::count_reservations(connection)?,
                pending_commands: db::count_pending_commands(connection)?,
            })
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }

    /// Runs `op` inside an IMMEDIATE transaction while holding the connection
    /// lock, so check-then-write sequences are serialized against other
    /// threads and other processes sharing the database file.
    fn with_transaction<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;

        let value = op(&transaction)?;
        transaction.commit().map_err(DbError::from)?;

        Ok(value)
    }

    fn admit(
        &self,
        candidate: &ReservationCandidate,
        car: Option<&CarDetails>,
        username: Option<&str>,
    ) -> Result<ReservationRecord, ServiceError> {
        let now = self.clock.now();
        let result = self.with_transaction(|transaction| {
            let spot = db::get_spot(transaction, &candidate.spot_number)?;
            let existing = db::list_admission_conflicts(transaction, candidate, now)?;
            validate_candidate(candidate, spot.as_ref(), &existing, now, &self.calendar)?;

            if let Some(username) = username {
                db::upsert_user(transaction, &candidate.user_id, username)?;
            }

            let car_id = match car {
                Some(details) => {
                    Some(db::find_or_create_car(transaction, &candidate.user_id, details, now)?.id)
                }
                None => None,
            };

            let reservation_id = uuid::Uuid::new_v4().to_string();
            db::insert_reservation(
                transaction,
                &reservation_id,
                candidate,
                car_id.as_deref(),
                now,
            )?;

            Self::load_reservation(transaction, &reservation_id)
        });

        match &result {
            Ok(reservation) => tracing::info!(
                reservation_id = %reservation.id,
                user_id = %reservation.user_id,
                spot_number = %reservation.spot_number,
                start_time = %reservation.start_time,
                end_time = %reservation.end_time,
                "reservation created"
            ),
            Err(ServiceError::Conflict(reason)) => tracing::info!(
                user_id = %candidate.user_id,
                spot_number = %candidate.spot_number,
                reason = reason.code(),
                "reservation rejected"
            ),
            Err(_) => {}
        }

        result
    }

    fn load_spot(connection: &Connection, spot_number: &str) -> Result<SpotRecord, ServiceError> {
        db::get_spot(connection, spot_number)?.ok_or_else(|| ServiceError::spot_not_found(spot_number))
    }

    fn load_reservation(
        connection: &Connection,
        reservation_id: &str,
    ) -> Result<ReservationRecord, ServiceError> {
        db::get_reservation(connection, reservation_id)?
            .ok_or_else(|| ServiceError::reservation_not_found(reservation_id))
    }
}

impl SpotRegistry for SqliteParkingService {
    fn apply_distance_reading(
        &self,
        spot_number: &str,
        distance_cm: f64,
    ) -> Result<ReadingOutcome, ServiceError> {
        let now = self.clock.now();
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        let spot = Self::load_spot(&connection, spot_number)?;

        let outcome = self.rules.apply_distance(spot.state(), distance_cm);
        if let ReadingOutcome::StateChanged { previous, next } = outcome {
            db::update_spot_state(&connection, spot_number, &next, now)?;
            tracing::info!(
                spot_number,
                distance_cm,
                from = previous.live_status.as_str(),
                to = next.live_status.as_str(),
                buzzer_active = next.buzzer_active,
                buzzer_muted = next.buzzer_muted,
                "spot state changed"
            );
        }

        Ok(outcome)
    }

    fn set_disabled(&self, spot_number: &str, disabled: bool) -> Result<SpotRecord, ServiceError> {
        let now = self.clock.now();
        let spot = self.with_transaction(|transaction| {
            let spot = Self::load_spot(transaction, spot_number)?;
            let next = spot_state::set_disabled(spot.state(), disabled);
            if next != spot.state() {
                db::update_spot_state(transaction, spot_number, &next, now)?;
            }

            let command = if disabled {
                ControlCommand::Disabled
            } else {
                ControlCommand::Enable
            };
            db::enqueue_command(transaction, spot_number, command, now)?;

            Self::load_spot(transaction, spot_number)
        })?;

        tracing::info!(spot_number, disabled, "spot disable flag updated");
        Ok(spot)
    }

    fn mute_buzzer(
        &self,
        spot_number: &str,
        requestor: &AuthContext,
    ) -> Result<SpotRecord, ServiceError> {
        let now = self.clock.now();
        let spot = self.with_transaction(|transaction| {
            let spot = Self::load_spot(transaction, spot_number)?;

            let allowed = match requestor.user_id() {
                None => requestor.is_admin(),
                Some(user_id) => {
                    db::has_active_reservation_at(transaction, user_id, spot_number, now)?
                }
            };
            if !allowed {
                return Err(ServiceError::Unauthorized(
                    "buzzer can only be silenced by an admin or the current reservation holder",
                ));
            }

            let next = spot_state::mute_buzzer(spot.state());
            if next != spot.state() {
                db::update_spot_state(transaction, spot_number, &next, now)?;
            }
            db::enqueue_command(transaction, spot_number, ControlCommand::BuzzerOff, now)?;

            Self::load_spot(transaction, spot_number)
        })?;

        tracing::info!(
            spot_number,
            admin = requestor.is_admin(),
            "buzzer silenced"
        );
        Ok(spot)
    }

    fn get_spot(&self, spot_number: &str) -> Result<SpotRecord, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        Self::load_spot(&connection, spot_number)
    }

    fn list_spots(&self) -> Result<Vec<SpotRecord>, ServiceError> {
        self.with_connection(db::list_spots)
    }
}

impl ReservationLedger for SqliteParkingService {
    fn validate(&self, candidate: &ReservationCandidate) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let (spot, existing) = self.with_connection(|connection| {
            Ok((
                db::get_spot(connection, &candidate.spot_number)?,
                db::list_admission_conflicts(connection, candidate, now)?,
            ))
        })?;

        validate_candidate(candidate, spot.as_ref(), &existing, now, &self.calendar)
            .map_err(ServiceError::from)
    }

    fn create(
        &self,
        candidate: &ReservationCandidate,
        car: Option<&CarDetails>,
    ) -> Result<ReservationRecord, ServiceError> {
        self.admit(candidate, car, None)
    }

    fn cancel(
        &self,
        reservation_ids: &[String],
        actor: &AuthContext,
    ) -> Result<usize, ServiceError> {
        if !actor.is_admin() {
            return Err(ServiceError::Unauthorized(
                "only admins can cancel reservations",
            ));
        }

        let now = self.clock.now();
        let updated = self.with_transaction(|transaction| {
            db::cancel_reservations(transaction, reservation_ids, now).map_err(ServiceError::from)
        })?;

        tracing::info!(
            requested = reservation_ids.len(),
            updated,
            "reservations canceled"
        );
        Ok(updated)
    }

    fn get_reservation(&self, reservation_id: &str) -> Result<ReservationRecord, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        Self::load_reservation(&connection, reservation_id)
    }

    fn attach_car(
        &self,
        reservation_id: &str,
        car: &CarDetails,
        actor: &AuthContext,
    ) -> Result<ReservationRecord, ServiceError> {
        let now = self.clock.now();
        self.with_transaction(|transaction| {
            let reservation = Self::load_reservation(transaction, reservation_id)?;
            if !actor.may_act_for(&reservation.user_id) {
                return Err(ServiceError::Unauthorized(
                    "reservation belongs to another user",
                ));
            }

            let car = db::find_or_create_car(transaction, &reservation.user_id, car, now)?;
            db::attach_car(transaction, reservation_id, &car.id)?;

            Self::load_reservation(transaction, reservation_id)
        })
    }

    fn delete_car(&self, car_id: &str, actor: &AuthContext) -> Result<(), ServiceError> {
        self.with_transaction(|transaction| {
            let car = db::get_car(transaction, car_id)?.ok_or_else(|| ServiceError::NotFound {
                entity: "car",
                id: car_id.to_string(),
            })?;
            if !actor.may_act_for(&car.user_id) {
                return Err(ServiceError::Unauthorized("car belongs to another user"));
            }

            db::delete_car(transaction, car_id)?;
            Ok(())
        })
    }

    fn list_upcoming(&self, actor: &AuthContext) -> Result<Vec<ReservationRecord>, ServiceError> {
        let now = self.clock.now();
        let user_filter = if actor.is_admin() {
            None
        } else {
            Some(
                actor
                    .user_id()
                    .ok_or(ServiceError::Unauthorized("an identity is required"))?,
            )
        };

        self.with_connection(|connection| db::list_upcoming_reservations(connection, user_filter, now))
    }

    fn reserved_intervals(
        &self,
        spot_number: &str,
        date: NaiveDate,
    ) -> Result<Vec<BlockedInterval>, ServiceError> {
        let (from, until) = self.calendar.day_bounds(date);
        let reservations = {
            let connection = self
                .connection
                .lock()
                .map_err(|_| ServiceError::DbLockPoisoned)?;
            Self::load_spot(&connection, spot_number)?;
            db::list_reservations_starting_between(&connection, Some(spot_number), from, until)?
        };

        Ok(blocked_intervals(&reservations, &self.calendar))
    }
}

impl StatusReconciler for SqliteParkingService {
    fn resolve_date(&self, date: NaiveDate) -> Result<Vec<SpotStatusView>, ServiceError> {
        let now = self.clock.now();
        let (from, until) = self.calendar.day_bounds(date);
        let (spots, reservations) = self.with_connection(|connection| {
            Ok((
                db::list_spots(connection)?,
                db::list_reservations_starting_between(connection, None, from, until)?,
            ))
        })?;

        Ok(spots
            .into_iter()
            .map(|spot| {
                let status = resolve(&spot, date, now, &self.calendar, &reservations);
                let reserving = match status {
                    DisplayStatus::Reserved => {
                        reserving_reservation(&spot, date, now, &self.calendar, &reservations)
                            .cloned()
                    }
                    _ => None,
                };

                SpotStatusView {
                    spot,
                    status,
                    reserving,
                }
            })
            .collect())
    }
}

impl CommandOutbox for SqliteParkingService {
    fn ready_commands(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxEntry>, ServiceError> {
        self.with_connection(|connection| db::list_ready_commands(connection, now, limit))
    }

    fn mark_delivered(&self, command_id: i64) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::remove_delivered_command(connection, command_id))
    }

    fn mark_failed(
        &self,
        command_id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.with_connection(|connection| {
            db::record_command_failure(connection, command_id, error, next_attempt_at)
        })
    }
}
