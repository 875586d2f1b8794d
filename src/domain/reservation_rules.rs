use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::clock::LocalCalendar;
use crate::domain::models::{
    EffectiveStatus, ReservationCandidate, ReservationRecord, ReservationStatus, SpotRecord,
};

/// Machine-readable reason a booking was rejected. Checked in declaration order.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    #[error("end time must be after start time")]
    InvalidInterval,
    #[error("spot is unknown or disabled")]
    SpotUnavailable,
    #[error("user already holds an active reservation on this date")]
    DuplicateBookingSameDay,
    #[error("spot is already reserved for an overlapping time")]
    SlotOverlap,
}

impl ConflictReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidInterval => "InvalidInterval",
            Self::SpotUnavailable => "SpotUnavailable",
            Self::DuplicateBookingSameDay => "DuplicateBookingSameDay",
            Self::SlotOverlap => "SlotOverlap",
        }
    }
}

/// Half-open `[start, end)` overlap test.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

pub fn effective_status(
    status: ReservationStatus,
    end_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EffectiveStatus {
    match status {
        ReservationStatus::Canceled => EffectiveStatus::Canceled,
        ReservationStatus::Active if end_time < now => EffectiveStatus::Finished,
        ReservationStatus::Active => EffectiveStatus::Active,
    }
}

/// Runs the admission rules against a snapshot of the spot and of every
/// reservation that shares the candidate's user or spot.
pub fn validate_candidate(
    candidate: &ReservationCandidate,
    spot: Option<&SpotRecord>,
    existing: &[ReservationRecord],
    now: DateTime<Utc>,
    calendar: &LocalCalendar,
) -> Result<(), ConflictReason> {
    if candidate.start_time >= candidate.end_time {
        return Err(ConflictReason::InvalidInterval);
    }

    match spot {
        Some(spot) if !spot.is_disabled => {}
        _ => return Err(ConflictReason::SpotUnavailable),
    }

    let candidate_date = calendar.date_of(candidate.start_time);
    let holds_same_day = existing.iter().any(|reservation| {
        reservation.status == ReservationStatus::Active
            && reservation.user_id == candidate.user_id
            && calendar.date_of(reservation.start_time) == candidate_date
            && reservation.end_time >= now
    });
    if holds_same_day {
        return Err(ConflictReason::DuplicateBookingSameDay);
    }

    let slot_taken = existing.iter().any(|reservation| {
        reservation.status == ReservationStatus::Active
            && reservation.spot_number == candidate.spot_number
            && overlaps(
                reservation.start_time,
                reservation.end_time,
                candidate.start_time,
                candidate.end_time,
            )
    });
    if slot_taken {
        return Err(ConflictReason::SlotOverlap);
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedInterval {
    pub start: String,
    pub end: String,
}

/// Local `HH:MM` labels for every non-canceled reservation, in start order.
pub fn blocked_intervals(
    reservations: &[ReservationRecord],
    calendar: &LocalCalendar,
) -> Vec<BlockedInterval> {
    let mut taken: Vec<&ReservationRecord> = reservations
        .iter()
        .filter(|reservation| reservation.status != ReservationStatus::Canceled)
        .collect();
    taken.sort_by_key(|reservation| reservation.start_time);

    taken
        .into_iter()
        .map(|reservation| BlockedInterval {
            start: calendar.local_time_label(reservation.start_time),
            end: calendar.local_time_label(reservation.end_time),
        })
        .collect()
}
