use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::clock::LocalCalendar;
use crate::domain::models::{LiveStatus, ReservationRecord, ReservationStatus, SpotRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Available,
    Occupied,
    Reserved,
    Disabled,
}

impl DisplayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied => "occupied",
            Self::Reserved => "reserved",
            Self::Disabled => "disabled",
        }
    }
}

/// Display status of `spot` on local `date`.
///
/// Today merges live sensor state with bookings that have not yet ended.
/// Any other day is schedule-only: a single booking starting that day marks
/// the spot reserved whatever its time of day. `reservations` may contain
/// bookings for other spots and days; they are ignored.
pub fn resolve(
    spot: &SpotRecord,
    date: NaiveDate,
    now: DateTime<Utc>,
    calendar: &LocalCalendar,
    reservations: &[ReservationRecord],
) -> DisplayStatus {
    if spot.is_disabled {
        return DisplayStatus::Disabled;
    }

    if date == calendar.date_of(now) && spot.live_status == LiveStatus::Occupied {
        return DisplayStatus::Occupied;
    }

    match reserving_reservation(spot, date, now, calendar, reservations) {
        Some(_) => DisplayStatus::Reserved,
        None => DisplayStatus::Available,
    }
}

/// Earliest booking that makes `spot` show as reserved on `date`.
pub fn reserving_reservation<'a>(
    spot: &SpotRecord,
    date: NaiveDate,
    now: DateTime<Utc>,
    calendar: &LocalCalendar,
    reservations: &'a [ReservationRecord],
) -> Option<&'a ReservationRecord> {
    let is_today = date == calendar.date_of(now);

    reservations
        .iter()
        .filter(|reservation| {
            reservation.spot_number == spot.spot_number
                && calendar.date_of(reservation.start_time) == date
        })
        .filter(|reservation| {
            if is_today {
                reservation.status == ReservationStatus::Active && reservation.end_time >= now
            } else {
                reservation.status != ReservationStatus::Canceled
            }
        })
        .min_by_key(|reservation| reservation.start_time)
}
