use chrono::{DateTime, Utc};

use crate::domain::spot_state::SpotState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveStatus {
    Available,
    Occupied,
    Disabled,
}

impl LiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied => "occupied",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "available" => Some(Self::Available),
            "occupied" => Some(Self::Occupied),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotRecord {
    pub spot_number: String,
    pub live_status: LiveStatus,
    pub is_disabled: bool,
    pub buzzer_active: bool,
    pub buzzer_muted: bool,
    pub last_updated: DateTime<Utc>,
}

impl SpotRecord {
    pub fn state(&self) -> SpotState {
        SpotState {
            live_status: self.live_status,
            is_disabled: self.is_disabled,
            buzzer_active: self.buzzer_active,
            buzzer_muted: self.buzzer_muted,
        }
    }
}

/// Persisted reservation status. `Finished` is never stored, see [`EffectiveStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Active,
    Canceled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStatus {
    Active,
    Canceled,
    Finished,
}

impl EffectiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarDetails {
    pub license_plate: String,
    pub brand: String,
    pub model: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarRecord {
    pub id: String,
    pub user_id: String,
    pub license_plate: String,
    pub brand: String,
    pub model: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationCandidate {
    pub user_id: String,
    pub spot_number: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRecord {
    pub id: String,
    pub user_id: String,
    pub username: Option<String>,
    pub spot_number: String,
    pub car: Option<CarRecord>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

impl ReservationRecord {
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.user_id)
    }
}

/// Payloads understood by the per-spot control device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Disabled,
    Enable,
    BuzzerOff,
}

impl ControlCommand {
    pub fn payload(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enable => "enable",
            Self::BuzzerOff => "off",
        }
    }

    pub fn from_payload(raw: &str) -> Option<Self> {
        match raw {
            "disabled" => Some(Self::Disabled),
            "enable" => Some(Self::Enable),
            "off" => Some(Self::BuzzerOff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub spot_number: String,
    pub command: ControlCommand,
    pub attempts: u32,
}
