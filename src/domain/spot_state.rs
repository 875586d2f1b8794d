use crate::domain::models::LiveStatus;

pub const DEFAULT_OCCUPANCY_THRESHOLD_CM: f64 = 10.0;

/// Mutable per-spot flags. `is_disabled` implies `Disabled` with the buzzer off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotState {
    pub live_status: LiveStatus,
    pub is_disabled: bool,
    pub buzzer_active: bool,
    pub buzzer_muted: bool,
}

impl SpotState {
    pub fn available() -> Self {
        Self {
            live_status: LiveStatus::Available,
            is_disabled: false,
            buzzer_active: false,
            buzzer_muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingOutcome {
    StateChanged { previous: SpotState, next: SpotState },
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupancyRules {
    threshold_cm: f64,
}

impl OccupancyRules {
    pub fn new(threshold_cm: f64) -> Self {
        Self { threshold_cm }
    }

    pub fn apply_distance(&self, state: SpotState, distance_cm: f64) -> ReadingOutcome {
        let next = if state.is_disabled {
            SpotState {
                live_status: LiveStatus::Disabled,
                is_disabled: true,
                buzzer_active: false,
                buzzer_muted: false,
            }
        } else if distance_cm < self.threshold_cm {
            arrive(state)
        } else {
            depart(state)
        };

        if next == state {
            ReadingOutcome::NoOp
        } else {
            ReadingOutcome::StateChanged {
                previous: state,
                next,
            }
        }
    }
}

impl Default for OccupancyRules {
    fn default() -> Self {
        Self::new(DEFAULT_OCCUPANCY_THRESHOLD_CM)
    }
}

fn arrive(state: SpotState) -> SpotState {
    if state.live_status == LiveStatus::Occupied {
        return state;
    }

    SpotState {
        live_status: LiveStatus::Occupied,
        is_disabled: false,
        buzzer_active: !state.buzzer_muted,
        buzzer_muted: state.buzzer_muted,
    }
}

fn depart(state: SpotState) -> SpotState {
    if state.live_status == LiveStatus::Available && !state.buzzer_active && !state.buzzer_muted {
        return state;
    }

    // Leaving re-arms the buzzer for the next car.
    SpotState::available()
}

pub fn set_disabled(state: SpotState, disabled: bool) -> SpotState {
    if disabled {
        SpotState {
            live_status: LiveStatus::Disabled,
            is_disabled: true,
            buzzer_active: false,
            buzzer_muted: false,
        }
    } else if state.is_disabled || state.live_status == LiveStatus::Disabled {
        SpotState::available()
    } else {
        state
    }
}

/// Silences the buzzer; while a car is parked the silence holds until it leaves.
pub fn mute_buzzer(state: SpotState) -> SpotState {
    SpotState {
        buzzer_active: false,
        buzzer_muted: state.live_status == LiveStatus::Occupied,
        ..state
    }
}

#[cfg(test)]
mod tests {
    use super::{OccupancyRules, ReadingOutcome, SpotState, mute_buzzer, set_disabled};
    use crate::domain::models::LiveStatus;

    fn next_state(rules: &OccupancyRules, state: SpotState, distance_cm: f64) -> SpotState {
        match rules.apply_distance(state, distance_cm) {
            ReadingOutcome::StateChanged { next, .. } => next,
            ReadingOutcome::NoOp => state,
        }
    }

    #[test]
    fn arrival_triggers_buzzer() {
        let rules = OccupancyRules::default();
        let state = next_state(&rules, SpotState::available(), 5.0);

        assert_eq!(state.live_status, LiveStatus::Occupied);
        assert!(state.buzzer_active);
        assert!(!state.buzzer_muted);
    }

    #[test]
    fn threshold_is_strict() {
        let rules = OccupancyRules::new(10.0);

        assert_eq!(
            rules.apply_distance(SpotState::available(), 10.0),
            ReadingOutcome::NoOp
        );
        assert_eq!(
            next_state(&rules, SpotState::available(), 9.99).live_status,
            LiveStatus::Occupied
        );
    }

    #[test]
    fn repeated_reading_is_a_no_op() {
        let rules = OccupancyRules::default();
        let occupied = next_state(&rules, SpotState::available(), 5.0);

        assert_eq!(rules.apply_distance(occupied, 5.0), ReadingOutcome::NoOp);
        assert_eq!(rules.apply_distance(occupied, 7.5), ReadingOutcome::NoOp);
        assert_eq!(
            rules.apply_distance(SpotState::available(), 150.0),
            ReadingOutcome::NoOp
        );
    }

    #[test]
    fn muted_buzzer_holds_until_departure() {
        let rules = OccupancyRules::default();

        let available = next_state(&rules, SpotState::available(), 150.0);
        assert_eq!(available, SpotState::available());

        let occupied = next_state(&rules, available, 5.0);
        assert!(occupied.buzzer_active);

        let muted = mute_buzzer(occupied);
        assert!(!muted.buzzer_active);
        assert!(muted.buzzer_muted);

        assert_eq!(rules.apply_distance(muted, 5.0), ReadingOutcome::NoOp);

        let departed = next_state(&rules, muted, 150.0);
        assert_eq!(departed.live_status, LiveStatus::Available);
        assert!(!departed.buzzer_active);
        assert!(!departed.buzzer_muted);

        let next_car = next_state(&rules, departed, 5.0);
        assert!(next_car.buzzer_active);
    }

    #[test]
    fn muting_an_empty_spot_does_not_silence_next_arrival() {
        let rules = OccupancyRules::default();
        let muted = mute_buzzer(SpotState::available());

        assert!(!muted.buzzer_muted);
        assert!(next_state(&rules, muted, 5.0).buzzer_active);
    }

    #[test]
    fn disabled_spot_ignores_sensor_input() {
        let rules = OccupancyRules::default();
        let occupied = next_state(&rules, SpotState::available(), 5.0);
        let disabled = set_disabled(occupied, true);

        assert_eq!(disabled.live_status, LiveStatus::Disabled);
        assert!(!disabled.buzzer_active);
        assert_eq!(rules.apply_distance(disabled, 5.0), ReadingOutcome::NoOp);
        assert_eq!(rules.apply_distance(disabled, 150.0), ReadingOutcome::NoOp);
    }

    #[test]
    fn disabled_reading_repairs_buzzer_flag() {
        let rules = OccupancyRules::default();
        let inconsistent = SpotState {
            live_status: LiveStatus::Disabled,
            is_disabled: true,
            buzzer_active: true,
            buzzer_muted: false,
        };

        assert_eq!(
            next_state(&rules, inconsistent, 5.0),
            set_disabled(inconsistent, true)
        );
    }

    #[test]
    fn enabling_resets_to_available() {
        let disabled = set_disabled(SpotState::available(), true);
        let enabled = set_disabled(disabled, false);

        assert_eq!(enabled, SpotState::available());
    }

    #[test]
    fn enabling_an_enabled_spot_keeps_live_state() {
        let rules = OccupancyRules::default();
        let occupied = next_state(&rules, SpotState::available(), 5.0);

        assert_eq!(set_disabled(occupied, false), occupied);
    }
}
