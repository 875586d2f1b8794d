pub mod auth;
pub mod clock;
pub mod models;
pub mod reservation_rules;
pub mod sensor_payload;
pub mod spot_state;
pub mod status_resolver;
