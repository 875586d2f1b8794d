use chrono::FixedOffset;

use crate::app::AppError;
use crate::domain::clock::parse_utc_offset;
use crate::domain::spot_state::DEFAULT_OCCUPANCY_THRESHOLD_CM;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorSource {
    Mqtt,
    DebugFile(String),
}

/// Which workers a process runs; decides whether it talks to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    All,
    Api,
    Ingest,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Api => "api",
            Self::Ingest => "ingest",
        }
    }

    fn publishes_commands(self) -> bool {
        matches!(self, Self::All | Self::Api)
    }

    fn ingests_sensors(self) -> bool {
        matches!(self, Self::All | Self::Ingest)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Absent only when the process never connects to a broker.
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_topic_prefix: String,
    pub spot_numbers: Vec<String>,
    pub occupancy_threshold_cm: f64,
    pub db_path: String,
    pub http_bind: String,
    pub local_utc_offset: FixedOffset,
    pub booking_horizon_days: u32,
    pub publish_timeout_ms: u64,
    pub outbox_poll_interval_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub sensor_source: SensorSource,
}

impl AppConfig {
    pub fn from_env(role: ProcessRole) -> Result<Self, AppError> {
        Self::from_lookup(role, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(role: ProcessRole, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let spot_numbers: Vec<String> = non_empty(&lookup, "SPOT_NUMBERS")
            .unwrap_or_else(|| "1,2,3,4".to_string())
            .split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        if spot_numbers.is_empty() {
            return Err(AppError::config("SPOT_NUMBERS must list at least one spot"));
        }

        let local_utc_offset = match non_empty(&lookup, "LOCAL_UTC_OFFSET") {
            Some(raw) => parse_utc_offset(&raw).ok_or_else(|| {
                AppError::config("LOCAL_UTC_OFFSET must look like +07:00 or -03:30")
            })?,
            None => parse_utc_offset("+07:00")
                .ok_or_else(|| AppError::config("default LOCAL_UTC_OFFSET is invalid"))?,
        };

        let occupancy_threshold_cm =
            parse_or_default(&lookup, "OCCUPANCY_THRESHOLD_CM", DEFAULT_OCCUPANCY_THRESHOLD_CM)?;
        if !occupancy_threshold_cm.is_finite() || occupancy_threshold_cm <= 0.0 {
            return Err(AppError::config(
                "OCCUPANCY_THRESHOLD_CM must be a positive number",
            ));
        }

        let sensor_source = match non_empty(&lookup, "SENSOR_SOURCE").as_deref() {
            None | Some("mqtt") => SensorSource::Mqtt,
            Some("debug_file") => SensorSource::DebugFile(
                non_empty(&lookup, "SENSOR_DEBUG_FILE").ok_or_else(|| {
                    AppError::config("SENSOR_DEBUG_FILE is required when SENSOR_SOURCE=debug_file")
                })?,
            ),
            Some(other) => {
                return Err(AppError::config(format!(
                    "SENSOR_SOURCE must be mqtt or debug_file, got {other}"
                )));
            }
        };

        let needs_broker = role.publishes_commands()
            || (role.ingests_sensors() && sensor_source == SensorSource::Mqtt);
        let mqtt_host = non_empty(&lookup, "MQTT_HOST");
        if needs_broker && mqtt_host.is_none() {
            return Err(AppError::config("MQTT_HOST is required"));
        }

        Ok(Self {
            mqtt_host,
            mqtt_port: parse_or_default(&lookup, "MQTT_PORT", 1883_u16)?,
            mqtt_client_id: non_empty(&lookup, "MQTT_CLIENT_ID")
                .unwrap_or_else(|| "parkwell".to_string()),
            mqtt_topic_prefix: non_empty(&lookup, "MQTT_TOPIC_PREFIX")
                .unwrap_or_else(|| "parkir/slot".to_string()),
            spot_numbers,
            occupancy_threshold_cm,
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/parkwell/parkwell.db".to_string()),
            http_bind: non_empty(&lookup, "HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            local_utc_offset,
            booking_horizon_days: parse_or_default(&lookup, "BOOKING_HORIZON_DAYS", 14_u32)?,
            publish_timeout_ms: parse_or_default(&lookup, "PUBLISH_TIMEOUT_MS", 3000_u64)?,
            outbox_poll_interval_ms: parse_or_default(&lookup, "OUTBOX_POLL_INTERVAL_MS", 1000_u64)?,
            reconnect_backoff_max_ms: parse_or_default(
                &lookup,
                "RECONNECT_BACKOFF_MAX_MS",
                30_000_u64,
            )?,
            sensor_source,
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, ProcessRole, SensorSource};

    #[test]
    fn rejects_missing_mqtt_host() {
        for role in [ProcessRole::All, ProcessRole::Api, ProcessRole::Ingest] {
            let result = AppConfig::from_lookup(role, |_| None);
            assert!(result.is_err());
            assert_eq!(
                result.unwrap_err().to_string(),
                "invalid configuration: MQTT_HOST is required"
            );
        }
    }

    #[test]
    fn replaying_ingest_runs_without_broker() {
        let debug_source = |key: &str| match key {
            "SENSOR_SOURCE" => Some("debug_file".to_string()),
            "SENSOR_DEBUG_FILE" => Some("/tmp/readings.json".to_string()),
            _ => None,
        };

        let ingest = AppConfig::from_lookup(ProcessRole::Ingest, debug_source)
            .expect("replay ingest needs no broker");
        assert_eq!(ingest.mqtt_host, None);

        let combined = AppConfig::from_lookup(ProcessRole::All, debug_source);
        assert_eq!(
            combined.unwrap_err().to_string(),
            "invalid configuration: MQTT_HOST is required"
        );
    }

    #[test]
    fn applies_defaults_for_optional_fields() {
        let result = AppConfig::from_lookup(ProcessRole::All, |key| match key {
            "MQTT_HOST" => Some("192.168.1.13".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        assert_eq!(result.mqtt_host.as_deref(), Some("192.168.1.13"));
        assert_eq!(result.mqtt_port, 1883);
        assert_eq!(result.mqtt_client_id, "parkwell");
        assert_eq!(result.mqtt_topic_prefix, "parkir/slot");
        assert_eq!(result.spot_numbers, vec!["1", "2", "3", "4"]);
        assert_eq!(result.occupancy_threshold_cm, 10.0);
        assert_eq!(result.db_path, "/var/lib/parkwell/parkwell.db");
        assert_eq!(result.http_bind, "0.0.0.0:8080");
        assert_eq!(result.local_utc_offset.local_minus_utc(), 7 * 3600);
        assert_eq!(result.booking_horizon_days, 14);
        assert_eq!(result.publish_timeout_ms, 3000);
        assert_eq!(result.outbox_poll_interval_ms, 1000);
        assert_eq!(result.reconnect_backoff_max_ms, 30_000);
        assert_eq!(result.sensor_source, SensorSource::Mqtt);
    }

    #[test]
    fn parses_spot_list_and_debug_source() {
        let result = AppConfig::from_lookup(ProcessRole::All, |key| match key {
            "MQTT_HOST" => Some("broker".to_string()),
            "SPOT_NUMBERS" => Some(" 5, 7 ,,9 ".to_string()),
            "SENSOR_SOURCE" => Some("debug_file".to_string()),
            "SENSOR_DEBUG_FILE" => Some("/tmp/readings.json".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        assert_eq!(result.spot_numbers, vec!["5", "7", "9"]);
        assert_eq!(
            result.sensor_source,
            SensorSource::DebugFile("/tmp/readings.json".to_string())
        );
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(ProcessRole::All, |key| match key {
            "MQTT_HOST" => Some("broker".to_string()),
            "PUBLISH_TIMEOUT_MS" => Some("abc".to_string()),
            _ => None,
        });

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: PUBLISH_TIMEOUT_MS must be a valid number"
        );
    }

    #[test]
    fn rejects_malformed_offset_and_threshold() {
        let offset = AppConfig::from_lookup(ProcessRole::All, |key| match key {
            "MQTT_HOST" => Some("broker".to_string()),
            "LOCAL_UTC_OFFSET" => Some("Asia/Jakarta".to_string()),
            _ => None,
        });
        assert!(offset.is_err());

        let threshold = AppConfig::from_lookup(ProcessRole::All, |key| match key {
            "MQTT_HOST" => Some("broker".to_string()),
            "OCCUPANCY_THRESHOLD_CM" => Some("0".to_string()),
            _ => None,
        });
        assert!(threshold.is_err());
    }

    #[test]
    fn debug_source_requires_file() {
        let result = AppConfig::from_lookup(ProcessRole::All, |key| match key {
            "MQTT_HOST" => Some("broker".to_string()),
            "SENSOR_SOURCE" => Some("debug_file".to_string()),
            _ => None,
        });

        assert_eq!(
            result.unwrap_err().to_string(),
            "invalid configuration: SENSOR_DEBUG_FILE is required when SENSOR_SOURCE=debug_file"
        );
    }
}
