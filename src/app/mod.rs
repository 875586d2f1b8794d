mod config;
mod error;
mod logging;
pub mod runtime;
pub mod services;

pub use config::{AppConfig, ProcessRole, SensorSource};
pub use error::AppError;

/// API, sensor ingestion and command publishing in one process.
pub fn run() -> Result<(), AppError> {
    runtime::run(bootstrap(ProcessRole::All)?)
}

pub fn run_api() -> Result<(), AppError> {
    runtime::run_api(bootstrap(ProcessRole::Api)?)
}

pub fn run_ingest() -> Result<(), AppError> {
    runtime::run_ingest(bootstrap(ProcessRole::Ingest)?)
}

fn bootstrap(role: ProcessRole) -> Result<AppConfig, AppError> {
    let env_file = dotenvy::dotenv();
    logging::init()?;

    match env_file {
        Ok(path) => tracing::info!(path = %path.display(), "loaded environment file"),
        Err(error) if error.not_found() => {}
        Err(error) => return Err(AppError::config(error)),
    }

    let config = AppConfig::from_env(role)?;

    tracing::info!(
        role = role.as_str(),
        mqtt_host = ?config.mqtt_host,
        mqtt_port = config.mqtt_port,
        mqtt_topic_prefix = %config.mqtt_topic_prefix,
        spots = ?config.spot_numbers,
        occupancy_threshold_cm = config.occupancy_threshold_cm,
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        local_utc_offset = %config.local_utc_offset,
        sensor_source = ?config.sensor_source,
        "application bootstrap initialized"
    );

    Ok(config)
}
