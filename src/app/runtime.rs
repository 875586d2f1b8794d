use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread::JoinHandle;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db;
use crate::adapters::mqtt::{
    BrokerEndpoint, CommandPublisher, MqttCommandPublisher, MqttSensorFeed, SensorFeed,
    SensorMessage, TransportError,
};
use crate::adapters::sensor_debug_file::SensorDebugFileFeed;
use crate::app::config::{AppConfig, SensorSource};
use crate::app::error::AppError;
use crate::app::services::{CommandOutbox, ServiceError, SpotRegistry, SqliteParkingService};
use crate::domain::clock::{Clock, LocalCalendar, SystemClock};
use crate::domain::sensor_payload::{PayloadError, SensorTopicMap, parse_distance};
use crate::domain::spot_state::{OccupancyRules, ReadingOutcome};

const INGEST_POLL_WAIT: Duration = Duration::from_secs(1);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const STOP_CHECK_SLICE: Duration = Duration::from_millis(100);
const OUTBOX_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message on unmapped topic {0}")]
    UnknownTopic(String),
    #[error("invalid payload on {topic}: {source}")]
    InvalidPayload {
        topic: String,
        #[source]
        source: PayloadError,
    },
    #[error("spot {0} is not registered")]
    UnknownSpot(String),
    #[error("failed to store reading: {0}")]
    Storage(#[source] ServiceError),
    #[error("sensor transport failed: {0}")]
    Transport(#[source] TransportError),
}

/// Per-class counters for readings seen by the ingest loop.
#[derive(Debug, Default)]
pub struct IngestStats {
    applied: AtomicU64,
    unchanged: AtomicU64,
    unknown_topic: AtomicU64,
    invalid_payload: AtomicU64,
    unknown_spot: AtomicU64,
    storage_failures: AtomicU64,
    transport_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestStatsSnapshot {
    pub applied: u64,
    pub unchanged: u64,
    pub unknown_topic: u64,
    pub invalid_payload: u64,
    pub unknown_spot: u64,
    pub storage_failures: u64,
    pub transport_failures: u64,
}

impl IngestStats {
    fn record(&self, result: &Result<Option<ReadingOutcome>, IngestError>) {
        let counter = match result {
            Ok(None) => return,
            Ok(Some(ReadingOutcome::StateChanged { .. })) => &self.applied,
            Ok(Some(ReadingOutcome::NoOp)) => &self.unchanged,
            Err(IngestError::UnknownTopic(_)) => &self.unknown_topic,
            Err(IngestError::InvalidPayload { .. }) => &self.invalid_payload,
            Err(IngestError::UnknownSpot(_)) => &self.unknown_spot,
            Err(IngestError::Storage(_)) => &self.storage_failures,
            Err(IngestError::Transport(_)) => &self.transport_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            unknown_topic: self.unknown_topic.load(Ordering::Relaxed),
            invalid_payload: self.invalid_payload.load(Ordering::Relaxed),
            unknown_spot: self.unknown_spot.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct SensorIngestor<F, R> {
    feed: F,
    registry: R,
    topics: SensorTopicMap,
    stats: Arc<IngestStats>,
}

impl<F, R> SensorIngestor<F, R>
where
    F: SensorFeed,
    R: SpotRegistry,
{
    pub fn new(feed: F, registry: R, topics: SensorTopicMap, stats: Arc<IngestStats>) -> Self {
        Self {
            feed,
            registry,
            topics,
            stats,
        }
    }

    /// Pulls at most one message and applies it. `Ok(None)` when the feed was idle.
    pub fn tick(&mut self) -> Result<Option<ReadingOutcome>, IngestError> {
        let result = match self.feed.next_message(INGEST_POLL_WAIT) {
            Ok(Some(message)) => self.apply(message).map(Some),
            Ok(None) => Ok(None),
            Err(error) => Err(IngestError::Transport(error)),
        };

        self.stats.record(&result);
        result
    }

    fn apply(&self, message: SensorMessage) -> Result<ReadingOutcome, IngestError> {
        let spot_number = self
            .topics
            .spot_for_topic(&message.topic)
            .ok_or_else(|| IngestError::UnknownTopic(message.topic.clone()))?;

        let distance_cm =
            parse_distance(&message.payload).map_err(|source| IngestError::InvalidPayload {
                topic: message.topic.clone(),
                source,
            })?;

        self.registry
            .apply_distance_reading(spot_number, distance_cm)
            .map_err(|error| match error {
                ServiceError::NotFound { .. } => IngestError::UnknownSpot(spot_number.to_string()),
                other => IngestError::Storage(other),
            })
    }
}

pub fn start_ingest<F, R>(
    mut ingestor: SensorIngestor<F, R>,
    backoff_max: Duration,
    stop_flag: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, AppError>
where
    F: SensorFeed,
    R: SpotRegistry + Send + 'static,
{
    std::thread::Builder::new()
        .name("sensor-ingest".to_string())
        .spawn(move || {
            let mut backoff = INITIAL_BACKOFF;
            while !stop_flag.load(Ordering::Relaxed) {
                match ingestor.tick() {
                    Ok(_) => backoff = INITIAL_BACKOFF,
                    Err(IngestError::Transport(error)) => {
                        tracing::warn!(
                            error = %error,
                            retry_in_ms = backoff.as_millis() as u64,
                            "sensor transport failed"
                        );
                        sleep_unless_stopped(backoff, &stop_flag);
                        backoff = next_backoff(backoff, backoff_max);
                    }
                    Err(IngestError::Storage(error)) => {
                        tracing::error!(error = %error, "failed to store sensor reading");
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "sensor reading dropped");
                    }
                }
            }
        })
        .map_err(AppError::runtime)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Drains the command outbox onto the control topics.
pub struct OutboxPublisher<O, P> {
    outbox: O,
    publisher: P,
    topics: SensorTopicMap,
    clock: Arc<dyn Clock>,
    backoff_max: Duration,
}

impl<O, P> OutboxPublisher<O, P>
where
    O: CommandOutbox,
    P: CommandPublisher,
{
    pub fn new(
        outbox: O,
        publisher: P,
        topics: SensorTopicMap,
        clock: Arc<dyn Clock>,
        backoff_max: Duration,
    ) -> Self {
        Self {
            outbox,
            publisher,
            topics,
            clock,
            backoff_max,
        }
    }

    /// Publishes queued commands until every spot is either drained or
    /// waiting out a retry. Each round takes the head command of every ready
    /// spot, so a spot with a long backlog never delays the others.
    pub fn drain_once(&mut self) -> Result<DrainReport, ServiceError> {
        let now = self.clock.now();
        let mut report = DrainReport::default();

        loop {
            let ready = self.outbox.ready_commands(now, OUTBOX_BATCH_SIZE)?;
            let delivered_before = report.delivered;

            for entry in ready {
                let topic = self.topics.control_topic(&entry.spot_number);
                match self.publisher.publish(&topic, entry.command.payload()) {
                    Ok(()) => {
                        self.outbox.mark_delivered(entry.id)?;
                        report.delivered += 1;
                        tracing::info!(
                            command_id = entry.id,
                            spot_number = %entry.spot_number,
                            payload = entry.command.payload(),
                            "control command delivered"
                        );
                    }
                    Err(error) => {
                        let attempts = entry.attempts.saturating_add(1);
                        let delay = retry_delay(attempts, self.backoff_max);
                        let next_attempt_at = now + chrono_delay(delay);
                        self.outbox
                            .mark_failed(entry.id, &error.to_string(), next_attempt_at)?;
                        report.failed += 1;
                        tracing::warn!(
                            command_id = entry.id,
                            spot_number = %entry.spot_number,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %error,
                            "control command publish failed"
                        );
                    }
                }
            }

            if report.delivered == delivered_before {
                break;
            }
        }

        Ok(report)
    }
}

pub fn start_outbox_publisher<O, P>(
    mut publisher: OutboxPublisher<O, P>,
    poll_interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, AppError>
where
    O: CommandOutbox + Send + 'static,
    P: CommandPublisher,
{
    std::thread::Builder::new()
        .name("outbox-publisher".to_string())
        .spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                if let Err(error) = publisher.drain_once() {
                    tracing::warn!(error = %error, "outbox drain failed");
                }
                sleep_unless_stopped(poll_interval, &stop_flag);
            }
        })
        .map_err(AppError::runtime)
}

/// API, sensor ingestion and command publishing in one process.
pub fn run(config: AppConfig) -> Result<(), AppError> {
    let wiring = Wiring::prepare(&config)?;
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(IngestStats::default());

    let handles = vec![
        wiring.spawn_ingest(&config, Arc::clone(&stats), Arc::clone(&stop_flag))?,
        wiring.spawn_publisher(&config, Arc::clone(&stop_flag))?,
    ];

    let server_result = serve_http(&config, wiring.api_state(&config, Some(stats)));
    stop_workers(&stop_flag, handles)?;
    server_result
}

pub fn run_api(config: AppConfig) -> Result<(), AppError> {
    let wiring = Wiring::prepare(&config)?;
    let stop_flag = Arc::new(AtomicBool::new(false));

    let handles = vec![wiring.spawn_publisher(&config, Arc::clone(&stop_flag))?];

    let server_result = serve_http(&config, wiring.api_state(&config, None));
    stop_workers(&stop_flag, handles)?;
    server_result
}

pub fn run_ingest(config: AppConfig) -> Result<(), AppError> {
    let wiring = Wiring::prepare(&config)?;
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(IngestStats::default());

    let handle = wiring.spawn_ingest(&config, stats, stop_flag)?;
    handle
        .join()
        .map_err(|_| AppError::runtime("ingest thread panicked"))
}

struct Wiring {
    service: SqliteParkingService,
    topics: SensorTopicMap,
}

impl Wiring {
    fn prepare(config: &AppConfig) -> Result<Self, AppError> {
        let connection = open_database(config)?;
        let service = SqliteParkingService::new(
            connection,
            Arc::new(SystemClock),
            LocalCalendar::new(config.local_utc_offset),
            OccupancyRules::new(config.occupancy_threshold_cm),
        );
        let topics = SensorTopicMap::new(&config.mqtt_topic_prefix, config.spot_numbers.clone());

        Ok(Self { service, topics })
    }

    fn spawn_ingest(
        &self,
        config: &AppConfig,
        stats: Arc<IngestStats>,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, AppError> {
        let feed: Box<dyn SensorFeed> = match &config.sensor_source {
            SensorSource::Mqtt => Box::new(MqttSensorFeed::connect(
                &broker_endpoint(config, "ingest")?,
                self.topics.distance_topics().map(str::to_string).collect(),
            )),
            SensorSource::DebugFile(path) => {
                tracing::info!(path = %path, "replaying sensor readings from debug file");
                Box::new(SensorDebugFileFeed::from_file(path).map_err(AppError::runtime)?)
            }
        };

        let ingestor = SensorIngestor::new(feed, self.service.clone(), self.topics.clone(), stats);
        start_ingest(
            ingestor,
            Duration::from_millis(config.reconnect_backoff_max_ms),
            stop_flag,
        )
    }

    fn spawn_publisher(
        &self,
        config: &AppConfig,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, AppError> {
        let publisher = OutboxPublisher::new(
            self.service.clone(),
            MqttCommandPublisher::new(
                broker_endpoint(config, "publisher")?,
                Duration::from_millis(config.publish_timeout_ms),
            ),
            self.topics.clone(),
            Arc::new(SystemClock),
            Duration::from_millis(config.reconnect_backoff_max_ms),
        );

        start_outbox_publisher(
            publisher,
            Duration::from_millis(config.outbox_poll_interval_ms),
            stop_flag,
        )
    }

    fn api_state(&self, config: &AppConfig, ingest_stats: Option<Arc<IngestStats>>) -> ApiState {
        ApiState {
            service: self.service.clone(),
            booking_horizon_days: config.booking_horizon_days,
            ingest_stats,
        }
    }
}

fn open_database(config: &AppConfig) -> Result<Arc<Mutex<Connection>>, AppError> {
    if let Some(parent) = std::path::Path::new(&config.db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(AppError::database_init)?;
    }

    let mut connection = db::open_connection(&config.db_path).map_err(AppError::database_init)?;
    db::run_migrations(&mut connection).map_err(AppError::database_init)?;

    let seeded = db::ensure_spots(&connection, &config.spot_numbers, SystemClock.now())
        .map_err(AppError::database_init)?;
    tracing::info!(
        db_path = %config.db_path,
        configured_spots = config.spot_numbers.len(),
        seeded,
        "database ready"
    );

    Ok(Arc::new(Mutex::new(connection)))
}

fn serve_http(config: &AppConfig, api_state: ApiState) -> Result<(), AppError> {
    tracing::info!(bind = %config.http_bind, "http server starting");

    let bind = config.http_bind.clone();
    actix_web::rt::System::new()
        .block_on(async move {
            HttpServer::new(move || {
                App::new()
                    .wrap(Cors::permissive())
                    .app_data(web::Data::new(api_state.clone()))
                    .configure(configure_routes)
            })
            .bind(&bind)?
            .run()
            .await
        })
        .map_err(AppError::runtime)
}

fn stop_workers(stop_flag: &AtomicBool, handles: Vec<JoinHandle<()>>) -> Result<(), AppError> {
    stop_flag.store(true, Ordering::Relaxed);

    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            return Err(AppError::runtime(format!("{name} thread panicked")));
        }
    }

    Ok(())
}

fn broker_endpoint(config: &AppConfig, role: &str) -> Result<BrokerEndpoint, AppError> {
    let host = config
        .mqtt_host
        .clone()
        .ok_or_else(|| AppError::config("MQTT_HOST is required"))?;

    Ok(BrokerEndpoint {
        host,
        port: config.mqtt_port,
        client_id: format!("{}-{role}", config.mqtt_client_id),
    })
}

fn sleep_unless_stopped(duration: Duration, stop_flag: &AtomicBool) {
    let mut remaining = duration;
    while !remaining.is_zero() && !stop_flag.load(Ordering::Relaxed) {
        let slice = remaining.min(STOP_CHECK_SLICE);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// 1 s for the first failure, doubling per attempt, capped at `max`.
fn retry_delay(attempts: u32, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    INITIAL_BACKOFF.saturating_mul(1_u32 << exponent).min(max)
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use crate::adapters::mqtt::{CommandPublisher, SensorFeed, SensorMessage, TransportError};
    use crate::app::services::{SpotRegistry, SqliteParkingService};
    use crate::domain::auth::AuthContext;
    use crate::domain::clock::LocalCalendar;
    use crate::domain::models::LiveStatus;
    use crate::domain::sensor_payload::SensorTopicMap;
    use crate::domain::spot_state::{OccupancyRules, ReadingOutcome};
    use crate::test_support::{FixedClock, seeded_connection};

    use super::{
        DrainReport, IngestError, IngestStats, IngestStatsSnapshot, OutboxPublisher,
        SensorIngestor, next_backoff, retry_delay,
    };

    struct ScriptedFeed {
        events: VecDeque<Result<Option<SensorMessage>, TransportError>>,
    }

    impl ScriptedFeed {
        fn new(events: Vec<Result<Option<SensorMessage>, TransportError>>) -> Self {
            Self {
                events: events.into(),
            }
        }
    }

    impl SensorFeed for ScriptedFeed {
        fn next_message(
            &mut self,
            _wait: Duration,
        ) -> Result<Option<SensorMessage>, TransportError> {
            self.events.pop_front().unwrap_or(Ok(None))
        }
    }

    fn reading(topic: &str, payload: &str) -> Result<Option<SensorMessage>, TransportError> {
        Ok(Some(SensorMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }))
    }

    /// Records published commands; fails while `failures_left` is non-zero.
    #[derive(Clone, Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<(String, String)>>>,
        failures_left: Arc<Mutex<usize>>,
    }

    impl CommandPublisher for RecordingPublisher {
        fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
            let mut failures_left = self.failures_left.lock().expect("lock");
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(TransportError::AckTimeout(Duration::from_millis(10)));
            }
            self.published
                .lock()
                .expect("lock")
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, second).unwrap()
    }

    fn service(name: &str, spots: &[&str]) -> (SqliteParkingService, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(at(8, 0, 0)));
        let service = SqliteParkingService::new(
            seeded_connection(name, spots),
            clock.clone(),
            LocalCalendar::utc(),
            OccupancyRules::default(),
        );
        (service, clock)
    }

    fn topics(spots: &[&str]) -> SensorTopicMap {
        SensorTopicMap::new("parkir/slot", spots.iter().copied())
    }

    #[test]
    fn ingest_applies_readings_and_counts_drops() {
        let (service, _) = service("rt-ingest", &["1", "2"]);
        let stats = Arc::new(IngestStats::default());
        let feed = ScriptedFeed::new(vec![
            reading("parkir/slot1", "4.0"),
            reading("parkir/slot1", "4.2"),
            reading("parkir/slot9", "4.0"),
            reading("parkir/slot2", "far"),
            Err(TransportError::Closed),
            reading("parkir/slot2", "120"),
        ]);
        let mut ingestor = SensorIngestor::new(
            feed,
            service.clone(),
            topics(&["1", "2"]),
            Arc::clone(&stats),
        );

        assert!(matches!(
            ingestor.tick(),
            Ok(Some(ReadingOutcome::StateChanged { .. }))
        ));
        assert_eq!(ingestor.tick().expect("tick"), Some(ReadingOutcome::NoOp));
        assert!(matches!(ingestor.tick(), Err(IngestError::UnknownTopic(_))));
        assert!(matches!(
            ingestor.tick(),
            Err(IngestError::InvalidPayload { .. })
        ));
        assert!(matches!(ingestor.tick(), Err(IngestError::Transport(_))));
        assert_eq!(ingestor.tick().expect("tick"), Some(ReadingOutcome::NoOp));
        assert_eq!(ingestor.tick().expect("idle tick"), None);

        assert_eq!(
            service.get_spot("1").expect("spot").live_status,
            LiveStatus::Occupied
        );
        assert_eq!(
            stats.snapshot(),
            IngestStatsSnapshot {
                applied: 1,
                unchanged: 2,
                unknown_topic: 1,
                invalid_payload: 1,
                transport_failures: 1,
                ..IngestStatsSnapshot::default()
            }
        );
    }

    #[test]
    fn ingest_reports_spot_missing_from_registry() {
        let (service, _) = service("rt-unknown-spot", &["1"]);
        let stats = Arc::new(IngestStats::default());
        let feed = ScriptedFeed::new(vec![reading("parkir/slot3", "4.0")]);
        let mut ingestor =
            SensorIngestor::new(feed, service, topics(&["1", "3"]), Arc::clone(&stats));

        assert!(matches!(ingestor.tick(), Err(IngestError::UnknownSpot(spot)) if spot == "3"));
        assert_eq!(stats.snapshot().unknown_spot, 1);
    }

    #[test]
    fn drain_delivers_commands_in_order() {
        let (service, clock) = service("rt-drain", &["5", "7"]);
        service.apply_distance_reading("5", 5.0).expect("reading");
        service.mute_buzzer("5", &AuthContext::admin()).expect("mute");
        service.set_disabled("7", true).expect("disable");
        service.set_disabled("7", false).expect("enable");

        let recorder = RecordingPublisher::default();
        let mut publisher = OutboxPublisher::new(
            service.clone(),
            recorder.clone(),
            topics(&["5", "7"]),
            clock,
            Duration::from_secs(30),
        );

        let report = publisher.drain_once().expect("drain");
        assert_eq!(
            report,
            DrainReport {
                delivered: 3,
                failed: 0
            }
        );
        assert_eq!(
            *recorder.published.lock().expect("lock"),
            vec![
                ("parkir/slot5/buzzer".to_string(), "off".to_string()),
                ("parkir/slot7/buzzer".to_string(), "disabled".to_string()),
                ("parkir/slot7/buzzer".to_string(), "enable".to_string()),
            ]
        );
        assert_eq!(service.diagnostics().expect("diagnostics").pending_commands, 0);
    }

    #[test]
    fn failed_command_holds_back_later_commands_for_same_spot() {
        let (service, clock) = service("rt-drain-retry", &["5", "7"]);
        service.set_disabled("7", true).expect("disable");
        service.set_disabled("7", false).expect("enable");
        service.set_disabled("5", true).expect("disable");

        let recorder = RecordingPublisher::default();
        *recorder.failures_left.lock().expect("lock") = 1;
        let mut publisher = OutboxPublisher::new(
            service.clone(),
            recorder.clone(),
            topics(&["5", "7"]),
            clock.clone(),
            Duration::from_secs(30),
        );

        let first = publisher.drain_once().expect("drain");
        assert_eq!(
            first,
            DrainReport {
                delivered: 1,
                failed: 1
            }
        );
        assert_eq!(
            *recorder.published.lock().expect("lock"),
            vec![("parkir/slot5/buzzer".to_string(), "disabled".to_string())]
        );

        // still inside the 1 s backoff window
        let waiting = publisher.drain_once().expect("drain");
        assert_eq!(waiting, DrainReport::default());
        assert_eq!(recorder.published.lock().expect("lock").len(), 1);

        clock.set(at(8, 0, 1));
        let retried = publisher.drain_once().expect("drain");
        assert_eq!(retried.delivered, 2);
        assert_eq!(
            recorder.published.lock().expect("lock")[1..],
            [
                ("parkir/slot7/buzzer".to_string(), "disabled".to_string()),
                ("parkir/slot7/buzzer".to_string(), "enable".to_string()),
            ]
        );
    }

    #[test]
    fn backlog_on_one_spot_does_not_starve_other_spots() {
        let (service, clock) = service("rt-drain-backlog", &["5", "7"]);
        for toggle in 0..120 {
            service.set_disabled("7", toggle % 2 == 0).expect("toggle");
        }
        service.set_disabled("5", true).expect("disable");

        let recorder = RecordingPublisher::default();
        *recorder.failures_left.lock().expect("lock") = 1;
        let mut publisher = OutboxPublisher::new(
            service.clone(),
            recorder.clone(),
            topics(&["5", "7"]),
            clock,
            Duration::from_secs(30),
        );

        let report = publisher.drain_once().expect("drain");
        assert_eq!(
            report,
            DrainReport {
                delivered: 1,
                failed: 1
            }
        );
        assert_eq!(
            *recorder.published.lock().expect("lock"),
            vec![("parkir/slot5/buzzer".to_string(), "disabled".to_string())]
        );
        assert_eq!(service.diagnostics().expect("diagnostics").pending_commands, 120);
    }

    #[test]
    fn delivered_commands_leave_the_outbox() {
        let (service, clock) = service("rt-drain-retention", &["7"]);
        let recorder = RecordingPublisher::default();
        let mut publisher = OutboxPublisher::new(
            service.clone(),
            recorder.clone(),
            topics(&["7"]),
            clock,
            Duration::from_secs(30),
        );

        for _ in 0..25 {
            service.set_disabled("7", true).expect("disable");
            service.set_disabled("7", false).expect("enable");
            assert_eq!(publisher.drain_once().expect("drain").delivered, 2);
            assert_eq!(service.diagnostics().expect("diagnostics").pending_commands, 0);
        }

        assert_eq!(recorder.published.lock().expect("lock").len(), 50);
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let max = Duration::from_secs(30);

        assert_eq!(retry_delay(1, max), Duration::from_secs(1));
        assert_eq!(retry_delay(2, max), Duration::from_secs(2));
        assert_eq!(retry_delay(5, max), Duration::from_secs(16));
        assert_eq!(retry_delay(6, max), max);
        assert_eq!(retry_delay(200, max), max);
        assert_eq!(
            next_backoff(Duration::from_secs(16), max),
            Duration::from_secs(30)
        );
    }
}
