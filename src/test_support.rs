use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::adapters::db::{ensure_spots, open_connection, run_migrations};
use crate::domain::clock::Clock;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh copy of a migrated template database, unique per call.
pub fn open_test_connection(test_name: &str) -> Connection {
    let template = ensure_template_db();
    let test_db_path = unique_test_db_path(test_name);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    open_connection(test_db_path.to_string_lossy().as_ref()).expect("test db should open")
}

/// Migrated database with `spot_numbers` seeded as available, ready to share.
pub fn seeded_connection(test_name: &str, spot_numbers: &[&str]) -> Arc<Mutex<Connection>> {
    let connection = open_test_connection(test_name);
    let spot_numbers: Vec<String> = spot_numbers.iter().map(ToString::to_string).collect();
    ensure_spots(&connection, &spot_numbers, Utc::now()).expect("spots should be seeded");
    Arc::new(Mutex::new(connection))
}

/// Clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock should be available") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock should be available");
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock should be available")
    }
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    Path::new("./target/testdb")
                        .join(format!("parkwell_template-{}.db", std::process::id()))
                });

            if let Some(parent) = template_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
            }

            let mut connection = open_connection(template_path.to_string_lossy().as_ref())
                .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");

            template_path
        })
        .clone()
}

fn unique_test_db_path(test_name: &str) -> PathBuf {
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    Path::new("./target/testdb")
        .join(format!(
            "{test_name}-{}-{}-{counter}.sqlite",
            std::process::id(),
            Utc::now().timestamp_millis()
        ))
        .to_path_buf()
}
