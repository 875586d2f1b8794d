use std::fs;
use std::io;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::mqtt::{SensorFeed, SensorMessage, TransportError};

#[derive(Debug, Clone, Deserialize)]
struct ScriptFile {
    #[serde(default = "default_loop")]
    loop_forever: bool,
    #[serde(default)]
    interval_ms: u64,
    messages: Vec<ScriptEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptEvent {
    topic: Option<String>,
    payload: Option<String>,
    error: Option<String>,
}

fn default_loop() -> bool {
    true
}

/// Replays a scripted sequence of sensor messages and transport failures
/// from a JSON file, for running without a broker.
#[derive(Debug)]
pub struct SensorDebugFileFeed {
    script: ScriptFile,
    index: usize,
    finished: bool,
}

impl SensorDebugFileFeed {
    pub fn from_file(path: &str) -> Result<Self, TransportError> {
        let content = fs::read_to_string(path)?;
        let script: ScriptFile = serde_json::from_str(&content)?;

        if script.messages.is_empty() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "debug script must contain at least one message",
            )));
        }

        Ok(Self {
            script,
            index: 0,
            finished: false,
        })
    }

    fn next_event(&mut self) -> Option<ScriptEvent> {
        if self.index >= self.script.messages.len() {
            if !self.script.loop_forever {
                return None;
            }
            self.index = 0;
        }

        let event = self.script.messages.get(self.index).cloned();
        self.index = self.index.saturating_add(1);
        event
    }

    fn execute_event(event: ScriptEvent) -> Result<Option<SensorMessage>, TransportError> {
        match (event.topic, event.payload, event.error) {
            (Some(topic), Some(payload), None) => Ok(Some(SensorMessage {
                topic,
                payload: payload.into_bytes(),
            })),
            (None, None, Some(error)) => Err(map_script_error(&error)),
            _ => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "script event must contain either topic and payload, or error",
            ))),
        }
    }
}

fn map_script_error(kind: &str) -> TransportError {
    let normalized = kind.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "timeout" => TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, kind)),
        "broker_unreachable" | "network_unreachable" => {
            TransportError::Io(io::Error::new(io::ErrorKind::NetworkUnreachable, kind))
        }
        "connection_refused" => {
            TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, kind))
        }
        "connection_reset" => {
            TransportError::Io(io::Error::new(io::ErrorKind::ConnectionReset, kind))
        }
        "closed" => TransportError::Closed,
        _ => TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown scripted error kind: {kind}"),
        )),
    }
}

impl SensorFeed for SensorDebugFileFeed {
    fn next_message(&mut self, wait: Duration) -> Result<Option<SensorMessage>, TransportError> {
        let Some(event) = self.next_event() else {
            if !self.finished {
                self.finished = true;
                tracing::info!("sensor debug replay finished");
            }
            std::thread::sleep(wait);
            return Ok(None);
        };

        if self.script.interval_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.script.interval_ms));
        }

        Self::execute_event(event)
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::time::Duration;

    use crate::adapters::mqtt::{SensorFeed, SensorMessage, TransportError};

    use super::SensorDebugFileFeed;

    fn fixture(path: &str) -> String {
        format!(
            "{}/testdata/sensor_replay/{path}",
            env!("CARGO_MANIFEST_DIR").replace("\\", "/")
        )
    }

    fn next(feed: &mut SensorDebugFileFeed) -> Result<Option<SensorMessage>, TransportError> {
        feed.next_message(Duration::from_millis(1))
    }

    #[test]
    fn replays_and_loops_scripted_readings() {
        let mut feed =
            SensorDebugFileFeed::from_file(&fixture("happy_loop.json")).expect("script should load");

        let first = next(&mut feed).expect("first").expect("message");
        let second = next(&mut feed).expect("second").expect("message");
        let third = next(&mut feed).expect("third").expect("message");

        assert_eq!(first.topic, "parkir/slot1");
        assert_eq!(first.payload, b"150.0".to_vec());
        assert_eq!(second.payload, b"4.5".to_vec());
        assert_eq!(third, first);
    }

    #[test]
    fn simulates_transport_failures() {
        let mut feed =
            SensorDebugFileFeed::from_file(&fixture("transport_failures.json")).expect("script");

        match next(&mut feed).expect_err("first event should fail") {
            TransportError::Io(io) => assert_eq!(io.kind(), ErrorKind::NetworkUnreachable),
            other => panic!("expected io error, got {other}"),
        }
        assert!(matches!(
            next(&mut feed).expect_err("second event should fail"),
            TransportError::Closed
        ));
        assert!(next(&mut feed).expect("third").is_some());
    }

    #[test]
    fn goes_quiet_after_single_pass() {
        let mut feed =
            SensorDebugFileFeed::from_file(&fixture("transport_failures.json")).expect("script");

        for _ in 0..3 {
            let _ = next(&mut feed);
        }
        assert!(next(&mut feed).expect("finished feed is idle").is_none());
        assert!(next(&mut feed).expect("finished feed is idle").is_none());
    }

    #[test]
    fn rejects_script_without_messages() {
        match SensorDebugFileFeed::from_file(&fixture("missing_messages.json"))
            .expect_err("empty script should fail")
        {
            TransportError::Io(io) => assert_eq!(io.kind(), ErrorKind::InvalidData),
            other => panic!("expected invalid data io error, got {other}"),
        }
    }

    #[test]
    fn rejects_unknown_error_kind() {
        let mut feed =
            SensorDebugFileFeed::from_file(&fixture("unknown_error_kind.json")).expect("script");

        match next(&mut feed).expect_err("unknown scripted error must fail") {
            TransportError::Io(io) => assert_eq!(io.kind(), ErrorKind::InvalidInput),
            other => panic!("expected invalid input io error, got {other}"),
        }
    }
}
