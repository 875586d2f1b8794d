use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not a number: {0:?}")]
    NotANumber(String),
    #[error("distance out of range: {0}")]
    OutOfRange(f64),
}

/// One inbound topic per spot (`<prefix><spot>`) and one outbound control
/// topic (`<prefix><spot>/buzzer`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorTopicMap {
    prefix: String,
    by_topic: BTreeMap<String, String>,
}

impl SensorTopicMap {
    pub fn new<I, S>(prefix: &str, spot_numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let by_topic = spot_numbers
            .into_iter()
            .map(Into::into)
            .map(|spot_number| (format!("{prefix}{spot_number}"), spot_number))
            .collect();

        Self {
            prefix: prefix.to_string(),
            by_topic,
        }
    }

    pub fn spot_for_topic(&self, topic: &str) -> Option<&str> {
        self.by_topic.get(topic).map(String::as_str)
    }

    pub fn distance_topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic.keys().map(String::as_str)
    }

    pub fn control_topic(&self, spot_number: &str) -> String {
        format!("{}{spot_number}/buzzer", self.prefix)
    }
}

/// Distance in centimeters, sent as an ASCII float.
pub fn parse_distance(payload: &[u8]) -> Result<f64, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let trimmed = text.trim();
    let distance: f64 = trimmed
        .parse()
        .map_err(|_| PayloadError::NotANumber(trimmed.to_string()))?;

    if !distance.is_finite() || distance < 0.0 {
        return Err(PayloadError::OutOfRange(distance));
    }

    Ok(distance)
}
