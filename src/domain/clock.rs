use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, SecondsFormat,
    Utc,
};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Maps instants onto the site's local calendar using a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    offset: FixedOffset,
}

impl LocalCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self, clock: &dyn Clock) -> NaiveDate {
        self.date_of(clock.now())
    }

    pub fn instant_at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        self.from_local(date.and_time(time))
    }

    /// Half-open UTC bounds `[start, end)` of a local calendar day.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.from_local(date.and_time(NaiveTime::MIN));
        (start, start + Duration::days(1))
    }

    pub fn local_time_label(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.offset)
            .format("%H:%M")
            .to_string()
    }

    fn from_local(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::<Utc>::from_naive_utc_and_offset(utc, Utc)
    }
}

/// Parses `+HH:MM`, `-HH:MM` or `Z` into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") {
        return Some(Utc.fix());
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

    use super::{LocalCalendar, format_instant, parse_instant, parse_utc_offset};

    fn jakarta() -> LocalCalendar {
        LocalCalendar::new(parse_utc_offset("+07:00").expect("offset should parse"))
    }

    #[test]
    fn parses_signed_offsets() {
        assert_eq!(
            parse_utc_offset("+07:00").map(|o| o.local_minus_utc()),
            Some(25_200)
        );
        assert_eq!(
            parse_utc_offset("-03:30").map(|o| o.local_minus_utc()),
            Some(-12_600)
        );
        assert_eq!(parse_utc_offset("Z").map(|o| o.local_minus_utc()), Some(0));
        assert!(parse_utc_offset("07:00").is_none());
        assert!(parse_utc_offset("+25:00").is_none());
    }

    #[test]
    fn local_date_follows_offset() {
        let calendar = jakarta();
        let late_utc = Utc.with_ymd_and_hms(2026, 3, 1, 18, 30, 0).unwrap();

        assert_eq!(
            calendar.date_of(late_utc),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );
    }

    #[test]
    fn day_bounds_are_local_midnights() {
        let calendar = jakarta();
        let (start, end) = calendar.day_bounds(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());

        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 17, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap());
    }

    #[test]
    fn instant_at_and_label_round_trip_local_time() {
        let calendar = jakarta();
        let instant = calendar.instant_at(
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        );

        assert_eq!(instant, Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap());
        assert_eq!(calendar.local_time_label(instant), "10:00");
    }

    #[test]
    fn stored_instants_sort_lexicographically() {
        let earlier = format_instant(Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap());
        let later = format_instant(Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap());

        assert_eq!(earlier, "2026-03-02T03:00:00.000Z");
        assert!(earlier < later);
        assert_eq!(
            parse_instant(&earlier),
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap())
        );
    }
}
