//! Time source and tenant-local calendar arithmetic.
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

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

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Calendar of a tenant expressed as a fixed offset from UTC.
#[derive(Debug, Clone, Copy)]
pub struct LocalCalendar {
    offset_secs: i64,
}

impl LocalCalendar {
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let minutes = minutes.clamp(-14 * 60, 14 * 60);
        Self {
            offset_secs: i64::from(minutes) * 60,
        }
    }

    pub fn utc() -> Self {
        Self::from_offset_minutes(0)
    }

    pub fn local_datetime(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.naive_utc() + Duration::seconds(self.offset_secs)
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.local_datetime(instant).date()
    }

    pub fn today(&self, clock: &dyn Clock) -> NaiveDate {
        self.local_date(clock.now())
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&(local - Duration::seconds(self.offset_secs)))
    }

    /// UTC instants `[start, end)` covering the local day.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.to_utc(date.and_time(NaiveTime::default()));
        (start, start + Duration::days(1))
    }

    /// UTC instant of `hour:00` local on `date`.
    pub fn at_hour(&self, date: NaiveDate, hour: u32) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
        self.to_utc(date.and_time(time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn local_date_crosses_midnight() {
        let sao_paulo = LocalCalendar::from_offset_minutes(-180);
        let instant = utc("2026-03-10T01:30:00Z");
        assert_eq!(
            sao_paulo.local_date(instant),
            NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
        );
        assert_eq!(
            LocalCalendar::utc().local_date(instant),
            NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
        );
    }

    #[test]
    fn day_bounds_and_send_hour() {
        let cal = LocalCalendar::from_offset_minutes(-180);
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let (start, end) = cal.day_bounds(day);
        assert_eq!(start, utc("2026-03-10T03:00:00Z"));
        assert_eq!(end, utc("2026-03-11T03:00:00Z"));
        assert_eq!(cal.at_hour(day, 9), utc("2026-03-10T12:00:00Z"));
        assert_eq!(cal.local_date(cal.at_hour(day, 23)), day);
    }

    #[test]
    fn fixed_clock_today() {
        let clock = FixedClock(utc("2026-03-10T12:00:00Z"));
        let cal = LocalCalendar::from_offset_minutes(60);
        assert_eq!(cal.today(&clock), NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
    }
}
