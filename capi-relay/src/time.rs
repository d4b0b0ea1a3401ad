use time::OffsetDateTime;

pub trait TimeSource {
    fn current_time(&self) -> OffsetDateTime;

    // Whole unix seconds, as expected by the Conversions API
    fn unix_seconds(&self) -> i64 {
        self.current_time().unix_timestamp()
    }
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
