use chrono::{NaiveDateTime, SubsecRound, Utc};

pub mod cursor;

/// Current UTC time at the microsecond precision Postgres stores.
pub fn now_utc() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(6)
}
