use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use time::UtcDateTime;

/// Microsecond-precision absolute timestamp, UTC
#[derive(
    Encode,
    Decode,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Debug,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        Self(u64::try_from(UtcDateTime::now().unix_timestamp_nanos() / 1000).expect("Can't fail"))
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn to_micros(self) -> u64 {
        self.0
    }

    /// Convert to datetime, if in range
    pub fn to_datetime(self) -> Option<UtcDateTime> {
        UtcDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1000).ok()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}us", self.0))
    }
}
