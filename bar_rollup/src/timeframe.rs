//! Bar timeframes and UTC window math.
//!
//! The engine supports a fixed ladder of intraday-to-daily frames. All
//! window math is UTC and epoch-anchored: a timestamp belongs to the window
//! whose start is `floor(secs / width) * width` seconds after the Unix
//! epoch, and a bar is labeled by its window *start*, never its end.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::errors::EngineError;

/// Unix epoch start (1970-01-01T00:00:00Z).
pub const EPOCH_UNIX: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// A supported bar timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    /// 1 minute
    M1,
    /// 5 minutes
    M5,
    /// 15 minutes
    M15,
    /// 30 minutes
    M30,
    /// 1 hour
    H1,
    /// 4 hours
    H4,
    /// 1 day
    D1,
}

impl Timeframe {
    /// The finest timeframe the system knows; source bars live here.
    pub const FINEST: Timeframe = Timeframe::M1;

    /// All supported timeframes, finest first.
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Window width in seconds.
    pub const fn secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    /// Window width as a [`chrono::Duration`].
    pub fn duration(self) -> Duration {
        Duration::seconds(self.secs())
    }

    /// Floor a timestamp to the start of the window containing it.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.secs();
        let secs = ts.signed_duration_since(EPOCH_UNIX).num_seconds();
        let start = secs.div_euclid(width) * width;
        Utc.timestamp_opt(start, 0)
            .single()
            .expect("window start is a valid unix timestamp")
    }

    /// True if `ts` sits exactly on a window boundary of this timeframe.
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        self.floor(ts) == ts
    }

    /// Number of source windows expected inside one window of `self`.
    ///
    /// Errors when `source` is not finer than `self` or does not divide it
    /// evenly; such a pair can never form a valid aggregation rung.
    pub fn expected_rows_from(self, source: Timeframe) -> Result<i64, EngineError> {
        if source >= self {
            return Err(EngineError::Config(format!(
                "source timeframe {source} is not finer than {self}"
            )));
        }
        if self.secs() % source.secs() != 0 {
            return Err(EngineError::Config(format!(
                "source timeframe {source} does not divide {self} evenly"
            )));
        }
        Ok(self.secs() / source.secs())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(db::to_db_string(*self))
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        db::from_db_string(s)
    }
}

/// DB round-trip helpers (timeframe column is TEXT: "1m".."1d").
pub mod db {
    use super::*;

    /// Timeframe -> stored code.
    pub fn to_db_string(tf: Timeframe) -> &'static str {
        match tf {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Stored code -> timeframe.
    pub fn from_db_string(s: &str) -> Result<Timeframe, EngineError> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(EngineError::Config(format!("unknown timeframe: {other}"))),
        }
    }
}
