//! Aggregation window function.
//!
//! Given a symbol, a target timeframe, and one boundary-aligned window,
//! reads the rows of the source rung inside `[start, end)`, combines them
//! into a single OHLCV bar, grades completeness, and upserts the derived
//! row. Re-running the same window is idempotent. The outcome always
//! carries `source_count`, even when nothing is stored: the catchup
//! controller uses it to detect the data frontier.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::{
    config::QualityPolicy,
    errors::EngineError,
    models::NewDerivedBar,
    timeframe::{self, Timeframe},
    tz,
};

/// One window-aggregation request.
#[derive(Debug, Clone)]
pub struct WindowSpec<'a> {
    /// Canonical symbol.
    pub symbol: &'a str,
    /// Timeframe being produced.
    pub target: Timeframe,
    /// Rung the rows are read from.
    pub source: Timeframe,
    /// Window start; must sit on a `target` boundary.
    pub start: DateTime<Utc>,
    /// Version tag written into the derived row.
    pub derivation_version: i32,
}

/// Why a window produced no stored bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Too few rows to grade at all.
    InsufficientRows,
    /// Graded score 0: evaluated, but too incomplete to store.
    PoorQuality,
}

/// Result of evaluating one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    /// Whether a derived bar was written.
    pub stored: bool,
    /// Source rows found in the window. Always populated.
    pub source_count: i64,
    /// Grade of the stored bar; `None` when nothing was stored.
    pub quality_score: Option<i32>,
    /// Set when `stored` is false and rows existed but were too few.
    pub skip: Option<SkipReason>,
}

/// A source row inside the window, time-ordered.
#[derive(Debug, Clone, Queryable)]
pub struct WindowRow {
    /// Row timestamp (window start of the finer bar).
    pub ts_utc: String,
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// Number of trades.
    pub trade_count: i64,
}

/// Combined OHLCV values for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Ohlcv {
    /// First row's open by time order.
    pub open: f64,
    /// Maximum high.
    pub high: f64,
    /// Minimum low.
    pub low: f64,
    /// Last row's close by time order.
    pub close: f64,
    /// Summed volume.
    pub volume: f64,
    /// Summed trade count.
    pub trade_count: i64,
}

/// Combine time-ordered rows into one bar. `None` when `rows` is empty.
pub fn combine(rows: &[WindowRow]) -> Option<Ohlcv> {
    let first = rows.first()?;
    let last = rows.last()?;

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    let mut trade_count = 0;
    for row in rows {
        high = high.max(row.high);
        low = low.min(row.low);
        volume += row.volume;
        trade_count += row.trade_count;
    }

    Some(Ohlcv {
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        trade_count,
    })
}

/// Evaluate one window: read, combine, grade, upsert.
///
/// Errors on a misaligned window start (programming invariant) or a store
/// failure. A quality skip is not an error: the outcome records it and the
/// cursor still advances past the window.
pub fn aggregate_window(
    conn: &mut SqliteConnection,
    spec: &WindowSpec<'_>,
    policy: &QualityPolicy,
) -> Result<WindowOutcome, EngineError> {
    if !spec.target.is_aligned(spec.start) {
        return Err(EngineError::Invariant(format!(
            "window start {} is not aligned to {}",
            tz::to_rfc3339_millis(spec.start),
            spec.target
        )));
    }

    let end = spec.start + spec.target.duration();
    let rows = read_window_rows(conn, spec.symbol, spec.source, spec.start, end)?;
    let source_count = rows.len() as i64;

    let expected = spec.target.expected_rows_from(spec.source)?;
    let score = match policy.score(source_count, expected) {
        None => {
            let skip = if source_count > 0 {
                Some(SkipReason::InsufficientRows)
            } else {
                None
            };
            return Ok(WindowOutcome {
                stored: false,
                source_count,
                quality_score: None,
                skip,
            });
        }
        // Score 0 is a grade, not a bar: the window counts as evaluated
        // but nothing is stored.
        Some(0) => {
            return Ok(WindowOutcome {
                stored: false,
                source_count,
                quality_score: Some(0),
                skip: Some(SkipReason::PoorQuality),
            });
        }
        Some(score) => score,
    };

    let bar = combine(&rows).ok_or_else(|| {
        // A positive score implies at least one row; the policy floor and
        // combine() must agree on that.
        EngineError::Invariant("scored window produced no combined bar".into())
    })?;

    let new_row = NewDerivedBar {
        canonical_symbol: spec.symbol,
        timeframe: timeframe::db::to_db_string(spec.target),
        ts_utc: tz::to_rfc3339_millis(spec.start),
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
        trade_count: bar.trade_count,
        quality_score: score,
        source_timeframe: timeframe::db::to_db_string(spec.source),
        source_row_count: source_count,
        derivation_version: spec.derivation_version,
    };

    {
        use crate::schema::derived_bars::dsl as db_;
        diesel::insert_into(db_::derived_bars)
            .values(&new_row)
            .on_conflict((db_::canonical_symbol, db_::timeframe, db_::ts_utc))
            .do_update()
            .set(&new_row)
            .execute(conn)?;
    }

    Ok(WindowOutcome {
        stored: true,
        source_count,
        quality_score: Some(score),
        skip: None,
    })
}

/// Load the time-ordered rows of `source` inside `[start, end)`.
///
/// The first rung reads the source store; higher rungs read lower-derived
/// rows. A finer timeframe never lives in the derived store.
pub fn read_window_rows(
    conn: &mut SqliteConnection,
    symbol: &str,
    source: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<WindowRow>, EngineError> {
    let start_s = tz::to_rfc3339_millis(start);
    let end_s = tz::to_rfc3339_millis(end);
    let source_code = timeframe::db::to_db_string(source);

    let rows = if source == Timeframe::FINEST {
        use crate::schema::source_bars::dsl::*;
        source_bars
            .filter(canonical_symbol.eq(symbol))
            .filter(timeframe.eq(source_code))
            .filter(ts_utc.ge(&start_s))
            .filter(ts_utc.lt(&end_s))
            .order(ts_utc.asc())
            .select((ts_utc, open, high, low, close, volume, trade_count))
            .load::<WindowRow>(conn)?
    } else {
        use crate::schema::derived_bars::dsl::*;
        derived_bars
            .filter(canonical_symbol.eq(symbol))
            .filter(timeframe.eq(source_code))
            .filter(ts_utc.ge(&start_s))
            .filter(ts_utc.lt(&end_s))
            .order(ts_utc.asc())
            .select((ts_utc, open, high, low, close, volume, trade_count))
            .load::<WindowRow>(conn)?
    };

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: &str, open: f64, high: f64, low: f64, close: f64) -> WindowRow {
        WindowRow {
            ts_utc: ts.to_string(),
            open,
            high,
            low,
            close,
            volume: 10.0,
            trade_count: 3,
        }
    }

    #[test]
    fn combine_takes_first_open_last_close_and_extrema() {
        let rows = vec![
            row("2024-01-02T10:00:00.000Z", 1.10, 1.12, 1.09, 1.11),
            row("2024-01-02T10:01:00.000Z", 1.11, 1.15, 1.10, 1.14),
            row("2024-01-02T10:02:00.000Z", 1.14, 1.14, 1.05, 1.07),
        ];
        let bar = combine(&rows).expect("bar");
        assert_eq!(bar.open, 1.10);
        assert_eq!(bar.close, 1.07);
        assert_eq!(bar.high, 1.15);
        assert_eq!(bar.low, 1.05);
        assert_eq!(bar.volume, 30.0);
        assert_eq!(bar.trade_count, 9);
    }

    #[test]
    fn combine_of_empty_is_none() {
        assert!(combine(&[]).is_none());
    }

    #[test]
    fn combine_single_row_is_that_row() {
        let rows = vec![row("2024-01-02T10:00:00.000Z", 1.2, 1.3, 1.1, 1.25)];
        let bar = combine(&rows).unwrap();
        assert_eq!(bar.open, 1.2);
        assert_eq!(bar.close, 1.25);
        assert_eq!(bar.high, 1.3);
        assert_eq!(bar.low, 1.1);
    }
}
