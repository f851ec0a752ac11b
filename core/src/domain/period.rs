//! Billing period math.
//!
//! Period boundaries are cut at local midnight in the statement timezone,
//! on `cut_day_of_month` for monthly billing (clamped to the month length)
//! or on Mondays for weekly billing. All arithmetic happens on local dates
//! and only the resulting boundaries are converted back to UTC instants.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Which timezone statement periods are cut in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimezoneSource {
    /// Use the per-user timezone from the identity profile.
    #[default]
    User,
    /// Cut every statement in UTC.
    Utc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    #[default]
    Monthly,
    Weekly,
}

/// Statement period configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodConfig {
    pub period: PeriodKind,
    pub timezone_source: TimezoneSource,
    /// Day of month the monthly period starts on, cut at local midnight.
    pub cut_day_of_month: u32,
    /// Delay between period end and close-out.
    pub grace_period_hours: u32,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            period: PeriodKind::Monthly,
            timezone_source: TimezoneSource::User,
            cut_day_of_month: 1,
            grace_period_hours: 0,
        }
    }
}

/// A half-open `[start, end)` billing period, resolved to UTC instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// IANA timezone name the cut was computed in.
    pub timezone: String,
}

impl BillingPeriod {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// The period for the timestamp containing `ts` in `tz`.
    pub fn containing(ts: DateTime<Utc>, tz: Tz, config: &PeriodConfig) -> Self {
        let local_date = ts.with_timezone(&tz).date_naive();
        let (start_date, end_date) = match config.period {
            PeriodKind::Monthly => monthly_bounds(local_date, config.cut_day_of_month),
            PeriodKind::Weekly => weekly_bounds(local_date),
        };
        Self {
            start: local_midnight_utc(tz, start_date),
            end: local_midnight_utc(tz, end_date),
            timezone: tz.name().to_string(),
        }
    }

    /// The period immediately following this one. Late arrivals for a closed
    /// period accumulate here.
    pub fn next(&self, config: &PeriodConfig) -> Self {
        let tz: Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        Self::containing(self.end, tz, config)
    }
}

/// Monthly period bounds for the given local date, as local dates.
fn monthly_bounds(date: NaiveDate, cut_day: u32) -> (NaiveDate, NaiveDate) {
    let this_cut = cut_of_month(date.year(), date.month(), cut_day);
    let start = if date >= this_cut {
        this_cut
    } else {
        let (y, m) = prev_month(date.year(), date.month());
        cut_of_month(y, m, cut_day)
    };
    let (ny, nm) = next_month(start.year(), start.month());
    (start, cut_of_month(ny, nm, cut_day))
}

/// Weekly periods start on Monday.
fn weekly_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let days_from_monday = date.weekday().num_days_from_monday() as i64;
    let start = date - Duration::days(days_from_monday);
    (start, start + Duration::days(7))
}

/// Cut date within a month, clamped to the month's length so a cut day of
/// 31 lands on Feb 28/29.
fn cut_of_month(year: i32, month: u32, cut_day: u32) -> NaiveDate {
    let day = cut_day.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is valid")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    let first_next = NaiveDate::from_ymd_opt(ny, nm, 1).expect("valid first of month");
    first_next.pred_opt().expect("month has a last day").day()
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

/// Local midnight of `date` as a UTC instant.
///
/// DST makes midnight occasionally ambiguous (fall back: take the earlier
/// instant) or nonexistent (spring forward: take the first valid instant
/// after the gap).
fn local_midnight_utc(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    match tz.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let one_am = date.and_hms_opt(1, 0, 0).expect("1am exists");
            tz.from_local_datetime(&one_am)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
        }
    }
}
