//! Relative date expressions in dataset cells.
//!
//! A cell of the form `{{ <anchor> [(+|-) <n> <unit>[s]] }}` is evaluated at
//! load time. Anchors are `now`, `today`, `tomorrow` and `yesterday` (the last
//! three at midnight); units are `minute`, `hour`, `day`, `month` and `year`.
//!
//! ```
//! use chrono::NaiveDate;
//! use seedbed::datefn::evaluate_at;
//!
//! let now = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_hms_opt(15, 30, 0).unwrap();
//! let due = evaluate_at("{{ today + 1 month }}", now).unwrap();
//! assert_eq!(due.to_string(), "2024-04-30 00:00:00");
//! ```

use chrono::{Duration, Months, NaiveDateTime};
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static DATE_EXPR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\{\{\s*(now|today|tomorrow|yesterday)\s*(?:([+-])\s*(\d+)\s*(minute|hour|day|month|year)s?)?\s*\}\}$",
    )
    .expect("date expression regex pattern is invalid - this is a bug")
});

/// Whether a cell is a `{{ ... }}` template
pub fn is_expression(cell: &str) -> bool {
    let trimmed = cell.trim();
    trimmed.starts_with("{{") && trimmed.ends_with("}}")
}

/// Evaluate against a given `now`
pub fn evaluate_at(expression: &str, now: NaiveDateTime) -> Result<NaiveDateTime> {
    let caps = DATE_EXPR_REGEX
        .captures(expression.trim())
        .ok_or_else(|| Error::config(format!("invalid date expression '{}'", expression)))?;

    let midnight = now.date().and_time(chrono::NaiveTime::default());
    let anchor = match caps[1].to_ascii_lowercase().as_str() {
        "now" => now,
        "today" => midnight,
        "tomorrow" => midnight + Duration::days(1),
        _ => midnight - Duration::days(1),
    };

    let (Some(sign), Some(amount), Some(unit)) = (caps.get(2), caps.get(3), caps.get(4)) else {
        return Ok(anchor);
    };
    let amount: u32 = amount
        .as_str()
        .parse()
        .map_err(|_| Error::config(format!("offset too large in '{}'", expression)))?;
    let negative = sign.as_str() == "-";

    let shifted = match unit.as_str().to_ascii_lowercase().as_str() {
        "minute" => shift(anchor, Duration::minutes(i64::from(amount)), negative),
        "hour" => shift(anchor, Duration::hours(i64::from(amount)), negative),
        "day" => shift(anchor, Duration::days(i64::from(amount)), negative),
        "month" => shift_months(anchor, amount, negative),
        _ => amount
            .checked_mul(12)
            .and_then(|months| shift_months(anchor, months, negative)),
    };
    shifted.ok_or_else(|| Error::config(format!("date expression '{}' out of range", expression)))
}

fn shift(at: NaiveDateTime, by: Duration, negative: bool) -> Option<NaiveDateTime> {
    if negative {
        at.checked_sub_signed(by)
    } else {
        at.checked_add_signed(by)
    }
}

fn shift_months(at: NaiveDateTime, months: u32, negative: bool) -> Option<NaiveDateTime> {
    if negative {
        at.checked_sub_months(Months::new(months))
    } else {
        at.checked_add_months(Months::new(months))
    }
}
