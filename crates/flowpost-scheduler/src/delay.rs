//! Delay resolution: configured amount + unit → concrete wake-up time.

use chrono::{DateTime, Duration, Utc};

/// Upper bound for a single delay (ten years).
const MAX_DELAY_MS: f64 = 10.0 * 365.0 * 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    /// Prefix match, case-insensitive. Unknown units mean minutes.
    pub fn parse(unit: &str) -> Self {
        let u = unit.trim().to_lowercase();
        if u.starts_with("sec") {
            DelayUnit::Seconds
        } else if u.starts_with("min") {
            DelayUnit::Minutes
        } else if u.starts_with("hour") {
            DelayUnit::Hours
        } else if u.starts_with("day") {
            DelayUnit::Days
        } else {
            DelayUnit::Minutes
        }
    }

    pub fn millis(self) -> i64 {
        match self {
            DelayUnit::Seconds => 1_000,
            DelayUnit::Minutes => 60_000,
            DelayUnit::Hours => 3_600_000,
            DelayUnit::Days => 86_400_000,
        }
    }
}

/// Delay length in milliseconds. Negative or non-finite amounts are zero.
pub fn delay_millis(amount: f64, unit: &str) -> i64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    let ms = amount * DelayUnit::parse(unit).millis() as f64;
    ms.min(MAX_DELAY_MS).round() as i64
}

/// `now + amount·unit`, never earlier than `now`.
pub fn resolve(amount: f64, unit: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::milliseconds(delay_millis(amount, unit))
}
