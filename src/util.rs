use ulid::Ulid;

use crate::model::Ms;

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// RFC 3339 rendering in UTC; raw milliseconds if out of chrono's range.
pub fn format_timestamp(ms: Ms) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

fn to_base36(mut n: u128) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// `BZ` + base-36 millisecond timestamp + six random base-36 characters.
pub fn confirmation_number(now: Ms) -> String {
    let stamp = to_base36(now.max(0) as u128);
    let mut random = Ulid::new().random();
    let mut tail = String::with_capacity(6);
    for _ in 0..6 {
        tail.push(BASE36[(random % 36) as usize] as char);
        random /= 36;
    }
    format!("BZ{stamp}{tail}")
}

/// Mean rating rounded to one decimal place; 0 when there are no ratings.
pub fn average_rating(ratings: &[u8]) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    let sum: u64 = ratings.iter().map(|&r| r as u64).sum();
    let mean = sum as f64 / ratings.len() as f64;
    (mean * 10.0).round() / 10.0
}

/// Format cents as Belize dollars, e.g. `BZ$12.50`.
pub fn format_bzd(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}BZ${}.{:02}", abs / 100, abs % 100)
}
