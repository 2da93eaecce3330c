use chrono::DateTime;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// The only inputs the overlap test refuses: a negative duration, or an
/// interval whose start or end is not a real instant.
fn representable(start: Ms, duration_minutes: i64) -> Result<Interval, EngineError> {
    if duration_minutes < 0 {
        return Err(EngineError::InvalidDuration(duration_minutes));
    }
    let end = duration_minutes
        .checked_mul(MINUTE_MS)
        .and_then(|d| start.checked_add(d))
        .ok_or(EngineError::InvalidTimestamp(start))?;
    if DateTime::from_timestamp_millis(start).is_none() || DateTime::from_timestamp_millis(end).is_none() {
        return Err(EngineError::InvalidTimestamp(start));
    }
    Ok(Interval::new(start, duration_minutes))
}

/// Booking policy on top of `representable`: the start must fall in the
/// bookable range and one appointment may not run longer than a day.
pub fn validate_candidate(start: Ms, duration_minutes: i64) -> Result<Interval, EngineError> {
    let candidate = representable(start, duration_minutes)?;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::InvalidTimestamp(start));
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(candidate)
}

/// Does the candidate `[start, start + duration)` overlap any existing interval?
///
/// `existing` must already be narrowed to one resource and to appointments
/// that still hold it. Touching endpoints do not conflict, and zero-length
/// intervals never conflict. Stops at the first overlap.
pub fn has_conflict(
    existing: &[Interval],
    candidate_start: Ms,
    candidate_duration: i64,
) -> Result<bool, EngineError> {
    let candidate = representable(candidate_start, candidate_duration)?;
    Ok(existing.iter().any(|e| e.conflicts_with(&candidate)))
}

/// Resource-level check used by the engine while it holds the resource's
/// write lock. `exclude` skips the appointment being moved.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    candidate: &Interval,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if candidate.is_empty() {
        return Ok(());
    }
    for existing in rs.overlapping(&candidate.span()) {
        if !existing.status.is_active() || Some(existing.id) == exclude {
            continue;
        }
        if existing.interval().conflicts_with(candidate) {
            return Err(EngineError::Conflict(existing.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    /// 2026-10-15T00:00:00Z
    const DAY: Ms = 1_792_022_400_000;

    fn at(hour: Ms, minute: Ms) -> Ms {
        DAY + hour * H + minute * MINUTE_MS
    }

    #[test]
    fn empty_existing_never_conflicts() {
        assert!(!has_conflict(&[], at(14, 0), 60).unwrap());
    }

    #[test]
    fn partial_overlap() {
        let existing = [Interval::new(at(14, 0), 60)];
        assert!(has_conflict(&existing, at(14, 30), 60).unwrap());
    }

    #[test]
    fn back_to_back_is_free() {
        let existing = [Interval::new(at(14, 0), 60)];
        assert!(!has_conflict(&existing, at(15, 0), 60).unwrap());
        assert!(!has_conflict(&existing, at(13, 0), 60).unwrap());
    }

    #[test]
    fn candidate_inside_existing() {
        let existing = [Interval::new(at(14, 0), 120)];
        assert!(has_conflict(&existing, at(14, 30), 30).unwrap());
    }

    #[test]
    fn candidate_contains_existing() {
        let existing = [Interval::new(at(14, 0), 30)];
        assert!(has_conflict(&existing, at(13, 0), 180).unwrap());
    }

    #[test]
    fn identical_slot_conflicts() {
        let existing = [Interval::new(at(9, 0), 45)];
        assert!(has_conflict(&existing, at(9, 0), 45).unwrap());
    }

    #[test]
    fn any_of_many_conflicts() {
        let existing = [
            Interval::new(at(9, 0), 30),
            Interval::new(at(11, 0), 30),
            Interval::new(at(16, 0), 60),
        ];
        assert!(!has_conflict(&existing, at(12, 0), 240).unwrap());
        assert!(has_conflict(&existing, at(12, 0), 241).unwrap());
    }

    #[test]
    fn overlap_is_symmetric() {
        let pairs = [
            (Interval::new(at(14, 0), 60), Interval::new(at(14, 30), 60)),
            (Interval::new(at(14, 0), 60), Interval::new(at(15, 0), 60)),
            (Interval::new(at(14, 0), 120), Interval::new(at(14, 30), 30)),
            (Interval::new(at(10, 0), 15), Interval::new(at(18, 0), 15)),
        ];
        for (a, b) in pairs {
            let ab = has_conflict(&[a], b.start, b.duration_minutes).unwrap();
            let ba = has_conflict(&[b], a.start, a.duration_minutes).unwrap();
            assert_eq!(ab, ba, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn repeated_calls_agree() {
        let existing = [Interval::new(at(14, 0), 60), Interval::new(at(16, 0), 30)];
        let first = has_conflict(&existing, at(15, 45), 30).unwrap();
        let second = has_conflict(&existing, at(15, 45), 30).unwrap();
        assert!(first);
        assert_eq!(first, second);
    }

    #[test]
    fn zero_duration_never_conflicts() {
        let existing = [Interval::new(at(14, 0), 60)];
        assert!(!has_conflict(&existing, at(14, 30), 0).unwrap());
        let point = [Interval::new(at(14, 30), 0)];
        assert!(!has_conflict(&point, at(14, 0), 60).unwrap());
    }

    #[test]
    fn negative_duration_rejected() {
        let result = has_conflict(&[], at(14, 0), -30);
        assert!(matches!(result, Err(EngineError::InvalidDuration(-30))));
    }

    #[test]
    fn unrepresentable_timestamp_rejected() {
        assert!(matches!(
            has_conflict(&[], i64::MAX, 30),
            Err(EngineError::InvalidTimestamp(i64::MAX))
        ));
        assert!(matches!(
            has_conflict(&[], i64::MIN, 0),
            Err(EngineError::InvalidTimestamp(_))
        ));
        // The end overflows even though the start is fine.
        assert!(matches!(
            has_conflict(&[], at(9, 0), i64::MAX / 2),
            Err(EngineError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn any_real_instant_gets_a_verdict() {
        let existing = [Interval::new(-H, 120)];
        assert!(has_conflict(&existing, -1, 30).unwrap());
        assert!(!has_conflict(&[], MAX_VALID_TIMESTAMP_MS + 1, 30).unwrap());
    }

    #[test]
    fn long_candidate_gets_a_verdict() {
        let existing = [Interval::new(at(14, 0), 60)];
        assert!(has_conflict(&existing, at(8, 0), MAX_DURATION_MINUTES + 60).unwrap());
        assert!(!has_conflict(&existing, at(15, 0), MAX_DURATION_MINUTES + 60).unwrap());
    }

    #[test]
    fn booking_range_and_length_enforced() {
        assert!(matches!(
            validate_candidate(-1, 30),
            Err(EngineError::InvalidTimestamp(-1))
        ));
        assert!(matches!(
            validate_candidate(MAX_VALID_TIMESTAMP_MS + 1, 30),
            Err(EngineError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            validate_candidate(at(8, 0), MAX_DURATION_MINUTES + 1),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_candidate(at(8, 0), -1),
            Err(EngineError::InvalidDuration(-1))
        ));
        assert_eq!(validate_candidate(at(8, 0), 45).unwrap(), Interval::new(at(8, 0), 45));
    }
}
