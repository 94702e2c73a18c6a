use crate::limits::{MAX_SLOTS_PER_TEMPLATE, MINUTES_PER_DAY};
use crate::model::{AvailabilityTemplate, DAY_MS, MINUTE_MS, Ms, weekday};

use super::BookingError;

pub(crate) fn validate_template(t: &AvailabilityTemplate) -> Result<(), BookingError> {
    if t.weekday > 6 {
        return Err(BookingError::Validation(format!(
            "weekday must be 0 (Monday) .. 6 (Sunday), got {}",
            t.weekday
        )));
    }
    if t.start_minute >= t.end_minute || t.end_minute > MINUTES_PER_DAY {
        return Err(BookingError::Validation(format!(
            "template window [{}, {}) is not within one day",
            t.start_minute, t.end_minute
        )));
    }
    if let Some(len) = t.slot_minutes {
        if len == 0 {
            return Err(BookingError::Validation("slot_minutes must be positive".into()));
        }
        if ((t.end_minute - t.start_minute) / len) as usize > MAX_SLOTS_PER_TEMPLATE {
            return Err(BookingError::Validation("template yields too many slots".into()));
        }
    }
    Ok(())
}

/// Slot start instants a template yields on the day starting at `day`
/// (a UTC midnight).
pub(crate) fn slots_on_day(t: &AvailabilityTemplate, day: Ms) -> Vec<Ms> {
    if weekday(day) != t.weekday {
        return Vec::new();
    }
    let (Some(first), Some(window_end)) = (
        day.checked_add(t.start_minute as Ms * MINUTE_MS),
        day.checked_add(t.end_minute as Ms * MINUTE_MS),
    ) else {
        return Vec::new();
    };
    match t.slot_minutes {
        None => vec![first],
        Some(len) if len > 0 => {
            let step = len as Ms * MINUTE_MS;
            let mut out = Vec::new();
            let mut start = first;
            // Only whole slots fit
            while let Some(next) = start.checked_add(step)
                && next <= window_end
                && out.len() < MAX_SLOTS_PER_TEMPLATE
            {
                out.push(start);
                start = next;
            }
            out
        }
        Some(_) => Vec::new(),
    }
}

/// All slot instants from `templates` over `days` days starting at `from_day`.
pub(crate) fn slot_instants(templates: &[AvailabilityTemplate], from_day: Ms, days: u32) -> Vec<Ms> {
    let mut out: Vec<Ms> = (0..days as Ms)
        .filter_map(|i| i.checked_mul(DAY_MS).and_then(|off| from_day.checked_add(off)))
        .flat_map(|day| templates.iter().flat_map(move |t| slots_on_day(t, day)))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::day_start;
    use ulid::Ulid;

    // 2024-01-01T00:00:00Z, a Monday
    const MONDAY: Ms = 1_704_067_200_000;

    fn template(weekday: u8, start: u32, end: u32, slot: Option<u32>) -> AvailabilityTemplate {
        AvailabilityTemplate {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            weekday,
            start_minute: start,
            end_minute: end,
            slot_minutes: slot,
        }
    }

    #[test]
    fn single_slot_template() {
        let t = template(0, 9 * 60, 12 * 60, None);
        assert_eq!(slots_on_day(&t, MONDAY), vec![MONDAY + 9 * 3_600_000]);
        assert!(slots_on_day(&t, MONDAY + DAY_MS).is_empty());
    }

    #[test]
    fn split_template_keeps_whole_slots() {
        // 09:00-10:50 in 30 minute slots: 09:00, 09:30, 10:00 (10:30 would overrun)
        let t = template(0, 9 * 60, 10 * 60 + 50, Some(30));
        let slots = slots_on_day(&t, MONDAY);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[2], MONDAY + 10 * 3_600_000);
    }

    #[test]
    fn instants_over_a_week() {
        let monday = template(0, 9 * 60, 10 * 60, None);
        let wednesday = template(2, 14 * 60, 15 * 60, None);
        let instants = slot_instants(&[monday, wednesday], MONDAY, 14);
        assert_eq!(instants.len(), 4);
        assert_eq!(instants[1], MONDAY + 2 * DAY_MS + 14 * 3_600_000);
    }

    #[test]
    fn instants_near_the_end_of_time_do_not_wrap() {
        let every_day: Vec<_> = (0..7).map(|d| template(d, 0, 24 * 60, Some(60))).collect();
        let last_day = day_start(Ms::MAX);
        let instants = slot_instants(&every_day, last_day, 3);
        assert!(instants.iter().all(|&s| s >= last_day));
        assert!(instants.len() <= 24);
    }

    #[test]
    fn template_validation() {
        assert!(validate_template(&template(0, 60, 120, Some(15))).is_ok());
        assert!(validate_template(&template(7, 60, 120, None)).is_err());
        assert!(validate_template(&template(0, 120, 60, None)).is_err());
        assert!(validate_template(&template(0, 60, 1_500, None)).is_err());
        assert!(validate_template(&template(0, 60, 120, Some(0))).is_err());
    }
}
