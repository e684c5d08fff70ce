use ulid::Ulid;

use crate::limits::MAX_GENERATION_DAYS;
use crate::model::*;

use super::EngineError;

/// Split `[start, end)` into consecutive one-hour spans starting at `start`.
/// The last span may run past `end` when the range is not a whole number of
/// hours. `Err(t)` means the span starting at `t` would cross midnight.
pub fn hourly_spans(start: TimeOfDay, end: TimeOfDay) -> Result<Vec<(TimeOfDay, TimeOfDay)>, TimeOfDay> {
    let mut spans = Vec::new();
    let mut t = start;
    while t < end {
        let next = t.checked_add_minutes(SLOT_MINUTES).ok_or(t)?;
        spans.push((t, next));
        t = next;
    }
    Ok(spans)
}

/// Operating hours must be non-empty and every generated slot must end by
/// midnight.
pub fn validate_hours(open: TimeOfDay, close: TimeOfDay) -> Result<(), EngineError> {
    if open >= close {
        return Err(EngineError::Validation(format!(
            "operating start {open} must be before end {close}"
        )));
    }
    hourly_spans(open, close).map(|_| ()).map_err(|t| {
        EngineError::Validation(format!("slot starting at {t} would run past midnight"))
    })
}

/// Produce one Available slot per hour boundary in `[open, close)` for every
/// date in `window`, ordered by date then start time.
///
/// The `(date, start, end)` key set depends only on the inputs, so two runs
/// over the same window never collide with each other's keys.
pub fn generate_slots(
    facility_id: Ulid,
    open: TimeOfDay,
    close: TimeOfDay,
    window: &DateWindow,
) -> Result<Vec<Slot>, EngineError> {
    validate_hours(open, close)?;
    if window.days > MAX_GENERATION_DAYS {
        return Err(EngineError::LimitExceeded("generation window too wide"));
    }
    let spans = hourly_spans(open, close).map_err(|t| {
        EngineError::Validation(format!("slot starting at {t} would run past midnight"))
    })?;

    let mut slots = Vec::with_capacity(spans.len() * window.days as usize);
    for date in window.dates() {
        for &(start, end) in &spans {
            slots.push(Slot::available(facility_id, date, start, end));
        }
    }
    Ok(slots)
}
