use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::conflict;
use super::{Engine, EngineError, hourly_spans};

/// Decompose `[start, end)` on `date` into the facility's one-hour slots.
///
/// All or nothing: every expected sub-slot must exist, lie inside the range
/// and be Available, otherwise the whole range is refused.
pub(crate) fn resolve_range(
    fs: &FacilityState,
    date: NaiveDate,
    start: TimeOfDay,
    end: TimeOfDay,
) -> Result<Vec<Slot>, EngineError> {
    let f = &fs.facility;
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start {start} must be before end {end}"
        )));
    }
    if start < f.open || end > f.close {
        return Err(EngineError::Validation(format!(
            "{start}-{end} is outside operating hours {}-{}",
            f.open, f.close
        )));
    }

    let requested = SlotKey { date, start, end };
    let spans = hourly_spans(start, end).map_err(|_| conflict(f.id, requested))?;
    let mut resolved = Vec::with_capacity(spans.len());
    for (s, e) in spans {
        let key = SlotKey { date, start: s, end: e };
        match fs.slots.get(&key) {
            Some(slot) if e <= end && slot.status == SlotStatus::Available => {
                resolved.push(slot.clone())
            }
            _ => return Err(conflict(f.id, key)),
        }
    }
    Ok(resolved)
}

impl Engine {
    /// Resolve a requested range to concrete Available slots. Read-only.
    pub async fn resolve(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    ) -> Result<Vec<Slot>, EngineError> {
        let fs = self.facility_state(facility_id)?;
        let guard = fs.read().await;
        resolve_range(&guard, date, start, end)
    }
}
