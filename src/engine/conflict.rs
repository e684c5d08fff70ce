use chrono::NaiveDate;
use ulid::Ulid;

use crate::cart::CartItem;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// The local calendar date; "future" slots are those dated today or later.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub(crate) fn conflict(facility_id: Ulid, key: SlotKey) -> EngineError {
    EngineError::Conflict {
        facility_id,
        date: key.date,
        start: key.start,
        end: key.end,
    }
}

/// The staged item's slot must still exist, still be the same slot, and be
/// bookable by `holder`.
pub(crate) fn check_bookable<'a>(
    fs: &'a FacilityState,
    item: &CartItem,
    holder: &str,
    now: Ms,
) -> Result<&'a Slot, EngineError> {
    let stale = || conflict(item.facility_id, item.key());
    let slot = fs.slot(&item.slot_id).ok_or_else(stale)?;
    if slot.key() != item.key() || !slot.bookable_by(holder, now) {
        return Err(stale());
    }
    Ok(slot)
}

pub(crate) fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_facility(facility: &Facility) -> Result<(), EngineError> {
    use crate::limits::*;
    validate_text(&facility.name, MAX_NAME_LEN, "facility name")?;
    if facility.location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("facility location"));
    }
    if facility.price_per_hour < 0 {
        return Err(EngineError::Validation("price per hour must not be negative".into()));
    }
    super::validate_hours(facility.open, facility.close)
}
