use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for hold expiry.
pub type Ms = i64;

/// Money in the currency's minor unit.
pub type Price = i64;

/// Every slot is exactly one hour long.
pub const SLOT_MINUTES: u32 = 60;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Time of day as minutes since midnight, `00:00..=24:00`.
///
/// `24:00` is representable so a facility can close at midnight and its last
/// slot can end there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY as u16);

    /// Panics on out-of-range input; meant for literals.
    pub const fn hm(hour: u16, minute: u16) -> Self {
        assert!(minute < 60 && hour * 60 + minute <= MINUTES_PER_DAY as u16);
        TimeOfDay(hour * 60 + minute)
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(TimeOfDay(minutes as u16))
    }

    pub fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub fn checked_add_minutes(self, minutes: u32) -> Option<Self> {
        Self::from_minutes(self.minutes() + minutes)
    }

    /// Parse `HH:MM` (also accepts `HH:MM:SS` with zero seconds).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(':');
        let hour: u32 = parts.next()?.parse().ok()?;
        let minute: u32 = parts.next()?.parse().ok()?;
        if let Some(sec) = parts.next()
            && sec.parse::<u32>().ok()? != 0 {
                return None;
            }
        if parts.next().is_some() || minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// A contiguous run of calendar days starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub days: u32,
}

impl DateWindow {
    pub fn new(start: NaiveDate, days: u32) -> Self {
        Self { start, days }
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take(self.days as usize)
    }

    /// First date after the window.
    pub fn end(&self) -> NaiveDate {
        self.start + chrono::Days::new(self.days as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Booked,
    /// Temporarily held for one holder until the hold expires.
    Reserved,
    /// Closed for maintenance.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub holder: String,
    pub expires_at: Ms,
}

/// Identity of a slot within its facility. At most one slot per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl SlotKey {
    fn day_floor(date: NaiveDate) -> Self {
        Self { date, start: TimeOfDay::MIDNIGHT, end: TimeOfDay::MIDNIGHT }
    }

    fn day_ceiling(date: NaiveDate) -> Self {
        Self { date, start: TimeOfDay::END_OF_DAY, end: TimeOfDay::END_OF_DAY }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}-{}", self.date.format("%d/%m/%Y"), self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub status: SlotStatus,
    /// Set once the slot is booked; points at the order line that booked it.
    pub order_detail_id: Option<Ulid>,
    pub hold: Option<Hold>,
}

impl Slot {
    pub fn available(facility_id: Ulid, date: NaiveDate, start: TimeOfDay, end: TimeOfDay) -> Self {
        Self {
            id: Ulid::new(),
            facility_id,
            date,
            start,
            end,
            status: SlotStatus::Available,
            order_detail_id: None,
            hold: None,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey { date: self.date, start: self.start, end: self.end }
    }

    /// Whether `holder` may book this slot at `now`: it is free, reserved by
    /// `holder`, or reserved by someone whose hold has lapsed.
    pub fn bookable_by(&self, holder: &str, now: Ms) -> bool {
        match self.status {
            SlotStatus::Available => true,
            SlotStatus::Reserved => self
                .hold
                .as_ref()
                .is_none_or(|h| h.holder == holder || h.expires_at <= now),
            SlotStatus::Booked | SlotStatus::Unavailable => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub name: String,
    pub location: String,
    pub price_per_hour: Price,
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

/// Frozen snapshot of one booked slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub price: Price,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Ulid,
    pub user_id: String,
    pub order_date: DateTime<Utc>,
    pub total_price: Price,
    pub details: Vec<OrderDetail>,
}

/// Link written at commit time: `slot_id` is now booked by `detail_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBooking {
    pub facility_id: Ulid,
    pub slot_id: Ulid,
    pub detail_id: Ulid,
}

/// A facility and its slots, keyed so no two slots can share
/// `(date, start, end)`.
#[derive(Debug, Clone)]
pub struct FacilityState {
    pub facility: Facility,
    pub slots: BTreeMap<SlotKey, Slot>,
    by_id: HashMap<Ulid, SlotKey>,
}

impl FacilityState {
    pub fn new(facility: Facility) -> Self {
        Self {
            facility,
            slots: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Insert a slot. Refused (returns false) if its key is already taken.
    pub fn insert_slot(&mut self, slot: Slot) -> bool {
        let key = slot.key();
        if self.slots.contains_key(&key) {
            return false;
        }
        self.by_id.insert(slot.id, key);
        self.slots.insert(key, slot);
        true
    }

    pub fn remove_slot(&mut self, id: &Ulid) -> Option<Slot> {
        let key = self.by_id.remove(id)?;
        self.slots.remove(&key)
    }

    pub fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.by_id.get(id).and_then(|k| self.slots.get(k))
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut Slot> {
        let key = self.by_id.get(id)?;
        self.slots.get_mut(key)
    }

    pub fn slot_ids(&self) -> impl Iterator<Item = &Ulid> {
        self.by_id.keys()
    }

    /// Slots on `date`, ordered by start time.
    pub fn slots_on(&self, date: NaiveDate) -> impl Iterator<Item = &Slot> {
        self.slots
            .range(SlotKey::day_floor(date)..=SlotKey::day_ceiling(date))
            .map(|(_, s)| s)
    }

    /// Slots on dates in `[from, to)`, ordered by date then start time.
    pub fn slots_between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Slot> {
        self.slots
            .range(SlotKey::day_floor(from)..SlotKey::day_floor(to))
            .map(|(_, s)| s)
    }
}

/// WAL record format. Each variant is applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        facility: Facility,
    },
    FacilityUpdated {
        facility: Facility,
    },
    FacilityDeleted {
        id: Ulid,
    },
    /// Generation and regeneration: prune `removed`, then insert `added`.
    SlotsReplaced {
        facility_id: Ulid,
        removed: Vec<Ulid>,
        added: Vec<Slot>,
    },
    SlotUnavailableSet {
        facility_id: Ulid,
        slot_id: Ulid,
        unavailable: bool,
    },
    HoldPlaced {
        facility_id: Ulid,
        slot_ids: Vec<Ulid>,
        holder: String,
        expires_at: Ms,
    },
    HoldReleased {
        facility_id: Ulid,
        slot_ids: Vec<Ulid>,
    },
    OrderCommitted {
        order: Order,
        bookings: Vec<SlotBooking>,
    },
    /// Cascade-deletes the order's details; each booked slot in `released`
    /// loses its link and returns to Available.
    OrderDeleted {
        id: Ulid,
        released: Vec<SlotBooking>,
    },
}

impl Event {
    /// Facilities whose slots this event touches.
    pub fn facility_ids(&self) -> Vec<Ulid> {
        match self {
            Event::FacilityCreated { facility } | Event::FacilityUpdated { facility } => {
                vec![facility.id]
            }
            Event::FacilityDeleted { id } => vec![*id],
            Event::SlotsReplaced { facility_id, .. }
            | Event::SlotUnavailableSet { facility_id, .. }
            | Event::HoldPlaced { facility_id, .. }
            | Event::HoldReleased { facility_id, .. } => vec![*facility_id],
            Event::OrderCommitted { bookings, .. }
            | Event::OrderDeleted { released: bookings, .. } => {
                let mut ids: Vec<Ulid> = bookings.iter().map(|b| b.facility_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn slot_at(facility_id: Ulid, d: NaiveDate, hour: u16) -> Slot {
        Slot::available(facility_id, d, TimeOfDay::hm(hour, 0), TimeOfDay::hm(hour + 1, 0))
    }

    fn facility() -> Facility {
        Facility {
            id: Ulid::new(),
            name: "Court 1".into(),
            location: "North".into(),
            price_per_hour: 100,
            open: TimeOfDay::hm(6, 0),
            close: TimeOfDay::hm(22, 0),
        }
    }

    #[test]
    fn time_of_day_parse_and_display() {
        assert_eq!(TimeOfDay::parse("06:00"), Some(TimeOfDay::hm(6, 0)));
        assert_eq!(TimeOfDay::parse("21:30:00"), Some(TimeOfDay::hm(21, 30)));
        assert_eq!(TimeOfDay::parse("24:00"), Some(TimeOfDay::END_OF_DAY));
        assert_eq!(TimeOfDay::parse("24:01"), None);
        assert_eq!(TimeOfDay::parse("10:60"), None);
        assert_eq!(TimeOfDay::parse("10:00:30"), None);
        assert_eq!(TimeOfDay::parse("ten"), None);
        assert_eq!(TimeOfDay::hm(7, 5).to_string(), "07:05");
    }

    #[test]
    fn time_of_day_add_stops_at_midnight() {
        assert_eq!(TimeOfDay::hm(23, 0).checked_add_minutes(60), Some(TimeOfDay::END_OF_DAY));
        assert_eq!(TimeOfDay::hm(23, 30).checked_add_minutes(60), None);
    }

    #[test]
    fn date_window_dates() {
        let w = DateWindow::new(date(2026, 2, 27), 3);
        let dates: Vec<_> = w.dates().collect();
        assert_eq!(dates, vec![date(2026, 2, 27), date(2026, 2, 28), date(2026, 3, 1)]);
        assert_eq!(w.end(), date(2026, 3, 2));
    }

    #[test]
    fn duplicate_key_refused() {
        let mut fs = FacilityState::new(facility());
        let fid = fs.facility.id;
        assert!(fs.insert_slot(slot_at(fid, date(2026, 1, 1), 10)));
        // Different id, same (date, start, end)
        assert!(!fs.insert_slot(slot_at(fid, date(2026, 1, 1), 10)));
        assert_eq!(fs.slots.len(), 1);
    }

    #[test]
    fn remove_slot_clears_both_indexes() {
        let mut fs = FacilityState::new(facility());
        let s = slot_at(fs.facility.id, date(2026, 1, 1), 10);
        let id = s.id;
        fs.insert_slot(s);
        assert!(fs.remove_slot(&id).is_some());
        assert!(fs.slot(&id).is_none());
        assert!(fs.remove_slot(&id).is_none());
        assert!(fs.slots.is_empty());
    }

    #[test]
    fn slots_on_is_day_scoped_and_ordered() {
        let mut fs = FacilityState::new(facility());
        let fid = fs.facility.id;
        for hour in [15, 6, 10] {
            fs.insert_slot(slot_at(fid, date(2026, 1, 2), hour));
        }
        fs.insert_slot(slot_at(fid, date(2026, 1, 1), 21));
        fs.insert_slot(slot_at(fid, date(2026, 1, 3), 6));

        let starts: Vec<_> = fs.slots_on(date(2026, 1, 2)).map(|s| s.start).collect();
        assert_eq!(starts, vec![TimeOfDay::hm(6, 0), TimeOfDay::hm(10, 0), TimeOfDay::hm(15, 0)]);

        let between: Vec<_> = fs.slots_between(date(2026, 1, 1), date(2026, 1, 3)).collect();
        assert_eq!(between.len(), 4);
        assert_eq!(between[0].date, date(2026, 1, 1));
    }

    #[test]
    fn last_slot_of_day_is_in_range() {
        let mut fs = FacilityState::new(facility());
        let fid = fs.facility.id;
        fs.insert_slot(Slot::available(fid, date(2026, 1, 1), TimeOfDay::hm(23, 0), TimeOfDay::END_OF_DAY));
        assert_eq!(fs.slots_on(date(2026, 1, 1)).count(), 1);
        assert_eq!(fs.slots_on(date(2026, 1, 2)).count(), 0);
    }

    #[test]
    fn bookable_by_respects_holds() {
        let mut s = slot_at(Ulid::new(), date(2026, 1, 1), 10);
        assert!(s.bookable_by("anyone", 0));

        s.status = SlotStatus::Reserved;
        s.hold = Some(Hold { holder: "sess-a".into(), expires_at: 1_000 });
        assert!(s.bookable_by("sess-a", 500));
        assert!(!s.bookable_by("sess-b", 500));
        assert!(s.bookable_by("sess-b", 1_000)); // lapsed

        s.status = SlotStatus::Booked;
        s.hold = None;
        assert!(!s.bookable_by("sess-a", 0));
    }

    #[test]
    fn order_event_touches_each_facility_once() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let booking = |facility_id| SlotBooking { facility_id, slot_id: Ulid::new(), detail_id: Ulid::new() };
        let event = Event::OrderCommitted {
            order: Order {
                id: Ulid::new(),
                user_id: "u1".into(),
                order_date: Utc::now(),
                total_price: 300,
                details: Vec::new(),
            },
            bookings: vec![booking(a), booking(b), booking(a)],
        };
        let ids = event.facility_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let f = facility();
        let event = Event::SlotsReplaced {
            facility_id: f.id,
            removed: vec![Ulid::new()],
            added: vec![slot_at(f.id, date(2026, 5, 1), 8)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
