use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_facility(&self, id: Ulid) -> Result<Facility, EngineError> {
        let fs = self.facility_state(id)?;
        let guard = fs.read().await;
        Ok(guard.facility.clone())
    }

    /// All facilities, ordered by name.
    pub async fn list_facilities(&self) -> Vec<Facility> {
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for fs in states {
            out.push(fs.read().await.facility.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_slot(&self, slot_id: Ulid) -> Result<Slot, EngineError> {
        let facility_id = self
            .facility_for_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let fs = self.facility_state(facility_id)?;
        let guard = fs.read().await;
        guard.slot(&slot_id).cloned().ok_or(EngineError::NotFound(slot_id))
    }

    /// One day of a facility's slots, ordered by start time.
    pub async fn slots_on(&self, facility_id: Ulid, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let fs = self.facility_state(facility_id)?;
        let guard = fs.read().await;
        Ok(guard.slots_on(date).cloned().collect())
    }

    /// Slots in `window`, ordered by date then start time.
    pub async fn slots_in_window(&self, facility_id: Ulid, window: DateWindow) -> Result<Vec<Slot>, EngineError> {
        let fs = self.facility_state(facility_id)?;
        let guard = fs.read().await;
        Ok(guard.slots_between(window.start, window.end()).cloned().collect())
    }

    pub fn get_order(&self, id: &Ulid) -> Option<Order> {
        self.orders.get(id).map(|e| e.value().clone())
    }

    /// A user's orders, oldest first.
    pub fn orders_for_user(&self, user_id: &str) -> Vec<Order> {
        let mut out: Vec<Order> = self
            .orders
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.order_date.cmp(&b.order_date).then(a.id.cmp(&b.id)));
        out
    }

    /// The slot an order line booked, if it still exists.
    pub async fn slot_for_detail(&self, detail_id: &Ulid) -> Option<Slot> {
        let booking = self.booking_for_detail(detail_id)?;
        let fs = self.get_facility_state(&booking.facility_id)?;
        let guard = fs.read().await;
        guard.slot(&booking.slot_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}
