use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{conflict, now_ms, validate_facility, validate_text};
use super::{Engine, EngineError, WalCommand, generate_slots};

/// Input for `create_facility`; the id is assigned by the engine.
#[derive(Debug, Clone)]
pub struct NewFacility {
    pub name: String,
    pub location: String,
    pub price_per_hour: Price,
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

/// Plan a regeneration for `f`'s hours: prune future Available slots, then
/// add a fresh slot for every generated key not still held by a surviving
/// slot.
fn plan_regeneration(
    fs: &FacilityState,
    f: &Facility,
    today: NaiveDate,
    window: &DateWindow,
) -> Result<Event, EngineError> {
    let generated = generate_slots(f.id, f.open, f.close, window)?;
    let removed: Vec<Ulid> = fs
        .slots
        .values()
        .filter(|s| s.date >= today && s.status == SlotStatus::Available)
        .map(|s| s.id)
        .collect();
    let pruned: HashSet<&Ulid> = removed.iter().collect();
    let occupied: HashSet<SlotKey> = fs
        .slots
        .values()
        .filter(|s| !pruned.contains(&s.id))
        .map(Slot::key)
        .collect();
    let added = generated
        .into_iter()
        .filter(|s| !occupied.contains(&s.key()))
        .collect();
    Ok(Event::SlotsReplaced {
        facility_id: f.id,
        removed,
        added,
    })
}

impl Engine {
    /// Create a facility and generate its first `days` days of slots from
    /// `today`.
    pub async fn create_facility(
        &self,
        new: NewFacility,
        today: NaiveDate,
        days: u32,
    ) -> Result<Facility, EngineError> {
        let _gate = self.write_gate.read().await;
        if self.state.len() >= MAX_FACILITIES {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        let facility = Facility {
            id: Ulid::new(),
            name: new.name,
            location: new.location,
            price_per_hour: new.price_per_hour,
            open: new.open,
            close: new.close,
        };
        validate_facility(&facility)?;
        let slots = generate_slots(facility.id, facility.open, facility.close, &DateWindow::new(today, days))?;

        let created = Event::FacilityCreated {
            facility: facility.clone(),
        };
        self.wal_append(&created).await?;
        let fs = Arc::new(RwLock::new(FacilityState::new(facility.clone())));
        self.state.insert(facility.id, fs.clone());
        self.notify.publish(&created);

        let count = slots.len();
        let generated = Event::SlotsReplaced {
            facility_id: facility.id,
            removed: Vec::new(),
            added: slots,
        };
        let mut guard = fs.write().await;
        self.persist_and_apply(&mut guard, &generated).await?;
        metrics::counter!(crate::observability::SLOTS_GENERATED_TOTAL).increment(count as u64);
        tracing::info!("created facility {} ({}) with {count} slots", facility.id, facility.name);
        Ok(facility)
    }

    /// Replace a facility's descriptive data and hours. A change of hours
    /// regenerates its slots over `[today, today + days)`.
    pub async fn update_facility(
        &self,
        facility: Facility,
        today: NaiveDate,
        days: u32,
    ) -> Result<(), EngineError> {
        validate_facility(&facility)?;
        let _gate = self.write_gate.read().await;
        let mut guard = self.write_facility(facility.id).await?;
        let hours_changed = guard.facility.open != facility.open || guard.facility.close != facility.close;
        let regeneration = if hours_changed {
            Some(plan_regeneration(&guard, &facility, today, &DateWindow::new(today, days))?)
        } else {
            None
        };

        let event = Event::FacilityUpdated { facility };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some(event) = regeneration {
            self.persist_and_apply(&mut guard, &event).await?;
        }
        Ok(())
    }

    /// Delete a facility and all of its slots. Orders keep their snapshots.
    pub async fn delete_facility(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let guard = self.write_facility(id).await?;
        let event = Event::FacilityDeleted { id };
        self.wal_append(&event).await?;
        self.drop_facility(&guard);
        self.notify.publish(&event);
        tracing::info!("deleted facility {id} with {} slots", guard.slots.len());
        Ok(())
    }

    /// Prune future Available slots and regenerate `window`. Booked, Reserved
    /// and Unavailable slots are never touched, and keys they occupy are not
    /// regenerated. Returns the number of slots added.
    pub async fn regenerate_slots(
        &self,
        facility_id: Ulid,
        today: NaiveDate,
        window: DateWindow,
    ) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.write_facility(facility_id).await?;
        let event = plan_regeneration(&guard, &guard.facility, today, &window)?;
        let added = match &event {
            Event::SlotsReplaced { added, .. } => added.len(),
            _ => 0,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::SLOTS_GENERATED_TOTAL).increment(added as u64);
        tracing::debug!("regenerated {added} slots for facility {facility_id} from {}", window.start);
        Ok(added)
    }

    /// Add slots for any key in `window` that has none. Existing slots are
    /// left alone.
    pub async fn extend_horizon(&self, facility_id: Ulid, window: DateWindow) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.write_facility(facility_id).await?;
        let f = &guard.facility;
        let added: Vec<Slot> = generate_slots(f.id, f.open, f.close, &window)?
            .into_iter()
            .filter(|s| !guard.slots.contains_key(&s.key()))
            .collect();
        if added.is_empty() {
            return Ok(0);
        }
        let count = added.len();
        let event = Event::SlotsReplaced {
            facility_id,
            removed: Vec::new(),
            added,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::SLOTS_GENERATED_TOTAL).increment(count as u64);
        Ok(count)
    }

    /// Keep every facility generated through `today + days`.
    pub async fn roll_horizon(&self, today: NaiveDate, days: u32) -> usize {
        let ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut total = 0;
        for id in ids {
            match self.extend_horizon(id, DateWindow::new(today, days)).await {
                Ok(n) => total += n,
                Err(EngineError::NotFound(_)) => {}
                Err(e) => tracing::warn!("horizon roll for facility {id} failed: {e}"),
            }
        }
        total
    }

    /// Close a slot for maintenance, or reopen it. Only Available slots can
    /// be closed and only Unavailable ones reopened.
    pub async fn set_slot_unavailable(&self, slot_id: Ulid, unavailable: bool) -> Result<(), EngineError> {
        let facility_id = self
            .facility_for_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let _gate = self.write_gate.read().await;
        let mut guard = self.write_facility(facility_id).await?;
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let from = if unavailable {
            SlotStatus::Available
        } else {
            SlotStatus::Unavailable
        };
        if slot.status != from {
            return Err(conflict(facility_id, slot.key()));
        }
        let event = Event::SlotUnavailableSet {
            facility_id,
            slot_id,
            unavailable,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Reserve slots for `holder` until `expires_at`. All or nothing; a slot
    /// already held by the same holder has its hold extended.
    pub async fn place_hold(
        &self,
        facility_id: Ulid,
        slot_ids: &[Ulid],
        holder: &str,
        expires_at: Ms,
    ) -> Result<(), EngineError> {
        validate_text(holder, MAX_HOLDER_LEN, "hold owner")?;
        if slot_ids.is_empty() {
            return Err(EngineError::Validation("no slots to hold".into()));
        }
        if slot_ids.len() > MAX_HOLD_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots in one hold"));
        }
        let now = now_ms();
        if expires_at <= now {
            return Err(EngineError::Validation("hold expiry must be in the future".into()));
        }

        let _gate = self.write_gate.read().await;
        let mut guard = self.write_facility(facility_id).await?;
        let mut seen = HashSet::new();
        for id in slot_ids {
            let slot = guard.slot(id).ok_or(EngineError::NotFound(*id))?;
            if !seen.insert(*id) || !slot.bookable_by(holder, now) {
                return Err(conflict(facility_id, slot.key()));
            }
        }

        let event = Event::HoldPlaced {
            facility_id,
            slot_ids: slot_ids.to_vec(),
            holder: holder.to_string(),
            expires_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::HOLDS_PLACED_TOTAL).increment(slot_ids.len() as u64);
        Ok(())
    }

    /// Release `holder`'s holds among `slot_ids`. Returns how many were
    /// released; slots not held by `holder` are ignored.
    pub async fn release_hold(
        &self,
        facility_id: Ulid,
        slot_ids: &[Ulid],
        holder: &str,
    ) -> Result<usize, EngineError> {
        self.release_where(facility_id, slot_ids, |h| h.holder == holder)
            .await
    }

    /// Release holds among `slot_ids` that have lapsed by `now`.
    pub async fn release_expired_holds(
        &self,
        facility_id: Ulid,
        slot_ids: &[Ulid],
        now: Ms,
    ) -> Result<usize, EngineError> {
        self.release_where(facility_id, slot_ids, |h| h.expires_at <= now)
            .await
    }

    async fn release_where(
        &self,
        facility_id: Ulid,
        slot_ids: &[Ulid],
        pred: impl Fn(&Hold) -> bool,
    ) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.write_facility(facility_id).await?;
        let released: Vec<Ulid> = slot_ids
            .iter()
            .filter(|id| {
                guard.slot(id).is_some_and(|s| {
                    s.status == SlotStatus::Reserved && s.hold.as_ref().is_some_and(&pred)
                })
            })
            .copied()
            .collect();
        if released.is_empty() {
            return Ok(0);
        }
        let count = released.len();
        let event = Event::HoldReleased {
            facility_id,
            slot_ids: released,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(count)
    }

    /// Lapsed holds grouped by facility. Facilities busy with a writer are
    /// skipped until the next sweep.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Vec<Ulid>)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let fs = entry.value().clone();
            if let Ok(guard) = fs.try_read() {
                let ids: Vec<Ulid> = guard
                    .slots
                    .values()
                    .filter(|s| {
                        s.status == SlotStatus::Reserved
                            && s.hold.as_ref().is_some_and(|h| h.expires_at <= now)
                    })
                    .map(|s| s.id)
                    .collect();
                if !ids.is_empty() {
                    expired.push((guard.facility.id, ids));
                }
            }
        }
        expired
    }

    /// Delete an order with its details. Each slot it booked is unlinked and
    /// returns to Available.
    pub async fn delete_order(&self, order_id: Ulid) -> Result<Order, EngineError> {
        let _gate = self.write_gate.read().await;
        let order = self.get_order(&order_id).ok_or(EngineError::NotFound(order_id))?;
        let released: Vec<SlotBooking> = order
            .details
            .iter()
            .filter_map(|d| self.booking_for_detail(&d.id))
            .collect();

        let mut facility_ids: Vec<Ulid> = released.iter().map(|b| b.facility_id).collect();
        facility_ids.sort();
        facility_ids.dedup();
        let mut guards = Vec::with_capacity(facility_ids.len());
        for id in facility_ids {
            guards.push(self.write_facility(id).await?);
        }

        let event = Event::OrderDeleted {
            id: order_id,
            released,
        };
        self.wal_append(&event).await?;
        self.apply_to_many(&mut guards, &event);
        tracing::info!("deleted order {order_id} for user {}", order.user_id);
        Ok(order)
    }

    /// Rewrite the WAL as the minimal event sequence reproducing current
    /// state. Blocks all mutations for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for fs in states {
            let guard = fs.read().await;
            events.push(Event::FacilityCreated {
                facility: guard.facility.clone(),
            });
            events.push(Event::SlotsReplaced {
                facility_id: guard.facility.id,
                removed: Vec::new(),
                added: guard.slots.values().cloned().collect(),
            });
        }

        let mut orders: Vec<Order> = self.orders.iter().map(|e| e.value().clone()).collect();
        orders.sort_by_key(|o| o.id);
        for order in orders {
            let bookings = order
                .details
                .iter()
                .filter_map(|d| self.booking_for_detail(&d.id))
                .collect();
            events.push(Event::OrderCommitted { order, bookings });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Transaction("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transaction("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transaction(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
