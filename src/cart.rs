//! Per-session cart of staged slots.
//!
//! Staging a slot reserves nothing; availability is re-checked at checkout.
//! Every write is a compare-and-swap against the session store, so two tabs
//! of one session cannot lose each other's updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::{MAX_CART_ITEMS, MAX_CAS_RETRIES};
use crate::model::*;
use crate::session::SessionStore;

/// One staged slot plus a snapshot of its facility's display data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub facility_id: Ulid,
    pub facility_name: Option<String>,
    pub location: Option<String>,
    pub price_per_hour: Option<Price>,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    /// `price_per_hour * (end - start)` in hours.
    pub total: Price,
}

impl CartItem {
    pub fn for_slot(facility: &Facility, slot: &Slot) -> Self {
        let mut item = Self {
            facility_id: facility.id,
            facility_name: Some(facility.name.clone()),
            location: Some(facility.location.clone()),
            price_per_hour: Some(facility.price_per_hour),
            slot_id: slot.id,
            date: slot.date,
            start: slot.start,
            end: slot.end,
            total: 0,
        };
        item.total = item.compute_total();
        item
    }

    pub fn key(&self) -> SlotKey {
        SlotKey {
            date: self.date,
            start: self.start,
            end: self.end,
        }
    }

    /// Price for the item's duration. Missing facility data prices as zero
    /// until hydrated.
    pub fn compute_total(&self) -> Price {
        let minutes = self.end.minutes().saturating_sub(self.start.minutes()) as i64;
        self.price_per_hour.unwrap_or(0) * minutes / SLOT_MINUTES as i64
    }

    pub fn needs_hydration(&self) -> bool {
        self.facility_name.is_none() || self.price_per_hour.is_none()
    }

    /// Fill facility data from the live facility and re-price.
    pub fn hydrate(&mut self, facility: &Facility) {
        self.facility_name = Some(facility.name.clone());
        self.location = Some(facility.location.clone());
        self.price_per_hour = Some(facility.price_per_hour);
        self.total = self.compute_total();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<CartItem>,
}

impl Cart {
    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<CartItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Always the sum of the item totals.
    pub fn total_price(&self) -> Price {
        self.items.iter().map(|i| i.total).sum()
    }

    pub fn contains_slot(&self, slot_id: &Ulid) -> bool {
        self.items.iter().any(|i| i.slot_id == *slot_id)
    }

    /// Items still lacking facility data.
    pub fn facilities_to_hydrate(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .items
            .iter()
            .filter(|i| i.needs_hydration())
            .map(|i| i.facility_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Returns how many items were hydrated.
    pub fn hydrate(&mut self, facilities: &HashMap<Ulid, Facility>) -> usize {
        let mut hydrated = 0;
        for item in self.items.iter_mut().filter(|i| i.needs_hydration()) {
            if let Some(facility) = facilities.get(&item.facility_id) {
                item.hydrate(facility);
                hydrated += 1;
            }
        }
        hydrated
    }

    fn remove(&mut self, facility_id: Ulid, date: NaiveDate, start: TimeOfDay) -> bool {
        let before = self.items.len();
        self.items
            .retain(|i| !(i.facility_id == facility_id && i.date == date && i.start == start));
        self.items.len() != before
    }
}

/// Result of staging a batch: duplicates are skipped per item, not as a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub added: Vec<Ulid>,
    pub duplicates: Vec<Ulid>,
}

pub struct CartService<S> {
    store: Arc<S>,
}

impl<S: SessionStore> CartService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn load_versioned(&self, session_id: &str) -> Result<(Cart, Option<u64>), EngineError> {
        let stored = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::Transaction(format!("session read: {e}")))?;
        match stored {
            None => Ok((Cart::default(), None)),
            Some(v) => match serde_json::from_slice(&v.data) {
                Ok(cart) => Ok((cart, Some(v.version))),
                Err(e) => {
                    // Overwritten on the next successful write
                    tracing::warn!("discarding unreadable cart for session {session_id}: {e}");
                    Ok((Cart::default(), Some(v.version)))
                }
            },
        }
    }

    pub async fn load(&self, session_id: &str) -> Result<Cart, EngineError> {
        Ok(self.load_versioned(session_id).await?.0)
    }

    pub async fn items(&self, session_id: &str) -> Result<Vec<CartItem>, EngineError> {
        Ok(self.load(session_id).await?.into_items())
    }

    pub async fn total_price(&self, session_id: &str) -> Result<Price, EngineError> {
        Ok(self.load(session_id).await?.total_price())
    }

    /// Read-modify-CAS loop. `f` may run several times and must be a pure
    /// function of the cart it is given; an `Err` aborts without writing.
    pub async fn update<T>(
        &self,
        session_id: &str,
        mut f: impl FnMut(&mut Cart) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        for attempt in 0..MAX_CAS_RETRIES {
            let (mut cart, version) = self.load_versioned(session_id).await?;
            let out = f(&mut cart)?;
            let data = serde_json::to_vec(&cart)
                .map_err(|e| EngineError::Transaction(format!("cart encode: {e}")))?;
            let swapped = self
                .store
                .compare_and_swap(session_id, version, data)
                .await
                .map_err(|e| EngineError::Transaction(format!("session write: {e}")))?;
            if swapped {
                return Ok(out);
            }
            metrics::counter!(crate::observability::CART_CAS_RETRIES_TOTAL).increment(1);
            tracing::debug!("cart CAS lost for session {session_id} (attempt {})", attempt + 1);
        }
        Err(EngineError::CartContention(session_id.to_string()))
    }

    /// Stage items. A slot already in the cart is reported as a duplicate and
    /// the rest still go in.
    pub async fn add_items(&self, session_id: &str, items: Vec<CartItem>) -> Result<AddOutcome, EngineError> {
        self.update(session_id, |cart| {
            let mut outcome = AddOutcome::default();
            let mut staged = Vec::new();
            for item in &items {
                if cart.contains_slot(&item.slot_id) || staged.iter().any(|s: &CartItem| s.slot_id == item.slot_id) {
                    outcome.duplicates.push(item.slot_id);
                } else {
                    outcome.added.push(item.slot_id);
                    staged.push(item.clone());
                }
            }
            if cart.len() + staged.len() > MAX_CART_ITEMS {
                return Err(EngineError::LimitExceeded("too many items in cart"));
            }
            cart.items.extend(staged);
            Ok(outcome)
        })
        .await
    }

    /// Remove every staged item matching `(facility, date, start)`.
    pub async fn remove_item(
        &self,
        session_id: &str,
        facility_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    ) -> Result<bool, EngineError> {
        self.update(session_id, |cart| Ok(cart.remove(facility_id, date, start)))
            .await
    }

    /// Drop the items for `slot_ids`, keeping anything staged since. Returns
    /// how many were removed.
    pub async fn remove_slots(&self, session_id: &str, slot_ids: &HashSet<Ulid>) -> Result<usize, EngineError> {
        self.update(session_id, |cart| {
            let before = cart.items.len();
            cart.items.retain(|i| !slot_ids.contains(&i.slot_id));
            Ok(before - cart.items.len())
        })
        .await
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), EngineError> {
        self.store
            .remove(session_id)
            .await
            .map_err(|e| EngineError::Transaction(format!("session clear: {e}")))
    }
}
