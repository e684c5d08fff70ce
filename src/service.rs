//! Request-layer façade: what a web handler calls for one user action.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::cart::{AddOutcome, Cart, CartItem, CartService};
use crate::config::Config;
use crate::confirmation::{Customer, Notifier, deliver, render_confirmation};
use crate::engine::{Engine, EngineError, NewFacility, now_ms, today};
use crate::limits::MAX_RANGE_REQUESTS;
use crate::model::*;
use crate::session::SessionStore;

/// One requested booking range, as submitted by a customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

pub struct BookingService<S> {
    engine: Arc<Engine>,
    carts: CartService<S>,
    notifier: Arc<dyn Notifier>,
    generation_days: u32,
    browse_days: u32,
    hold_ttl: Duration,
}

impl<S: SessionStore> BookingService<S> {
    pub fn new(engine: Arc<Engine>, sessions: Arc<S>, notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        Self {
            engine,
            carts: CartService::new(sessions),
            notifier,
            generation_days: config.generation_days,
            browse_days: config.browse_days,
            hold_ttl: config.hold_ttl,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn carts(&self) -> &CartService<S> {
        &self.carts
    }

    pub async fn create_facility(&self, new: NewFacility) -> Result<Facility, EngineError> {
        self.engine
            .create_facility(new, today(), self.generation_days)
            .await
    }

    pub async fn update_facility(&self, facility: Facility) -> Result<(), EngineError> {
        self.engine
            .update_facility(facility, today(), self.generation_days)
            .await
    }

    pub async fn browse(&self, facility_id: Ulid, from: Option<NaiveDate>) -> Result<Vec<Slot>, EngineError> {
        self.browse_at(facility_id, from, today()).await
    }

    /// Slots for `browse_days` days starting at `from` (default `today`).
    /// A date from `today` on with no slots at all triggers regeneration of
    /// `[today, max(today + generation_days, from + browse_days))` first.
    pub async fn browse_at(
        &self,
        facility_id: Ulid,
        from: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let from = from.unwrap_or(today);
        // Past dates are never regenerated
        if from >= today && self.engine.slots_on(facility_id, from).await?.is_empty() {
            let end = (today + Days::new(self.generation_days as u64))
                .max(from + Days::new(self.browse_days as u64));
            let days = (end - today).num_days().max(0) as u32;
            let added = self
                .engine
                .regenerate_slots(facility_id, today, DateWindow::new(today, days))
                .await?;
            tracing::info!("no slots on {from} for facility {facility_id}; regenerated {added}");
        }
        self.engine
            .slots_in_window(facility_id, DateWindow::new(from, self.browse_days))
            .await
    }

    /// Resolve every range, then stage the slots. A range that cannot be
    /// resolved rejects the whole request and nothing is staged.
    pub async fn add_to_cart(
        &self,
        session_id: &str,
        facility_id: Ulid,
        ranges: &[RangeRequest],
    ) -> Result<AddOutcome, EngineError> {
        if ranges.is_empty() {
            return Err(EngineError::Validation("no booking ranges given".into()));
        }
        if ranges.len() > MAX_RANGE_REQUESTS {
            return Err(EngineError::LimitExceeded("too many booking ranges"));
        }
        let facility = self.engine.get_facility(facility_id).await?;
        let mut items = Vec::new();
        for r in ranges {
            let slots = self
                .engine
                .resolve(facility_id, r.date, r.start, r.end)
                .await?;
            items.extend(slots.iter().map(|s| CartItem::for_slot(&facility, s)));
        }

        let outcome = self.carts.add_items(session_id, items).await?;
        metrics::counter!(crate::observability::CART_ITEMS_ADDED_TOTAL).increment(outcome.added.len() as u64);
        tracing::info!(
            "session {session_id}: staged {} slots on {} ({} already in cart)",
            outcome.added.len(),
            facility.name,
            outcome.duplicates.len()
        );
        Ok(outcome)
    }

    pub async fn remove_from_cart(
        &self,
        session_id: &str,
        facility_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    ) -> Result<bool, EngineError> {
        self.carts.remove_item(session_id, facility_id, date, start).await
    }

    pub async fn clear_cart(&self, session_id: &str) -> Result<(), EngineError> {
        self.carts.clear(session_id).await
    }

    /// The cart, with items missing facility data filled from the live
    /// facility and re-priced.
    pub async fn view_cart(&self, session_id: &str) -> Result<Cart, EngineError> {
        let cart = self.carts.load(session_id).await?;
        let missing = cart.facilities_to_hydrate();
        if missing.is_empty() {
            return Ok(cart);
        }
        let mut facilities = HashMap::new();
        for id in missing {
            match self.engine.get_facility(id).await {
                Ok(f) => {
                    facilities.insert(id, f);
                }
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.carts
            .update(session_id, |cart| {
                cart.hydrate(&facilities);
                Ok(cart.clone())
            })
            .await
    }

    /// Reserve every slot in the cart for this session until the hold TTL
    /// runs out. All or nothing across facilities. Returns the expiry.
    pub async fn hold_cart(&self, session_id: &str) -> Result<Ms, EngineError> {
        let cart = self.carts.load(session_id).await?;
        if cart.is_empty() {
            return Err(EngineError::Validation("cart is empty".into()));
        }
        let expires_at = now_ms() + self.hold_ttl.as_millis() as Ms;
        let mut by_facility: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for item in cart.items() {
            by_facility.entry(item.facility_id).or_default().push(item.slot_id);
        }

        let mut placed: Vec<(Ulid, Vec<Ulid>)> = Vec::new();
        for (facility_id, slot_ids) in by_facility {
            if let Err(e) = self
                .engine
                .place_hold(facility_id, &slot_ids, session_id, expires_at)
                .await
            {
                for (held_facility, held_slots) in &placed {
                    if let Err(undo) = self.engine.release_hold(*held_facility, held_slots, session_id).await {
                        tracing::warn!("session {session_id}: could not undo hold on {held_facility}: {undo}");
                    }
                }
                return Err(e);
            }
            placed.push((facility_id, slot_ids));
        }
        Ok(expires_at)
    }

    /// Release this session's holds on the slots in its cart.
    pub async fn release_cart_holds(&self, session_id: &str) -> Result<usize, EngineError> {
        let cart = self.carts.load(session_id).await?;
        let mut by_facility: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for item in cart.items() {
            by_facility.entry(item.facility_id).or_default().push(item.slot_id);
        }
        let mut released = 0;
        for (facility_id, slot_ids) in by_facility {
            match self.engine.release_hold(facility_id, &slot_ids, session_id).await {
                Ok(n) => released += n,
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Book everything in the session's cart for `customer`.
    ///
    /// On success the cart is cleared and a confirmation is sent in the
    /// background. On a conflict nothing is booked; with `prune_on_conflict`
    /// the offending item is also dropped from the cart.
    pub async fn checkout(
        &self,
        session_id: &str,
        customer: &Customer,
        prune_on_conflict: bool,
    ) -> Result<Order, EngineError> {
        let cart = self.view_cart(session_id).await?;
        if cart.is_empty() {
            return Err(EngineError::Validation("cart is empty".into()));
        }

        let order = match self
            .engine
            .checkout(&customer.user_id, session_id, cart.items())
            .await
        {
            Ok(order) => order,
            Err(EngineError::Conflict {
                facility_id,
                date,
                start,
                end,
            }) => {
                tracing::warn!(
                    "checkout for session {session_id} hit a taken slot {} {start}-{end}",
                    date.format("%d/%m/%Y")
                );
                if prune_on_conflict
                    && let Err(e) = self.carts.remove_item(session_id, facility_id, date, start).await
                {
                    tracing::warn!("session {session_id}: could not prune conflicting item: {e}");
                }
                return Err(EngineError::Conflict {
                    facility_id,
                    date,
                    start,
                    end,
                });
            }
            Err(e) => return Err(e),
        };

        // Only what was booked leaves the cart; another tab may have staged more
        let booked: HashSet<Ulid> = cart.items().iter().map(|i| i.slot_id).collect();
        if let Err(e) = self.carts.remove_slots(session_id, &booked).await {
            tracing::warn!("order {} committed but cart for session {session_id} not cleared: {e}", order.id);
        }

        match render_confirmation(&order, cart.items(), customer) {
            Some(confirmation) => {
                let notifier = self.notifier.clone();
                let order_id = order.id;
                tokio::spawn(async move {
                    deliver(notifier.as_ref(), order_id, &confirmation).await;
                });
            }
            None => tracing::debug!("order {}: customer has no address, no confirmation sent", order.id),
        }
        Ok(order)
    }
}
