use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::cart::CartItem;
use crate::limits::*;
use crate::model::*;
use crate::observability::{CHECKOUTS_TOTAL, CHECKOUT_DURATION_SECONDS};

use super::conflict::{check_bookable, conflict, now_ms, validate_text};
use super::{Engine, EngineError};

fn record(outcome: &'static str, started: std::time::Instant) {
    metrics::counter!(CHECKOUTS_TOTAL, "outcome" => outcome).increment(1);
    metrics::histogram!(CHECKOUT_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

impl Engine {
    /// Read-only availability check of staged items. Reports the first slot
    /// that is gone, moved, or no longer bookable by `holder`.
    pub async fn precheck(&self, items: &[CartItem], holder: &str) -> Result<(), EngineError> {
        let now = now_ms();
        for item in items {
            let Some(fs) = self.get_facility_state(&item.facility_id) else {
                return Err(conflict(item.facility_id, item.key()));
            };
            let guard = fs.read().await;
            check_bookable(&guard, item, holder, now)?;
        }
        Ok(())
    }

    /// Turn staged items into an order, all or nothing.
    ///
    /// Facilities are write-locked in id order. The pre-check and the wait
    /// for those locks are each bounded by the engine's lock timeout. Under
    /// the locks every item is re-validated, then the order and all slot
    /// transitions are written as a single WAL record. Memory changes only
    /// after that record is durable, so any failure leaves every slot as it
    /// was.
    pub async fn checkout(
        &self,
        user_id: &str,
        holder: &str,
        items: &[CartItem],
    ) -> Result<Order, EngineError> {
        let started = std::time::Instant::now();
        if items.is_empty() {
            return Err(EngineError::Validation("cart is empty".into()));
        }
        if items.len() > MAX_CART_ITEMS {
            return Err(EngineError::LimitExceeded("too many items in cart"));
        }
        validate_text(user_id, MAX_USER_ID_LEN, "user id")?;

        match tokio::time::timeout(self.lock_timeout, self.precheck(items, holder)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                record("conflict", started);
                return Err(e);
            }
            Err(_) => return Err(self.lock_timed_out(user_id, started)),
        }

        let _gate = self.write_gate.read().await;
        let mut facility_ids: Vec<Ulid> = items.iter().map(|i| i.facility_id).collect();
        facility_ids.sort();
        facility_ids.dedup();

        let mut guards = match tokio::time::timeout(self.lock_timeout, self.lock_all(&facility_ids)).await {
            Ok(Ok(guards)) => guards,
            Ok(Err(EngineError::NotFound(gone))) => {
                record("conflict", started);
                let item = items.iter().find(|i| i.facility_id == gone).unwrap_or(&items[0]);
                return Err(conflict(item.facility_id, item.key()));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(self.lock_timed_out(user_id, started)),
        };
        let index: HashMap<Ulid, usize> = facility_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        // Re-validate under the locks; the pre-check may be stale.
        let now = now_ms();
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            let fs = &guards[index[&item.facility_id]];
            if !seen.insert(item.slot_id) {
                record("conflict", started);
                return Err(conflict(item.facility_id, item.key()));
            }
            if let Err(e) = check_bookable(fs, item, holder, now) {
                record("conflict", started);
                return Err(e);
            }
        }

        let mut details = Vec::with_capacity(items.len());
        let mut bookings = Vec::with_capacity(items.len());
        for item in items {
            let detail_id = Ulid::new();
            details.push(OrderDetail {
                id: detail_id,
                facility_id: item.facility_id,
                date: item.date,
                start: item.start,
                end: item.end,
                price: item.total,
            });
            bookings.push(SlotBooking {
                facility_id: item.facility_id,
                slot_id: item.slot_id,
                detail_id,
            });
        }
        let order = Order {
            id: Ulid::new(),
            user_id: user_id.to_string(),
            order_date: Utc::now(),
            total_price: details.iter().map(|d| d.price).sum(),
            details,
        };

        let event = Event::OrderCommitted {
            order: order.clone(),
            bookings,
        };
        if let Err(e) = self.wal_append(&event).await {
            record("rolled_back", started);
            tracing::error!("checkout for user {user_id} rolled back: {e}");
            return Err(e);
        }
        self.apply_to_many(&mut guards, &event);

        record("committed", started);
        tracing::info!(
            "order {} committed for user {user_id}: {} slots, total {}",
            order.id,
            order.details.len(),
            order.total_price
        );
        Ok(order)
    }

    fn lock_timed_out(&self, user_id: &str, started: std::time::Instant) -> EngineError {
        record("timeout", started);
        tracing::warn!(
            "checkout for user {user_id} gave up after {:?} waiting for slot locks",
            self.lock_timeout
        );
        EngineError::Transaction("timed out waiting for slot locks".into())
    }

    async fn lock_all(&self, sorted_ids: &[Ulid]) -> Result<Vec<OwnedRwLockWriteGuard<FacilityState>>, EngineError> {
        let mut guards = Vec::with_capacity(sorted_ids.len());
        for id in sorted_ids {
            guards.push(self.write_facility(*id).await?);
        }
        Ok(guards)
    }
}
