mod checkout;
mod conflict;
mod error;
mod generator;
mod mutations;
mod queries;
mod resolver;

pub use conflict::{now_ms, today};
pub use error::EngineError;
pub use generator::{generate_slots, hourly_spans, validate_hours};
pub use mutations::NewFacility;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailAppendsAfter {
        appends: u64,
        response: oneshot::Sender<()>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wakeup drains every append already queued and commits
/// them with a single fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush of {} events failed: {e}", batch.len());
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All or nothing: on any failure the log is cut back to where the batch
/// began, so no caller told `Err` can reappear on replay.
fn flush_batch(wal: &mut Wal<Event>, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.discard_pending()
    {
        tracing::error!("WAL rollback of failed batch failed: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailAppendsAfter { appends, response } => {
            wal.fail_after = Some(appends);
            let _ = response.send(());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Slot Store: every facility's slots behind a per-facility lock, plus orders.
///
/// Every mutation is written to the WAL before it touches memory, so a failed
/// append leaves state exactly as it was.
pub struct Engine {
    pub state: DashMap<Ulid, SharedFacilityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: slot id → facility id.
    slot_to_facility: DashMap<Ulid, Ulid>,
    orders: DashMap<Ulid, Order>,
    /// Join index: order detail id → the slot it booked.
    detail_to_slot: DashMap<Ulid, SlotBooking>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot and the log never disagree.
    pub(super) write_gate: RwLock<()>,
    pub(super) lock_timeout: Duration,
}

/// Apply a facility-scoped event to one facility (caller holds its lock).
fn apply_to_facility(fs: &mut FacilityState, event: &Event, slot_index: &DashMap<Ulid, Ulid>) {
    let facility_id = fs.facility.id;
    match event {
        Event::FacilityUpdated { facility } => fs.facility = facility.clone(),
        Event::SlotsReplaced { removed, added, .. } => {
            for id in removed {
                if fs.remove_slot(id).is_some() {
                    slot_index.remove(id);
                }
            }
            for slot in added {
                let id = slot.id;
                if fs.insert_slot(slot.clone()) {
                    slot_index.insert(id, facility_id);
                }
            }
        }
        Event::SlotUnavailableSet {
            slot_id,
            unavailable,
            ..
        } => {
            if let Some(slot) = fs.slot_mut(slot_id) {
                slot.status = if *unavailable {
                    SlotStatus::Unavailable
                } else {
                    SlotStatus::Available
                };
            }
        }
        Event::HoldPlaced {
            slot_ids,
            holder,
            expires_at,
            ..
        } => {
            for id in slot_ids {
                if let Some(slot) = fs.slot_mut(id) {
                    slot.status = SlotStatus::Reserved;
                    slot.hold = Some(Hold {
                        holder: holder.clone(),
                        expires_at: *expires_at,
                    });
                }
            }
        }
        Event::HoldReleased { slot_ids, .. } => {
            for id in slot_ids {
                if let Some(slot) = fs.slot_mut(id)
                    && slot.status == SlotStatus::Reserved {
                        slot.status = SlotStatus::Available;
                        slot.hold = None;
                    }
            }
        }
        Event::OrderCommitted { bookings, .. } => {
            for b in bookings.iter().filter(|b| b.facility_id == facility_id) {
                if let Some(slot) = fs.slot_mut(&b.slot_id) {
                    slot.status = SlotStatus::Booked;
                    slot.hold = None;
                    slot.order_detail_id = Some(b.detail_id);
                }
            }
        }
        Event::OrderDeleted { released, .. } => {
            for b in released.iter().filter(|b| b.facility_id == facility_id) {
                if let Some(slot) = fs.slot_mut(&b.slot_id)
                    && slot.order_detail_id == Some(b.detail_id) {
                        slot.order_detail_id = None;
                        slot.status = SlotStatus::Available;
                    }
            }
        }
        // Handled at the map level
        Event::FacilityCreated { .. } | Event::FacilityDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            slot_to_facility: DashMap::new(),
            orders: DashMap::new(),
            detail_to_slot: DashMap::new(),
            write_gate: RwLock::new(()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };

        // Sole owner of every lock during replay: try_write never contends.
        for event in &events {
            match event {
                Event::FacilityCreated { facility } => {
                    let fs = FacilityState::new(facility.clone());
                    engine.state.insert(facility.id, Arc::new(RwLock::new(fs)));
                }
                Event::FacilityDeleted { id } => {
                    if let Some(fs) = engine.get_facility_state(id) {
                        let guard = fs.try_read().expect("replay: uncontended read");
                        engine.drop_facility(&guard);
                    }
                }
                other => {
                    for facility_id in other.facility_ids() {
                        if let Some(entry) = engine.state.get(&facility_id) {
                            let fs = entry.value().clone();
                            let mut guard = fs.try_write().expect("replay: uncontended write");
                            apply_to_facility(&mut guard, other, &engine.slot_to_facility);
                        }
                    }
                }
            }
            engine.apply_to_orders(event);
        }

        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} facilities, {} orders",
                events.len(),
                engine.state.len(),
                engine.orders.len()
            );
        }
        Ok(engine)
    }

    /// Bound on how long a checkout waits for slot locks before giving up.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Write an event through the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Transaction("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transaction("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transaction(e.to_string()))
    }

    /// Make the WAL writer fail the append after the next `appends` ones.
    #[cfg(test)]
    pub(super) async fn fail_wal_appends_after(&self, appends: u64) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .wal_tx
            .send(WalCommand::FailAppendsAfter { appends, response: tx })
            .await;
        let _ = rx.await;
    }

    pub fn get_facility_state(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub(super) fn facility_state(&self, id: Ulid) -> Result<SharedFacilityState, EngineError> {
        self.get_facility_state(&id).ok_or(EngineError::NotFound(id))
    }

    /// Write-lock a facility, failing if it was deleted while we waited.
    pub(super) async fn write_facility(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        let fs = self.facility_state(id)?;
        let guard = fs.write_owned().await;
        if !self.state.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    pub fn facility_for_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_to_facility.get(slot_id).map(|e| *e.value())
    }

    pub(super) fn booking_for_detail(&self, detail_id: &Ulid) -> Option<SlotBooking> {
        self.detail_to_slot.get(detail_id).map(|e| *e.value())
    }

    /// WAL append + apply + publish for an event scoped to one facility whose
    /// write lock the caller holds.
    pub(super) async fn persist_and_apply(
        &self,
        fs: &mut FacilityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_facility(fs, event, &self.slot_to_facility);
        self.apply_to_orders(event);
        self.notify.publish(event);
        Ok(())
    }

    /// Apply an already-persisted event to several locked facilities.
    pub(super) fn apply_to_many(&self, guards: &mut [OwnedRwLockWriteGuard<FacilityState>], event: &Event) {
        for guard in guards.iter_mut() {
            apply_to_facility(guard, event, &self.slot_to_facility);
        }
        self.apply_to_orders(event);
        self.notify.publish(event);
    }

    fn apply_to_orders(&self, event: &Event) {
        match event {
            Event::OrderCommitted { order, bookings } => {
                for b in bookings {
                    self.detail_to_slot.insert(b.detail_id, *b);
                }
                self.orders.insert(order.id, order.clone());
            }
            Event::OrderDeleted { id, .. } => {
                if let Some((_, order)) = self.orders.remove(id) {
                    for detail in &order.details {
                        self.detail_to_slot.remove(&detail.id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Unregister a facility and its slots (cascade). Orders keep their
    /// snapshots; their detail links to the deleted slots are dropped.
    pub(super) fn drop_facility(&self, fs: &FacilityState) {
        let id = fs.facility.id;
        self.state.remove(&id);
        for slot_id in fs.slot_ids() {
            self.slot_to_facility.remove(slot_id);
        }
        self.detail_to_slot.retain(|_, b| b.facility_id != id);
    }
}
