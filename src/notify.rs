use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-facility change feed. Anything showing a facility's slot grid can
/// subscribe and refresh when slots are generated, held or booked.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a facility's events, creating its channel if needed.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to every facility it touches. No-op without listeners.
    pub fn publish(&self, event: &Event) {
        for facility_id in event.facility_ids() {
            if let Some(sender) = self.channels.get(&facility_id) {
                let _ = sender.send(event.clone());
            }
        }
        if let Event::FacilityDeleted { id } = event {
            self.channels.remove(id);
        }
    }
}
