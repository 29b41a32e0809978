use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{format_clock, Event};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of committed events, one broadcast channel per resource.
/// Channels are created on first subscribe; sends with no listener are dropped.
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

    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

/// `LISTEN` channel name for a resource.
pub fn channel_name(resource_id: Ulid) -> String {
    format!("resource_{resource_id}")
}

/// Inverse of [`channel_name`]. Accepts either case of the id.
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let raw = channel.strip_prefix("resource_")?;
    Ulid::from_string(&raw.to_ascii_uppercase()).ok()
}

/// JSON body of a NOTIFY message. Customer details are left out.
pub fn payload(event: &Event) -> String {
    let body = match event {
        Event::ResourceCreated { id, .. }
        | Event::ResourceUpdated { id, .. }
        | Event::ResourceDeleted { id } => json!({ "event": event.kind(), "resource_id": id.to_string() }),
        Event::ReservationCreated { reservation: r } => json!({
            "event": event.kind(),
            "reservation_id": r.id.to_string(),
            "date": r.date.to_string(),
            "start": format_clock(r.start),
            "end": format_clock(r.end()),
        }),
        Event::ReservationRescheduled { id, date, start, duration, .. } => json!({
            "event": event.kind(),
            "reservation_id": id.to_string(),
            "date": date.to_string(),
            "start": format_clock(*start),
            "end": format_clock(start + duration),
        }),
        Event::ReservationCancelled { id, .. } => {
            json!({ "event": event.kind(), "reservation_id": id.to_string() })
        }
    };
    body.to_string()
}
