use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

pub fn room_channel(id: Ulid) -> String {
    format!("room_{}", id.to_string().to_ascii_lowercase())
}

pub fn facility_channel(id: Ulid) -> String {
    format!("facility_{}", id.to_string().to_ascii_lowercase())
}

/// Broadcast hub for LISTEN/NOTIFY, one channel per name. Names are
/// case-insensitive, like unquoted SQL identifiers.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
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

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel.to_ascii_lowercase())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel: &str, event: &Event) {
        if let Some(sender) = self.channels.get(&channel.to_ascii_lowercase()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when its room is deleted).
    pub fn remove(&self, channel: &str) {
        self.channels.remove(&channel.to_ascii_lowercase());
    }
}
