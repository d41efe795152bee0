//! Channel lifecycle events
//!
//! Published on a broadcast bus owned by the registry. Subscribers that fall
//! behind lose the oldest events; publishing never blocks channel operations.

use serde::Serialize;
use tokio::sync::broadcast;

/// Event emitted by the channel core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum ChannelEvent {
    Newchannel {
        channel: String,
        state: String,
        callerid: Option<String>,
        calleridname: Option<String>,
        uniqueid: String,
    },
    Newstate {
        channel: String,
        state: String,
        callerid: Option<String>,
        calleridname: Option<String>,
        uniqueid: String,
    },
    Hangup {
        channel: String,
        uniqueid: String,
        cause: u32,
        cause_txt: String,
    },
    Rename {
        oldname: String,
        newname: String,
        uniqueid: String,
    },
    Newcallerid {
        channel: String,
        callerid: Option<String>,
        calleridname: Option<String>,
        uniqueid: String,
        cid_callingpres: u8,
    },
    Link {
        channel1: String,
        channel2: String,
        uniqueid1: String,
        uniqueid2: String,
    },
    Unlink {
        channel1: String,
        channel2: String,
        uniqueid1: String,
        uniqueid2: String,
    },
    Masquerade {
        original: String,
        clone: String,
        original_state: String,
        clone_state: String,
    },
    /// A device's state may have changed; query the registry for the new value
    DeviceStateChange { device: String },
}

impl ChannelEvent {
    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Newchannel { .. } => "Newchannel",
            ChannelEvent::Newstate { .. } => "Newstate",
            ChannelEvent::Hangup { .. } => "Hangup",
            ChannelEvent::Rename { .. } => "Rename",
            ChannelEvent::Newcallerid { .. } => "Newcallerid",
            ChannelEvent::Link { .. } => "Link",
            ChannelEvent::Unlink { .. } => "Unlink",
            ChannelEvent::Masquerade { .. } => "Masquerade",
            ChannelEvent::DeviceStateChange { .. } => "DeviceStateChange",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Sending half of the event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish; having no subscribers is not an error
    pub fn publish(&self, event: ChannelEvent) {
        tracing::trace!("event {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_tag() {
        let ev = ChannelEvent::Rename {
            oldname: "Mock/1-0001".into(),
            newname: "Mock/1-0001<MASQ>".into(),
            uniqueid: "1.1".into(),
        };
        let json = ev.to_json().unwrap();
        assert!(json.contains("\"event\":\"Rename\""));
        assert!(json.contains("\"newname\":\"Mock/1-0001<MASQ>\""));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(8);
        bus.publish(ChannelEvent::DeviceStateChange { device: "lost".into() });
        let mut rx = bus.subscribe();
        bus.publish(ChannelEvent::DeviceStateChange { device: "Mock/1".into() });
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::DeviceStateChange { device: "Mock/1".into() }
        );
    }
}
