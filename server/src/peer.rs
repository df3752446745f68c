//! One client plus the observability feed, as shared by the order and run pipelines

use crate::client::Client;
use log::debug;
use serde::{Deserialize, Serialize};
use shared::{GameObjectId, Packet, PlayerId, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Protocol events for loggers and spectators.
///
/// Serializable so a replay can be recorded alongside the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AiEvent {
    Ordered {
        player: Option<PlayerId>,
        index: u32,
        name: String,
        args: Vec<Value>,
    },
    Finished {
        player: PlayerId,
        index: u32,
        name: String,
        returned: Value,
        invalid: Option<String>,
    },
    Ran {
        player: PlayerId,
        caller: GameObjectId,
        function: String,
        args: BTreeMap<String, Value>,
        returned: Value,
        invalid: Option<String>,
    },
}

pub type EventSender = mpsc::UnboundedSender<AiEvent>;

pub struct Peer<C: Client> {
    client: C,
    events: Option<EventSender>,
    disconnected: Option<String>,
}

impl<C: Client> Peer<C> {
    pub fn new(client: C, events: Option<EventSender>) -> Self {
        Self {
            client,
            events,
            disconnected: None,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn player(&self) -> Option<PlayerId> {
        self.client.player().cloned()
    }

    pub fn send(&mut self, packet: Packet) {
        self.client.send(packet);
    }

    /// Disconnects the client once; later calls are ignored
    pub fn disconnect(&mut self, reason: &str) {
        if self.disconnected.is_some() {
            debug!("Already disconnected, ignoring: {}", reason);
            return;
        }
        self.client.disconnect(reason);
        self.disconnected = Some(reason.to_string());
    }

    /// Records that the transport went away without the server kicking the client
    pub fn mark_closed(&mut self, reason: &str) {
        if self.disconnected.is_none() {
            self.disconnected = Some(reason.to_string());
        }
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnected.as_deref()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_some()
    }

    pub fn emit(&self, event: AiEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("No listener for AI events");
            }
        }
    }

    pub fn start_ticking(&mut self) {
        self.client.start_ticking();
    }

    pub fn pause_ticking(&mut self) {
        self.client.pause_ticking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RecordingClient;

    #[test]
    fn test_disconnects_once() {
        let mut peer = Peer::new(RecordingClient::playing(PlayerId::new("0")), None);
        peer.disconnect("first");
        peer.disconnect("second");

        assert_eq!(peer.client().disconnects, vec!["first".to_string()]);
        assert_eq!(peer.disconnect_reason(), Some("first"));
    }

    #[test]
    fn test_mark_closed_does_not_kick() {
        let mut peer = Peer::new(RecordingClient::playing(PlayerId::new("0")), None);
        peer.mark_closed("eof");
        peer.disconnect("late");

        assert!(peer.client().disconnects.is_empty());
        assert_eq!(peer.disconnect_reason(), Some("eof"));
    }

    #[test]
    fn test_events_reach_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::new(RecordingClient::default(), Some(tx));
        let event = AiEvent::Ordered {
            player: None,
            index: 3,
            name: "runTurn".to_string(),
            args: Vec::new(),
        };

        peer.emit(event.clone());
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn test_event_replay_encoding() {
        let event = AiEvent::Ran {
            player: PlayerId::new("1"),
            caller: GameObjectId::new("12"),
            function: "attack".to_string(),
            args: BTreeMap::from([("tile".to_string(), Value::Null)]),
            returned: Value::Null,
            invalid: Some("not adjacent".to_string()),
        };

        let bytes = bincode::serialize(&event).unwrap();
        assert_eq!(bincode::deserialize::<AiEvent>(&bytes).unwrap(), event);
    }
}
