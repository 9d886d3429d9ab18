use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// One lifecycle transition as reported to the rest of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateInfo {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StateInfo {
    pub fn new(state: ConnectionState, reason: impl Into<String>) -> Self {
        Self {
            state,
            client_ip: None,
            host_ip: None,
            reason: Some(reason.into()),
        }
    }

    pub fn connecting() -> Self {
        Self {
            state: ConnectionState::Connecting,
            client_ip: None,
            host_ip: None,
            reason: None,
        }
    }

    pub fn connected(client_ip: IpAddr, host_ip: IpAddr) -> Self {
        Self {
            state: ConnectionState::Connected,
            client_ip: Some(client_ip),
            host_ip: Some(host_ip),
            reason: None,
        }
    }

    pub fn disconnected(reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            client_ip: None,
            host_ip: None,
            reason,
        }
    }
}

/// Producer side of the event channel. Sending never blocks the control
/// loop; events sent after the consumer went away are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<StateInfo>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StateInfo>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, info: StateInfo) {
        if let Err(error) = self.sender.send(info) {
            debug!("Event dropped, no consumer: {:?}", error.0.state);
        }
    }
}

impl From<mpsc::UnboundedSender<StateInfo>> for EventSink {
    fn from(sender: mpsc::UnboundedSender<StateInfo>) -> Self {
        Self { sender }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_event_serializes_addresses() {
        let info = StateInfo::connected("10.0.0.2".parse().unwrap(), "1.2.3.4".parse().unwrap());
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"state":"connected","client_ip":"10.0.0.2","host_ip":"1.2.3.4"}"#
        );
    }

    #[test]
    fn emitting_without_consumer_is_harmless() {
        let (sink, receiver) = EventSink::channel();
        drop(receiver);
        sink.emit(StateInfo::connecting());
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut receiver) = EventSink::channel();
        sink.emit(StateInfo::connecting());
        sink.emit(StateInfo::new(ConnectionState::Reconnecting, "new parameters"));

        assert_eq!(receiver.recv().await.unwrap().state, ConnectionState::Connecting);
        assert_eq!(receiver.recv().await.unwrap().state, ConnectionState::Reconnecting);
    }
}
