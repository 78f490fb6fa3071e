/// Trigger event channel module
///
/// Publish-only, fire-and-forget notification that the wake-word was heard.
/// Zero or more listeners may be attached; nobody acknowledges an event.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to encode trigger event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to send trigger event: {0}")]
    Send(#[from] std::io::Error),
}

/// Announcement that the wake-word was detected
///
/// Serializes to the wire shape `{"word": ..., "time": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Configured name of the detected keyword
    pub word: String,

    /// Detection time, whole seconds since the Unix epoch
    #[serde(rename = "time")]
    pub timestamp_seconds: i64,
}

impl TriggerEvent {
    pub fn new(word: impl Into<String>, timestamp_seconds: i64) -> Self {
        Self {
            word: word.into(),
            timestamp_seconds,
        }
    }

    /// Encode as a single JSON line
    pub fn to_json(&self) -> Result<String, PublishError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outbound notification primitive
#[cfg_attr(test, mockall::automock)]
pub trait EventChannel: Send {
    /// Hand the event off without waiting for listeners
    fn publish(&self, event: &TriggerEvent) -> Result<(), PublishError>;
}

/// In-process broadcast to any number of subscribers
pub struct BroadcastEventChannel {
    topic: String,
    sender: broadcast::Sender<TriggerEvent>,
}

impl BroadcastEventChannel {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: topic.into(),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl EventChannel for BroadcastEventChannel {
    fn publish(&self, event: &TriggerEvent) -> Result<(), PublishError> {
        match self.sender.send(event.clone()) {
            Ok(listeners) => debug!("Published to {} ({} listeners)", self.topic, listeners),
            // Zero subscribers is a normal state for a broadcast topic
            Err(_) => debug!("Published to {} with no listeners", self.topic),
        }
        Ok(())
    }
}

/// Trigger events sent as JSON datagrams
///
/// The target may be a unicast, broadcast or multicast address.
pub struct UdpEventChannel {
    topic: String,
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpEventChannel {
    pub async fn bind(topic: impl Into<String>, target: SocketAddr) -> Result<Self, PublishError> {
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        // Readiness must be known before the first non-blocking send
        socket.writable().await?;

        let topic = topic.into();
        info!("Publishing {} to udp://{}", topic, target);

        Ok(Self {
            topic,
            socket,
            target,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl EventChannel for UdpEventChannel {
    fn publish(&self, event: &TriggerEvent) -> Result<(), PublishError> {
        let payload = event.to_json()?;
        let sent = self.socket.try_send_to(payload.as_bytes(), self.target)?;
        debug!("Published {} bytes to {} on udp://{}", sent, self.topic, self.target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wire_shape() {
        let event = TriggerEvent::new("Hey Alfred", 1_700_000_000);
        let json = event.to_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["word"], "Hey Alfred");
        assert_eq!(value["time"], 1_700_000_000);
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let channel = BroadcastEventChannel::new("/interface/wakeword_detector/wakeword", 8);
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        let event = TriggerEvent::new("Hey Alfred", 42);
        channel.publish(&event).unwrap();

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let channel = BroadcastEventChannel::new("topic", 8);
        assert!(channel.publish(&TriggerEvent::new("Hey Alfred", 1)).is_ok());
    }

    #[tokio::test]
    async fn test_udp_datagram() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let channel = UdpEventChannel::bind("topic", target).await.unwrap();
        assert_eq!(channel.target(), target);
        channel.publish(&TriggerEvent::new("Hey Alfred", 7)).unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let event: TriggerEvent = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(event, TriggerEvent::new("Hey Alfred", 7));
    }
}
