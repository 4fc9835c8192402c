//! Application-facing channel handle

use std::sync::Arc;

use chanmux_proto::{Direction, Message};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::{Error, Result};

/// Unique identity of a registered channel, used to resolve a channel back
/// to its name in the bijective registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A named, bounded, ordered message queue backed by the multiplexer.
///
/// Sends go onto the channel queue, where the manager's multiplex loop picks
/// them up, stamps them with the channel's name, and hands them to the
/// transport. Receives come off the delivery queue the multiplex loop fills
/// with messages routed down from the remote host.
///
/// Cloning returns another handle to the same channel; clones share the
/// delivery queue, so each delivered message is observed by exactly one
/// receiver.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    name: String,
    queue_tx: mpsc::Sender<Message>,
    delivery_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        name: String,
        queue_tx: mpsc::Sender<Message>,
        delivery_rx: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            id,
            name,
            queue_tx,
            delivery_rx: Arc::new(Mutex::new(delivery_rx)),
        }
    }

    /// The channel's registered identity.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The channel's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a message through this channel to the remote host. The message
    /// is tagged `Up`; its channel name is stamped by the multiplex loop.
    pub async fn send(&self, mut msg: Message) -> Result<()> {
        msg.direction = Direction::Up;
        self.queue_tx
            .send(msg)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Receive the next message delivered to this channel. Returns `None`
    /// once the channel has been closed.
    pub async fn recv(&self) -> Option<Message> {
        self.delivery_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanmux_proto::MessageType;

    #[tokio::test]
    async fn test_send_tags_up() {
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let (_delivery_tx, delivery_rx) = mpsc::channel::<Message>(4);
        let channel = Channel::new(ChannelId::new(), "x".to_string(), queue_tx, delivery_rx);

        let mut msg = Message::text("hi");
        msg.direction = Direction::Down; // senders cannot forge the tag
        channel.send(msg).await.unwrap();

        let sent = queue_rx.recv().await.unwrap();
        assert_eq!(sent.direction, Direction::Up);
        assert_eq!(sent.msg_type, MessageType::Data);
    }

    #[tokio::test]
    async fn test_recv_drains_delivery_queue() {
        let (queue_tx, _queue_rx) = mpsc::channel(4);
        let (delivery_tx, delivery_rx) = mpsc::channel(4);
        let channel = Channel::new(ChannelId::new(), "x".to_string(), queue_tx, delivery_rx);

        delivery_tx.send(Message::text("one")).await.unwrap();
        delivery_tx.send(Message::text("two")).await.unwrap();

        assert_eq!(channel.recv().await.unwrap().content, "one");
        assert_eq!(channel.recv().await.unwrap().content, "two");

        drop(delivery_tx);
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_after_close() {
        let (queue_tx, queue_rx) = mpsc::channel(4);
        let (_delivery_tx, delivery_rx) = mpsc::channel::<Message>(4);
        let channel = Channel::new(ChannelId::new(), "x".to_string(), queue_tx, delivery_rx);

        drop(queue_rx);
        let err = channel.send(Message::text("late")).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }
}
