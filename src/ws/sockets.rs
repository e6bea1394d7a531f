//! Registry of open game sockets and their outbound queues

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::game::Outgoing;

/// Frames a socket may have queued before it is treated as too slow and closed
pub const SOCKET_QUEUE_LEN: usize = 256;

/// Work for a socket's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Frame(Bytes),
    Close,
}

/// Outbound side of every open socket, keyed by socket id
#[derive(Default)]
pub struct SocketRegistry {
    sockets: DashMap<Uuid, mpsc::Sender<SocketCommand>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a socket. The receiver feeds its writer task.
    pub fn register(&self, socket_id: Uuid) -> mpsc::Receiver<SocketCommand> {
        let (tx, rx) = mpsc::channel(SOCKET_QUEUE_LEN);
        self.sockets.insert(socket_id, tx);
        rx
    }

    pub fn unregister(&self, socket_id: &Uuid) {
        self.sockets.remove(socket_id);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn contains(&self, socket_id: &Uuid) -> bool {
        self.sockets.contains_key(socket_id)
    }

    /// Queue a frame. A socket whose queue is full is dropped from the
    /// registry, which ends its writer and closes the connection.
    pub fn send(&self, socket_id: Uuid, data: Bytes) {
        self.push(socket_id, SocketCommand::Frame(data));
    }

    pub fn close(&self, socket_id: Uuid) {
        self.push(socket_id, SocketCommand::Close);
    }

    /// Deliver frames produced by a match, in order
    pub fn dispatch(&self, outgoing: impl IntoIterator<Item = Outgoing>) {
        for msg in outgoing {
            match msg {
                Outgoing::Send { socket_id, data } => self.send(socket_id, data),
                Outgoing::Close { socket_id } => self.close(socket_id),
            }
        }
    }

    fn push(&self, socket_id: Uuid, cmd: SocketCommand) {
        let result = match self.sockets.get(&socket_id) {
            Some(tx) => tx.try_send(cmd),
            None => {
                debug!(socket_id = %socket_id, "Frame for unknown socket dropped");
                return;
            }
        };

        match result {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(socket_id = %socket_id, "Socket queue full, closing");
                self.sockets.remove(&socket_id);
            }
            Err(TrySendError::Closed(_)) => {
                self.sockets.remove(&socket_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_keeps_order() {
        let registry = SocketRegistry::new();
        let socket_id = Uuid::new_v4();
        let mut rx = registry.register(socket_id);

        registry.dispatch(vec![
            Outgoing::Send {
                socket_id,
                data: Bytes::from_static(&[1]),
            },
            Outgoing::Send {
                socket_id,
                data: Bytes::from_static(&[2]),
            },
            Outgoing::Close { socket_id },
        ]);

        assert_eq!(rx.recv().await, Some(SocketCommand::Frame(Bytes::from_static(&[1]))));
        assert_eq!(rx.recv().await, Some(SocketCommand::Frame(Bytes::from_static(&[2]))));
        assert_eq!(rx.recv().await, Some(SocketCommand::Close));
    }

    #[tokio::test]
    async fn test_unknown_socket_is_ignored() {
        let registry = SocketRegistry::new();
        registry.send(Uuid::new_v4(), Bytes::from_static(&[1]));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_slow_socket_is_dropped() {
        let registry = SocketRegistry::new();
        let socket_id = Uuid::new_v4();
        let mut rx = registry.register(socket_id);

        for _ in 0..=SOCKET_QUEUE_LEN {
            registry.send(socket_id, Bytes::from_static(&[0]));
        }
        assert!(!registry.contains(&socket_id));

        // queued frames drain, then the channel ends
        let mut drained = 0;
        while rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, SOCKET_QUEUE_LEN);
    }
}
