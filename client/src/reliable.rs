//! Retransmit-until-acknowledged delivery over UDP
//!
//! Each reliable send registers a oneshot completion signal under its
//! MESSAGE_ID. The receive path calls [`ReliableSender::acknowledge`] when an
//! ACK arrives, which wakes the waiting sender immediately. If no ACK arrives
//! within `ack_timeout` the identical bytes are sent again, up to
//! `max_attempts` transmissions in total.

use log::{debug, warn};
use shared::{field, new_message_id, Message};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub ack_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no ACK for {message_id} after {attempts} attempts")]
    Exhausted { message_id: String, attempts: u32 },
    #[error("delivery of {0} cancelled by shutdown")]
    Cancelled(String),
    #[error("message id {0} is already in flight")]
    DuplicateId(String),
}

#[derive(Default)]
pub struct ReliableSender {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl ReliableSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `message` to `dest` until acknowledged or the attempt budget runs out
    ///
    /// A MESSAGE_ID is attached when the message has none. Returns the id on
    /// success.
    pub async fn send(
        &self,
        socket: &UdpSocket,
        mut message: Message,
        dest: SocketAddr,
        policy: RetryPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<String, DeliveryError> {
        let message_id = match message.message_id() {
            Some(id) => id.to_string(),
            None => {
                let id = new_message_id();
                message.set(field::MESSAGE_ID, id.clone());
                id
            }
        };

        let mut ack_rx = {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&message_id) {
                return Err(DeliveryError::DuplicateId(message_id));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(message_id.clone(), tx);
            rx
        };

        let bytes = message.to_bytes();
        let attempts = policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            if *shutdown.borrow() {
                self.forget(&message_id).await;
                return Err(DeliveryError::Cancelled(message_id));
            }

            if let Err(e) = socket.send_to(&bytes, dest).await {
                warn!(
                    "Send of {} {} to {} failed (attempt {}/{}): {}",
                    message.type_tag(),
                    message_id,
                    dest,
                    attempt,
                    attempts,
                    e
                );
            } else {
                debug!(
                    "Sent {} {} to {} (attempt {}/{})",
                    message.type_tag(),
                    message_id,
                    dest,
                    attempt,
                    attempts
                );
            }

            tokio::select! {
                result = &mut ack_rx => {
                    if result.is_ok() {
                        return Ok(message_id);
                    }
                    // Sender half dropped without an ACK; only happens on forget
                    return Err(DeliveryError::Cancelled(message_id));
                }
                _ = tokio::time::sleep(policy.ack_timeout) => {}
                _ = shutdown.changed() => {
                    self.forget(&message_id).await;
                    return Err(DeliveryError::Cancelled(message_id));
                }
            }
        }

        // An ACK may have claimed the entry between the last timeout and now
        if self.pending.lock().await.remove(&message_id).is_none() && ack_rx.try_recv().is_ok() {
            return Ok(message_id);
        }

        warn!(
            "Giving up on {} {} to {} after {} attempts",
            message.type_tag(),
            message_id,
            dest,
            attempts
        );
        Err(DeliveryError::Exhausted {
            message_id,
            attempts,
        })
    }

    /// Resolves the pending send for `message_id`; false if none was waiting
    pub async fn acknowledge(&self, message_id: &str) -> bool {
        let sender = self.pending.lock().await.remove(message_id);
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                debug!("ACK for unknown or finished message {}", message_id);
                false
            }
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn forget(&self, message_id: &str) {
        self.pending.lock().await.remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MessageKind;
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            ack_timeout: Duration::from_millis(50),
        }
    }

    async fn socket_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_send_succeeds_when_acknowledged() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().unwrap();
        let reliable = Arc::new(ReliableSender::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let acker = {
            let reliable = Arc::clone(&reliable);
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
                let message = Message::parse(&buf[..len]).unwrap();
                let id = message.message_id().unwrap().to_string();
                assert!(reliable.acknowledge(&id).await);
                id
            })
        };

        let message = Message::new(MessageKind::Dm).with(field::CONTENT, "hi");
        let id = reliable
            .send(&sender_socket, message, dest, fast_policy(), shutdown_rx)
            .await
            .unwrap();

        assert_eq!(id, acker.await.unwrap());
        assert_eq!(reliable.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_send_exhausts_after_max_attempts() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().unwrap();
        let reliable = ReliableSender::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let message = Message::new(MessageKind::Dm).with(field::MESSAGE_ID, "feedfacecafebeef");
        let result = reliable
            .send(&sender_socket, message, dest, fast_policy(), shutdown_rx)
            .await;

        assert_eq!(
            result,
            Err(DeliveryError::Exhausted {
                message_id: "feedfacecafebeef".to_string(),
                attempts: 3
            })
        );
        assert_eq!(reliable.in_flight().await, 0);
        assert!(!reliable.acknowledge("feedfacecafebeef").await);

        let mut buf = [0u8; 2048];
        let mut received = 0;
        while let Ok(Ok((len, _))) =
            tokio::time::timeout(Duration::from_millis(20), receiver.recv_from(&mut buf)).await
        {
            let message = Message::parse(&buf[..len]).unwrap();
            assert_eq!(message.message_id(), Some("feedfacecafebeef"));
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_send() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().unwrap();
        let reliable = ReliableSender::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let policy = RetryPolicy {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(30),
        };
        let send = reliable.send(
            &sender_socket,
            Message::new(MessageKind::Dm),
            dest,
            policy,
            shutdown_rx,
        );
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown_tx.send(true).unwrap();
        };

        let (result, _) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(send, cancel)
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(DeliveryError::Cancelled(_))));
        assert_eq!(reliable.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_rejected() {
        let (sender_socket, receiver) = socket_pair().await;
        let dest = receiver.local_addr().unwrap();
        let reliable = ReliableSender::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let message = Message::new(MessageKind::Dm).with(field::MESSAGE_ID, "0000000000000001");

        let slow = RetryPolicy {
            max_attempts: 1,
            ack_timeout: Duration::from_millis(200),
        };
        let first = reliable.send(&sender_socket, message.clone(), dest, slow, shutdown_rx.clone());
        let second = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reliable
                .send(&sender_socket, message.clone(), dest, slow, shutdown_rx.clone())
                .await
        };

        let (_, second) = tokio::join!(first, second);
        assert_eq!(
            second,
            Err(DeliveryError::DuplicateId("0000000000000001".to_string()))
        );
    }
}
