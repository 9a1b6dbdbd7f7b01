//! Message dispatcher: per-recipient sends and inbound decoding.

use crate::error::TransportError;
use crate::transport::TransportPort;
use bytes::Bytes;
use proximity_storage::PeerIdentity;
use proximity_wire::AppMessage;
use tracing::{debug, warn};

/// Outcome of a fan-out send
#[derive(Debug, Default)]
pub struct SendReport {
    /// Recipients the transport accepted the payload for
    pub delivered: Vec<PeerIdentity>,
    /// Recipients whose send failed
    pub failed: Vec<(PeerIdentity, TransportError)>,
}

/// Encodes outbound payloads and keeps the received chat log
#[derive(Debug, Default)]
pub struct MessageDispatcher {
    /// Append-only `"<sender>: <text>"` log
    received: Vec<String>,
    decode_failures: u64,
}

impl MessageDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `payload` to the transport once per recipient. A failure for one
    /// recipient does not stop the others.
    pub fn send(
        &self,
        transport: &mut dyn TransportPort,
        payload: &Bytes,
        recipients: &[PeerIdentity],
    ) -> SendReport {
        let mut report = SendReport::default();
        if recipients.is_empty() {
            debug!("No recipients, nothing sent");
            return report;
        }

        for peer in recipients {
            match transport.send(payload.clone(), peer) {
                Ok(()) => report.delivered.push(peer.clone()),
                Err(e) => {
                    warn!("Send to {} failed: {}", peer, e);
                    report.failed.push((peer.clone(), e));
                }
            }
        }
        report
    }

    /// Decode a payload from `from`. Chat text is appended to the log;
    /// undecodable payloads are counted and dropped.
    pub fn on_receive(&mut self, payload: &[u8], from: &PeerIdentity) -> Option<AppMessage> {
        match AppMessage::decode(payload) {
            Ok(message) => {
                if let AppMessage::Chat(text) = &message {
                    self.received.push(format!("{}: {}", from, text));
                }
                Some(message)
            }
            Err(e) => {
                self.decode_failures += 1;
                warn!(
                    "Dropping undecodable payload from {} ({} bytes): {}",
                    from,
                    payload.len(),
                    e
                );
                None
            }
        }
    }

    /// Received chat log
    pub fn received(&self) -> &[String] {
        &self.received
    }

    /// Payloads dropped because they could not be decoded
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<PeerIdentity>,
        refuse: Option<PeerIdentity>,
    }

    impl TransportPort for RecordingTransport {
        fn start_advertising(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_advertising(&mut self) {}
        fn start_browsing(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_browsing(&mut self) {}
        fn invite(&mut self, _peer: &PeerIdentity, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }
        fn send(&mut self, _payload: Bytes, peer: &PeerIdentity) -> Result<(), TransportError> {
            if self.refuse.as_ref() == Some(peer) {
                return Err(TransportError::Send {
                    peer: peer.clone(),
                    reason: "gone".into(),
                });
            }
            self.sent.push(peer.clone());
            Ok(())
        }
    }

    #[test]
    fn test_send_without_recipients_is_noop() {
        let dispatcher = MessageDispatcher::new();
        let mut transport = RecordingTransport::default();
        let report = dispatcher.send(&mut transport, &Bytes::from_static(b"x"), &[]);
        assert!(report.delivered.is_empty());
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn test_failure_does_not_abort_other_sends() {
        let dispatcher = MessageDispatcher::new();
        let mut transport = RecordingTransport {
            refuse: Some("Bob".into()),
            ..Default::default()
        };
        let recipients: Vec<PeerIdentity> = vec!["Alice".into(), "Bob".into(), "Carol".into()];

        let report = dispatcher.send(&mut transport, &Bytes::from_static(b"x"), &recipients);
        assert_eq!(
            report.delivered,
            vec![PeerIdentity::from("Alice"), PeerIdentity::from("Carol")]
        );
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, PeerIdentity::from("Bob"));
    }

    #[test]
    fn test_receive_logs_chat_and_counts_garbage() {
        let mut dispatcher = MessageDispatcher::new();
        let payload = AppMessage::Chat("hello".into()).encode().unwrap();

        let message = dispatcher.on_receive(&payload, &"Bob".into());
        assert_eq!(message, Some(AppMessage::Chat("hello".into())));
        assert_eq!(dispatcher.received(), ["Bob: hello".to_string()]);

        assert_eq!(dispatcher.on_receive(b"\x00garbage\xff", &"Bob".into()), None);
        assert_eq!(dispatcher.decode_failures(), 1);
        assert_eq!(dispatcher.received().len(), 1);
    }
}
