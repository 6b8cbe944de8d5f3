//! Notification loop for one Observe subscription.
//!
//! Once started, the loop sends a `2.05 Content` notification to its peer on
//! every tick of a fixed interval. Each notification carries the registration
//! token, the next sequence number in its Observe option and the payload for
//! the resource mode in effect when it is built. The loop ends the first time
//! a send fails; missed notifications are never re-sent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use coap_observe_core::{current_payload, ModeCell, ResourceMode};
use coap_observe_protocol::options::MAX_OBSERVE;
use coap_observe_protocol::{
    encode_response_options, new_packet, ContentFormat, MessageClass, MessageType, OptionError,
    Packet, ResponseType,
};

use crate::subscription::SubscriptionKey;
use crate::transport::ClientConnection;

/// Initial size of the option scratch buffer; grown on demand.
const OPTION_BUF_LEN: usize = 8;

/// Observe value on the wire for an internal sequence number.
pub fn wire_sequence(sequence: u64) -> u32 {
    (sequence & u64::from(MAX_OBSERVE)) as u32
}

/// Build a text/plain `2.05 Content` message for the observable resource.
///
/// `tick` feeds the tick-count payload; `observe` is set only on
/// notifications.
pub fn build_content(
    message_type: MessageType,
    message_id: u16,
    token: &[u8],
    mode: ResourceMode,
    started_at: DateTime<Utc>,
    tick: Option<u64>,
    observe: Option<u32>,
) -> Result<Packet, OptionError> {
    let mut buf = vec![0u8; OPTION_BUF_LEN];
    let (options, _) = encode_response_options(&mut buf, ContentFormat::TextPlain, observe)?;

    let mut packet = new_packet(
        message_type,
        MessageClass::Response(ResponseType::Content),
        message_id,
        token,
    );
    options.apply_to(&mut packet);
    packet.payload = current_payload(mode, started_at, Utc::now(), tick);
    Ok(packet)
}

/// Per-subscriber notification loop.
pub struct NotificationLoop<C: ClientConnection> {
    connection: C,
    token: Vec<u8>,
    mode: Arc<ModeCell>,
    interval: Duration,
    first_sequence: u32,
}

impl<C: ClientConnection> NotificationLoop<C> {
    pub fn new(connection: C, token: &[u8], mode: Arc<ModeCell>, interval: Duration) -> Self {
        Self {
            connection,
            token: token.to_vec(),
            mode,
            interval,
            first_sequence: 0,
        }
    }

    /// Start the sequence at `offset` instead of 0.
    pub fn with_first_sequence(mut self, offset: u32) -> Self {
        self.first_sequence = offset;
        self
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.connection.peer_addr(), &self.token)
    }

    /// Send notifications until delivery fails.
    ///
    /// The first notification goes out immediately. Returns the number of
    /// notifications delivered.
    pub async fn run(self) -> u64 {
        let key = self.key();
        let started_at = Utc::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sequence = u64::from(self.first_sequence);
        let mut tick = 0u64;
        let mut delivered = 0u64;

        debug!(subscription = %key, "Observer started");

        loop {
            ticker.tick().await;

            let observe = wire_sequence(sequence);
            let built = build_content(
                MessageType::NonConfirmable,
                self.connection.next_message_id(),
                &self.token,
                self.mode.get(),
                started_at,
                Some(tick),
                Some(observe),
            );
            tick += 1;
            sequence += 1;

            let packet = match built {
                Ok(packet) => packet,
                Err(e) => {
                    error!(subscription = %key, observe, "Cannot build notification: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.connection.write_message(&packet).await {
                warn!(subscription = %key, observe, "Error on transmitter, stopping: {}", e);
                return delivered;
            }
            delivered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::RecordingConnection;
    use coap_observe_protocol::{CoapOption, PacketExt};

    fn payload_text(packet: &Packet) -> String {
        String::from_utf8(packet.payload.clone()).unwrap()
    }

    #[test]
    fn test_wire_sequence_wraps_at_24_bits() {
        assert_eq!(wire_sequence(0), 0);
        assert_eq!(wire_sequence(u64::from(MAX_OBSERVE)), MAX_OBSERVE);
        assert_eq!(wire_sequence(u64::from(MAX_OBSERVE) + 1), 0);
    }

    #[test]
    fn test_one_shot_has_no_observe_option() {
        let packet = build_content(
            MessageType::Acknowledgement,
            42,
            &[0xAB],
            ResourceMode::TickCount,
            Utc::now(),
            None,
            None,
        )
        .unwrap();

        assert_eq!(packet.header.code, MessageClass::Response(ResponseType::Content));
        assert_eq!(packet.header.message_id, 42);
        assert_eq!(packet.get_token().to_vec(), vec![0xAB]);
        assert!(packet.get_option(CoapOption::Observe).is_none());
        assert_eq!(packet.get_content_format(), Some(ContentFormat::TextPlain));
        assert_eq!(payload_text(&packet), "Been running for 0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_increases_without_gaps() {
        let connection = RecordingConnection::failing_from("127.0.0.1:40000", 5);
        let mode = Arc::new(ModeCell::new(ResourceMode::TickCount));

        let delivered = NotificationLoop::new(connection.clone(), &[0xAB], mode, Duration::from_secs(1))
            .run()
            .await;

        assert_eq!(delivered, 5);
        let sent = connection.sent();
        let observed: Vec<u32> = sent.iter().map(|p| p.observe().unwrap()).collect();
        assert_eq!(observed, vec![0, 1, 2, 3, 4]);
        for (index, packet) in sent.iter().enumerate() {
            assert_eq!(packet.get_token().to_vec(), vec![0xAB]);
            assert_eq!(packet.message_type(), MessageType::NonConfirmable);
            assert_eq!(payload_text(packet), format!("Been running for {index}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_first_failed_write() {
        let connection = RecordingConnection::failing_from("127.0.0.1:40000", 2);
        let mode = Arc::new(ModeCell::default());

        let delivered = NotificationLoop::new(connection.clone(), &[1], mode, Duration::from_secs(1))
            .run()
            .await;

        assert_eq!(delivered, 2);
        // The failed send is the last attempt; nothing is retried
        assert_eq!(connection.attempts(), 3);
        assert_eq!(connection.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscriber_leaves_others_on_schedule() {
        let mode = Arc::new(ModeCell::default());
        let failing = RecordingConnection::failing_from("127.0.0.1:40001", 2);
        let steady = RecordingConnection::failing_from("127.0.0.1:40002", 6);
        let start = tokio::time::Instant::now();

        let failing_task = tokio::spawn(
            NotificationLoop::new(failing.clone(), &[1], mode.clone(), Duration::from_secs(1)).run(),
        );
        let steady_task = tokio::spawn(
            NotificationLoop::new(steady.clone(), &[2], mode, Duration::from_secs(1)).run(),
        );

        assert_eq!(failing_task.await.unwrap(), 2);
        assert_eq!(failing.attempts(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        assert_eq!(steady_task.await.unwrap(), 6);
        // Sends at 0s..5s kept their cadence; the failing write is at 6s
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        let observed: Vec<u32> = steady.sent().iter().map(|p| p.observe().unwrap()).collect();
        assert_eq!(observed, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_one_interval_apart() {
        let connection = RecordingConnection::failing_from("127.0.0.1:40000", 3);
        let mode = Arc::new(ModeCell::default());
        let start = tokio::time::Instant::now();

        NotificationLoop::new(connection, &[1], mode, Duration::from_secs(1))
            .run()
            .await;

        // Sends at 0s, 1s, 2s; the failing fourth send happens at 3s
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_sets_first_sequence() {
        let connection = RecordingConnection::failing_from("127.0.0.1:40000", 2);
        let mode = Arc::new(ModeCell::default());

        NotificationLoop::new(connection.clone(), &[1], mode, Duration::from_secs(1))
            .with_first_sequence(10)
            .run()
            .await;

        let observed: Vec<u32> = connection
            .sent()
            .iter()
            .map(|p| p.observe().unwrap())
            .collect();
        assert_eq!(observed, vec![10, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_applies_to_later_notifications() {
        let connection = RecordingConnection::failing_from("127.0.0.1:40000", 4);
        let mode = Arc::new(ModeCell::new(ResourceMode::TickCount));

        let observer = NotificationLoop::new(
            connection.clone(),
            &[1],
            mode.clone(),
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(observer.run());

        // Notifications at 0s and 1s use ticks; 2s and 3s use elapsed time
        tokio::time::sleep(Duration::from_millis(1500)).await;
        mode.set(ResourceMode::ElapsedTime);
        assert_eq!(handle.await.unwrap(), 4);

        let payloads: Vec<String> = connection.sent().iter().map(payload_text).collect();
        assert_eq!(payloads[0], "Been running for 0");
        assert_eq!(payloads[1], "Been running for 1");
        assert!(payloads[2].ends_with('s'), "{}", payloads[2]);
        assert!(payloads[3].ends_with('s'), "{}", payloads[3]);
    }
}
