//! Request dispatch.
//!
//! Every inbound request is logged and routed by its Uri-Path:
//! - the observable resource: Observe registration or one-shot read
//! - `/tick` and `/time`: switch the resource mode
//! - `/hello`: echo endpoint
//! - anything else: `4.04 Not Found` for confirmable requests
//!
//! Replies to confirmable requests are piggybacked on the ACK; replies to
//! non-confirmable requests go out as NON with a fresh message ID.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use coap_observe_core::{ModeCell, ResourceMode};
use coap_observe_protocol::{
    encode_response_options, new_packet, ContentFormat, MessageClass, MessageType, OptionError,
    Packet, PacketExt, RequestType, ResponseType,
};

use crate::observer::{build_content, NotificationLoop};
use crate::server::ServerConfig;
use crate::subscription::{SubscriptionKey, SubscriptionRegistry};
use crate::transport::ClientConnection;

/// Errors raised while assembling a reply.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("cannot encode options: {0}")]
    Options(#[from] OptionError),

    #[error("cannot serialize body: {0}")]
    Body(#[from] serde_json::Error),
}

/// How a request to the observable resource is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveRequest {
    /// GET with `Observe: 0`.
    Register,
    /// GET without Observe, with another value, or with a malformed one.
    OneShot,
    /// Any other method.
    Unsupported,
}

impl ObserveRequest {
    pub fn classify(request: &Packet) -> Self {
        match request.method() {
            Some(RequestType::Get) => match request.observe() {
                Ok(0) => ObserveRequest::Register,
                _ => ObserveRequest::OneShot,
            },
            _ => ObserveRequest::Unsupported,
        }
    }
}

/// What the dispatcher did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A notification loop was started.
    Registered(SubscriptionKey),
    /// A single response was sent.
    Replied,
    /// Nothing was sent.
    Ignored,
}

/// Routes requests to their handlers.
pub struct Dispatcher {
    mode: Arc<ModeCell>,
    registry: Arc<SubscriptionRegistry>,
    observe_path: String,
    notify_interval: Duration,
    observe_offset: u32,
}

impl Dispatcher {
    pub fn new(
        config: &ServerConfig,
        mode: Arc<ModeCell>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            mode,
            registry,
            observe_path: format!("/{}", config.observe_path.trim_matches('/')),
            notify_interval: config.notify_interval,
            observe_offset: config.observe_offset,
        }
    }

    /// Handle one request from `connection`'s peer.
    pub async fn dispatch<C: ClientConnection>(
        &self,
        request: Packet,
        connection: C,
    ) -> DispatchOutcome {
        info!(client = %connection.peer_addr(), "{}", request.summary());

        let path = request.uri_path().unwrap_or_else(|| "/".to_string());
        if path == self.observe_path {
            return self.handle_observable(&request, connection).await;
        }
        match path.as_str() {
            "/tick" => {
                self.handle_mode_switch(&request, connection, ResourceMode::TickCount)
                    .await
            }
            "/time" => {
                self.handle_mode_switch(&request, connection, ResourceMode::ElapsedTime)
                    .await
            }
            "/hello" => self.handle_hello(&request, connection).await,
            _ => self.handle_not_found(&request, connection).await,
        }
    }

    async fn handle_observable<C: ClientConnection>(
        &self,
        request: &Packet,
        connection: C,
    ) -> DispatchOutcome {
        match ObserveRequest::classify(request) {
            ObserveRequest::Register => self.register(request, connection).await,
            ObserveRequest::OneShot => self.read_once(request, &connection).await,
            ObserveRequest::Unsupported => {
                debug!(code = ?request.header.code, "Ignoring unsupported method");
                DispatchOutcome::Ignored
            }
        }
    }

    async fn register<C: ClientConnection>(
        &self,
        request: &Packet,
        connection: C,
    ) -> DispatchOutcome {
        if request.is_confirmable() {
            let ack = new_packet(
                MessageType::Acknowledgement,
                MessageClass::Empty,
                request.header.message_id,
                &[],
            );
            if let Err(e) = connection.write_message(&ack).await {
                warn!(client = %connection.peer_addr(), "Cannot acknowledge registration: {}", e);
                return DispatchOutcome::Ignored;
            }
        }

        let observer = NotificationLoop::new(
            connection.clone(),
            request.get_token(),
            self.mode.clone(),
            self.notify_interval,
        )
        .with_first_sequence(self.observe_offset);
        let key = observer.key();

        let task = async move {
            observer.run().await;
        };
        match self.registry.spawn(key.clone(), task) {
            Ok(()) => {
                info!(subscription = %key, active = self.registry.len(), "Observer registered");
                DispatchOutcome::Registered(key)
            }
            Err(e) => {
                warn!(subscription = %key, "Rejecting registration: {}", e);
                // Already acknowledged above, so the read goes out as NON
                let mut fallback = request.clone();
                fallback.header.set_type(MessageType::NonConfirmable);
                self.read_once(&fallback, &connection).await
            }
        }
    }

    async fn read_once<C: ClientConnection>(
        &self,
        request: &Packet,
        connection: &C,
    ) -> DispatchOutcome {
        let (message_type, message_id) = reply_header(request, connection);
        let packet = match build_content(
            message_type,
            message_id,
            request.get_token(),
            self.mode.get(),
            Utc::now(),
            None,
            None,
        ) {
            Ok(packet) => packet,
            Err(e) => {
                error!("Cannot build response: {}", e);
                return DispatchOutcome::Ignored;
            }
        };

        send_reply(connection, &packet).await
    }

    async fn handle_mode_switch<C: ClientConnection>(
        &self,
        request: &Packet,
        connection: C,
        mode: ResourceMode,
    ) -> DispatchOutcome {
        if !request.is_confirmable() {
            debug!("Ignoring non-confirmable mode switch");
            return DispatchOutcome::Ignored;
        }

        let previous = self.mode.set(mode);
        info!(from = %previous, to = %mode, "Resource mode switched");

        let packet = match status_ok(request) {
            Ok(packet) => packet,
            Err(e) => {
                error!("Cannot set response: {}", e);
                return DispatchOutcome::Ignored;
            }
        };
        send_reply(&connection, &packet).await
    }

    async fn handle_hello<C: ClientConnection>(
        &self,
        request: &Packet,
        connection: C,
    ) -> DispatchOutcome {
        if request.method() != Some(RequestType::Get) {
            return self.handle_not_found(request, connection).await;
        }

        let (message_type, message_id) = reply_header(request, &connection);
        let mut buf = Vec::new();
        let options = match encode_response_options(&mut buf, ContentFormat::TextPlain, None) {
            Ok((options, _)) => options,
            Err(e) => {
                error!("Cannot set response: {}", e);
                return DispatchOutcome::Ignored;
            }
        };

        let mut packet = new_packet(
            message_type,
            MessageClass::Response(ResponseType::Content),
            message_id,
            request.get_token(),
        );
        options.apply_to(&mut packet);
        packet.payload = format!("Acknowledged: {}", String::from_utf8_lossy(&request.payload))
            .into_bytes();
        send_reply(&connection, &packet).await
    }

    async fn handle_not_found<C: ClientConnection>(
        &self,
        request: &Packet,
        connection: C,
    ) -> DispatchOutcome {
        if !request.is_confirmable() {
            return DispatchOutcome::Ignored;
        }
        let packet = new_packet(
            MessageType::Acknowledgement,
            MessageClass::Response(ResponseType::NotFound),
            request.header.message_id,
            request.get_token(),
        );
        send_reply(&connection, &packet).await
    }
}

/// Message type and ID for a reply to `request`.
fn reply_header<C: ClientConnection>(request: &Packet, connection: &C) -> (MessageType, u16) {
    if request.is_confirmable() {
        (MessageType::Acknowledgement, request.header.message_id)
    } else {
        (MessageType::NonConfirmable, connection.next_message_id())
    }
}

/// `2.04 Changed` with a JSON `{"status":"ok"}` body.
fn status_ok(request: &Packet) -> Result<Packet, ResponseError> {
    let mut buf = Vec::new();
    let (options, _) = encode_response_options(&mut buf, ContentFormat::ApplicationJSON, None)?;
    let body = serde_json::to_vec(&serde_json::json!({ "status": "ok" }))?;

    let mut packet = new_packet(
        MessageType::Acknowledgement,
        MessageClass::Response(ResponseType::Changed),
        request.header.message_id,
        request.get_token(),
    );
    options.apply_to(&mut packet);
    packet.payload = body;
    Ok(packet)
}

async fn send_reply<C: ClientConnection>(connection: &C, packet: &Packet) -> DispatchOutcome {
    match connection.write_message(packet).await {
        Ok(()) => DispatchOutcome::Replied,
        Err(e) => {
            warn!(client = %connection.peer_addr(), "Error on transmitter: {}", e);
            DispatchOutcome::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::RecordingConnection;
    use coap_observe_protocol::CoapOption;

    const GET: MessageClass = MessageClass::Request(RequestType::Get);
    const POST: MessageClass = MessageClass::Request(RequestType::Post);
    const PUT: MessageClass = MessageClass::Request(RequestType::Put);
    const CONTENT: MessageClass = MessageClass::Response(ResponseType::Content);
    const CHANGED: MessageClass = MessageClass::Response(ResponseType::Changed);
    const NOT_FOUND: MessageClass = MessageClass::Response(ResponseType::NotFound);

    fn setup(max_subscriptions: Option<usize>) -> (Dispatcher, Arc<ModeCell>, Arc<SubscriptionRegistry>) {
        let config = ServerConfig {
            notify_interval: Duration::from_secs(1),
            max_subscriptions,
            ..ServerConfig::default()
        };
        let mode = Arc::new(ModeCell::new(config.initial_mode));
        let registry = Arc::new(SubscriptionRegistry::new(config.max_subscriptions));
        let dispatcher = Dispatcher::new(&config, mode.clone(), registry.clone());
        (dispatcher, mode, registry)
    }

    fn request(
        message_type: MessageType,
        code: MessageClass,
        path: &str,
        observe: Option<Vec<u8>>,
    ) -> Packet {
        let mut packet = new_packet(message_type, code, 0x1234, &[0xAB]);
        packet.set_uri_path(path);
        if let Some(value) = observe {
            packet.add_option(CoapOption::Observe, value);
        }
        packet
    }

    #[test]
    fn test_classify() {
        let register = request(MessageType::Confirmable, GET, "/some/path", Some(vec![]));
        let deregister = request(MessageType::Confirmable, GET, "/some/path", Some(vec![1]));
        let plain = request(MessageType::Confirmable, GET, "/some/path", None);
        let malformed = request(MessageType::Confirmable, GET, "/some/path", Some(vec![0; 4]));
        let post = request(MessageType::Confirmable, POST, "/some/path", Some(vec![]));

        assert_eq!(ObserveRequest::classify(&register), ObserveRequest::Register);
        assert_eq!(ObserveRequest::classify(&deregister), ObserveRequest::OneShot);
        assert_eq!(ObserveRequest::classify(&plain), ObserveRequest::OneShot);
        assert_eq!(ObserveRequest::classify(&malformed), ObserveRequest::OneShot);
        assert_eq!(ObserveRequest::classify(&post), ObserveRequest::Unsupported);
    }

    #[tokio::test]
    async fn test_one_shot_get_replies_once_without_observe() {
        let (dispatcher, _, registry) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40001");

        let outcome = dispatcher
            .dispatch(
                request(MessageType::Confirmable, GET, "/some/path", None),
                connection.clone(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Replied);
        assert!(registry.is_empty());
        let sent = connection.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), MessageType::Acknowledgement);
        assert_eq!(sent[0].header.message_id, 0x1234);
        assert_eq!(sent[0].header.code, CONTENT);
        assert_eq!(sent[0].get_token().to_vec(), vec![0xAB]);
        assert!(sent[0].get_option(CoapOption::Observe).is_none());
        assert_eq!(sent[0].get_content_format(), Some(ContentFormat::TextPlain));
    }

    #[tokio::test]
    async fn test_non_confirmable_read_gets_fresh_message_id() {
        let (dispatcher, _, _) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40001");

        dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/some/path", Some(vec![1])),
                connection.clone(),
            )
            .await;

        let sent = connection.sent();
        assert_eq!(sent[0].message_type(), MessageType::NonConfirmable);
        assert_eq!(sent[0].header.message_id, 100);
    }

    #[tokio::test]
    async fn test_registration_spawns_observer() {
        let (dispatcher, _, registry) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40002");

        let outcome = dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/some/path", Some(vec![])),
                connection.clone(),
            )
            .await;

        let key = SubscriptionKey::new("127.0.0.1:40002".parse().unwrap(), &[0xAB]);
        assert_eq!(outcome, DispatchOutcome::Registered(key.clone()));
        assert!(registry.contains(&key));
        registry.cancel_all();
    }

    #[tokio::test]
    async fn test_confirmable_registration_is_acknowledged() {
        let (dispatcher, _, registry) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40002");

        dispatcher
            .dispatch(
                request(MessageType::Confirmable, GET, "/some/path", Some(vec![])),
                connection.clone(),
            )
            .await;

        let ack = &connection.sent()[0];
        assert!(ack.is_empty_message());
        assert_eq!(ack.message_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.message_id, 0x1234);
        registry.cancel_all();
    }

    #[tokio::test]
    async fn test_one_shot_leaves_existing_subscription_alone() {
        let (dispatcher, _, registry) = setup(None);
        let observer = RecordingConnection::new("127.0.0.1:40003");

        dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/some/path", Some(vec![])),
                observer.clone(),
            )
            .await;
        let key = SubscriptionKey::new("127.0.0.1:40003".parse().unwrap(), &[0xAB]);
        let registered_at = registry.registered_at(&key);

        // Same peer and token, but a deregister-style read
        dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/some/path", Some(vec![1])),
                observer.clone(),
            )
            .await;

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.registered_at(&key), registered_at);
        registry.cancel_all();
    }

    #[tokio::test]
    async fn test_full_registry_falls_back_to_read() {
        let (dispatcher, _, registry) = setup(Some(1));
        let first = RecordingConnection::new("127.0.0.1:40004");
        let second = RecordingConnection::new("127.0.0.1:40005");

        dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/some/path", Some(vec![])),
                first,
            )
            .await;
        let outcome = dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/some/path", Some(vec![])),
                second.clone(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Replied);
        assert_eq!(registry.len(), 1);
        assert!(second.sent()[0].get_option(CoapOption::Observe).is_none());
        registry.cancel_all();
    }

    #[tokio::test]
    async fn test_unsupported_method_is_ignored() {
        let (dispatcher, _, registry) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40006");

        let outcome = dispatcher
            .dispatch(
                request(MessageType::Confirmable, PUT, "/some/path", Some(vec![])),
                connection.clone(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert!(connection.sent().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_mode_switch_commands() {
        let (dispatcher, mode, _) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40007");
        assert_eq!(mode.get(), ResourceMode::TickCount);

        let outcome = dispatcher
            .dispatch(
                request(MessageType::Confirmable, POST, "/time", None),
                connection.clone(),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Replied);
        assert_eq!(mode.get(), ResourceMode::ElapsedTime);

        let reply = &connection.sent()[0];
        assert_eq!(reply.message_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.code, CHANGED);
        assert_eq!(reply.get_content_format(), Some(ContentFormat::ApplicationJSON));
        let body: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(body, serde_json::json!({ "status": "ok" }));

        dispatcher
            .dispatch(
                request(MessageType::Confirmable, GET, "/tick", None),
                connection.clone(),
            )
            .await;
        assert_eq!(mode.get(), ResourceMode::TickCount);
    }

    #[tokio::test]
    async fn test_non_confirmable_mode_switch_is_ignored() {
        let (dispatcher, mode, _) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40008");

        let outcome = dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, POST, "/time", None),
                connection.clone(),
            )
            .await;

        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(mode.get(), ResourceMode::TickCount);
        assert!(connection.sent().is_empty());
    }

    #[tokio::test]
    async fn test_hello_echoes_payload() {
        let (dispatcher, _, _) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40009");
        let mut hello = request(MessageType::Confirmable, GET, "/hello", None);
        hello.payload = b"world".to_vec();

        dispatcher.dispatch(hello, connection.clone()).await;

        let reply = &connection.sent()[0];
        assert_eq!(reply.header.code, CONTENT);
        assert_eq!(reply.payload, b"Acknowledged: world".to_vec());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (dispatcher, _, _) = setup(None);
        let connection = RecordingConnection::new("127.0.0.1:40010");

        let outcome = dispatcher
            .dispatch(
                request(MessageType::Confirmable, GET, "/nope", None),
                connection.clone(),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Replied);
        assert_eq!(connection.sent()[0].header.code, NOT_FOUND);

        let outcome = dispatcher
            .dispatch(
                request(MessageType::NonConfirmable, GET, "/nope", None),
                connection.clone(),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Ignored);
        assert_eq!(connection.sent().len(), 1);
    }
}
