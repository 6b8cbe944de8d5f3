//! CoAP UDP server.
//!
//! This module provides the receive loop that:
//! - Decodes every datagram arriving on the socket
//! - Answers CoAP pings and drops stray ACK/RST and response messages
//! - Answers retransmitted requests from the exchange cache
//! - Dispatches each new request on its own task

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU16;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use coap_observe_core::{ModeCell, ResourceMode, ServerSettings};
use coap_observe_protocol::{new_packet, MessageClass, MessageType, Packet, PacketExt};

use crate::dispatcher::Dispatcher;
use crate::exchange::{Exchange, ExchangeCache, DEFAULT_MAX_EXCHANGES, EXCHANGE_LIFETIME};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{ClientConnection, UdpConnection};

/// Receive buffer size; larger datagrams are truncated by the socket.
const MAX_DATAGRAM: usize = 1500;

/// Errors that end the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket error outside the receive loop.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured bind address does not parse.
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),
}

/// Configuration for the CoAP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Resource mode at startup.
    pub initial_mode: ResourceMode,
    /// Time between notifications.
    pub notify_interval: Duration,
    /// Upper bound on concurrent subscriptions; `None` is unbounded.
    pub max_subscriptions: Option<usize>,
    /// First sequence number of every subscription.
    pub observe_offset: u32,
    /// Uri-Path of the observable resource.
    pub observe_path: String,
    /// How long a request's message ID is remembered for duplicate detection.
    pub exchange_lifetime: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5688)),
            initial_mode: ResourceMode::TickCount,
            notify_interval: Duration::from_secs(1),
            max_subscriptions: None,
            observe_offset: 0,
            observe_path: "some/path".to_string(),
            exchange_lifetime: EXCHANGE_LIFETIME,
        }
    }
}

impl ServerConfig {
    /// Overlay the values present in `settings`.
    pub fn with_settings(mut self, settings: &ServerSettings) -> Result<Self, ServerError> {
        if let Some(bind) = &settings.bind {
            let ip: IpAddr = bind
                .parse()
                .map_err(|_| ServerError::InvalidAddress(bind.clone()))?;
            self.bind_addr.set_ip(ip);
        }
        if let Some(port) = settings.port {
            self.bind_addr.set_port(port);
        }
        if let Some(mode) = settings.mode {
            self.initial_mode = mode;
        }
        if let Some(ms) = settings.notify_interval_ms {
            self.notify_interval = Duration::from_millis(ms);
        }
        if settings.max_subscriptions.is_some() {
            self.max_subscriptions = settings.max_subscriptions;
        }
        if let Some(offset) = settings.observe_offset {
            self.observe_offset = offset;
        }
        if let Some(path) = &settings.observe_path {
            self.observe_path = path.clone();
        }
        Ok(self)
    }
}

/// The CoAP Observe server.
pub struct CoapServer {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    mode: Arc<ModeCell>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    message_ids: Arc<AtomicU16>,
    exchanges: Arc<ExchangeCache>,
}

impl CoapServer {
    /// Bind the UDP socket and prepare the server.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        let mode = Arc::new(ModeCell::new(config.initial_mode));
        let registry = Arc::new(SubscriptionRegistry::new(config.max_subscriptions));
        let dispatcher = Arc::new(Dispatcher::new(&config, mode.clone(), registry.clone()));
        // Start message IDs somewhere unpredictable
        let first_id = Utc::now().timestamp_subsec_nanos() as u16;
        let exchanges = Arc::new(ExchangeCache::new(
            config.exchange_lifetime,
            DEFAULT_MAX_EXCHANGES,
        ));

        Ok(Self {
            config,
            socket: Arc::new(socket),
            mode,
            registry,
            dispatcher,
            message_ids: Arc::new(AtomicU16::new(first_id)),
            exchanges,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared resource mode.
    pub fn mode(&self) -> Arc<ModeCell> {
        self.mode.clone()
    }

    /// Registry of active subscriptions.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    /// Receive and dispatch requests until the task is dropped.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            mode = %self.mode.get(),
            path = %self.config.observe_path,
            "CoAP server listening"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Failed to receive datagram: {}", e);
                    continue;
                }
            };

            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(client = %peer, "Dropping malformed datagram: {:?}", e);
                    continue;
                }
            };

            let connection = UdpConnection::new(
                self.socket.clone(),
                peer,
                self.message_ids.clone(),
                self.exchanges.clone(),
            );

            if packet.is_empty_message() {
                self.handle_empty(&packet, &connection).await;
                continue;
            }
            if packet.method().is_none() {
                debug!(client = %peer, code = ?packet.header.code, "Ignoring response message");
                continue;
            }
            if !self.is_new_exchange(&packet, peer).await {
                continue;
            }

            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(packet, connection).await;
            });
        }
    }

    /// Whether `packet` starts a new exchange; a retransmission gets the
    /// reply sent for the original, if any, and is not dispatched again.
    async fn is_new_exchange(&self, packet: &Packet, peer: SocketAddr) -> bool {
        let mid = packet.header.message_id;
        match self.exchanges.check(peer, mid) {
            Exchange::New => true,
            Exchange::Duplicate(Some(reply)) => {
                debug!(client = %peer, mid, "Duplicate request, resending reply");
                if let Err(e) = self.socket.send_to(&reply, peer).await {
                    warn!(client = %peer, mid, "Failed to resend reply: {}", e);
                }
                false
            }
            Exchange::Duplicate(None) => {
                debug!(client = %peer, mid, "Duplicate request, dropping");
                false
            }
        }
    }

    /// Empty CON is a ping and gets a reset; empty ACK/RST are dropped.
    async fn handle_empty(&self, packet: &Packet, connection: &UdpConnection) {
        match packet.message_type() {
            MessageType::Confirmable => {
                let reset = new_packet(
                    MessageType::Reset,
                    MessageClass::Empty,
                    packet.header.message_id,
                    &[],
                );
                if let Err(e) = connection.write_message(&reset).await {
                    warn!(client = %connection.peer_addr(), "Failed to answer ping: {}", e);
                }
            }
            other => {
                debug!(
                    client = %connection.peer_addr(),
                    mid = packet.header.message_id,
                    "Ignoring empty {:?}",
                    other
                );
            }
        }
    }
}
