//! Client connections over UDP.
//!
//! A [`ClientConnection`] is the handle through which responses and
//! notifications reach one peer. The server hands one to every request;
//! notification loops keep theirs for the lifetime of the subscription.
//!
//! ACKs and RSTs written through a [`UdpConnection`] are remembered in the
//! server's [`ExchangeCache`] so retransmitted requests can be answered again.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;

use coap_observe_protocol::{MessageError, MessageType, Packet, PacketExt};

use crate::exchange::ExchangeCache;

/// Errors that can occur while delivering a message.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be serialized.
    #[error("encode error: {0:?}")]
    Encode(MessageError),
}

/// Writer for messages addressed to one peer.
pub trait ClientConnection: Clone + Send + Sync + 'static {
    /// Address of the peer.
    fn peer_addr(&self) -> SocketAddr;

    /// Allocate a message ID for a message this side originates.
    fn next_message_id(&self) -> u16;

    /// Send one message to the peer.
    fn write_message(
        &self,
        packet: &Packet,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Connection to a peer through the server's shared UDP socket.
#[derive(Debug, Clone)]
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    message_ids: Arc<AtomicU16>,
    exchanges: Arc<ExchangeCache>,
}

impl UdpConnection {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        message_ids: Arc<AtomicU16>,
        exchanges: Arc<ExchangeCache>,
    ) -> Self {
        Self {
            socket,
            peer,
            message_ids,
            exchanges,
        }
    }
}

impl ClientConnection for UdpConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn next_message_id(&self) -> u16 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_message(&self, packet: &Packet) -> Result<(), TransportError> {
        let datagram = packet.to_bytes().map_err(TransportError::Encode)?;
        self.socket.send_to(&datagram, self.peer).await?;

        if matches!(
            packet.message_type(),
            MessageType::Acknowledgement | MessageType::Reset
        ) {
            self.exchanges
                .store_reply(self.peer, packet.header.message_id, &datagram);
        }
        Ok(())
    }
}
