//! Accessors over `coap_lite::Packet`.
//!
//! `coap-lite` owns the wire format. This module adds what the server needs on
//! top of it:
//! - Building a packet from type, code, message ID and token in one call
//! - Reading the Observe value with the 3-byte limit enforced
//! - Joining and splitting Uri-Path segments
//! - A one-line summary for request logging

use std::fmt;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};

use crate::options::{decode_uint, OptionError};

/// Protocol version carried in every header.
pub const COAP_VERSION: u8 = 1;

/// Create a message with no options and no payload.
pub fn new_packet(
    message_type: MessageType,
    code: MessageClass,
    message_id: u16,
    token: &[u8],
) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_version(COAP_VERSION);
    packet.header.set_type(message_type);
    packet.header.code = code;
    packet.header.message_id = message_id;
    packet.set_token(token.to_vec());
    packet
}

/// Convenience accessors for requests and responses.
pub trait PacketExt {
    fn message_type(&self) -> MessageType;

    fn is_confirmable(&self) -> bool {
        self.message_type() == MessageType::Confirmable
    }

    /// An empty message carries code 0.00 and nothing else.
    fn is_empty_message(&self) -> bool;

    /// The request method, or `None` for responses and empty messages.
    fn method(&self) -> Option<RequestType>;

    /// The Observe value; at most three bytes are accepted.
    fn observe(&self) -> Result<u32, OptionError>;

    /// Uri-Path segments joined as `/a/b`, or `None` when there are none.
    fn uri_path(&self) -> Option<String>;

    /// Append one Uri-Path option per non-empty segment of `path`.
    fn set_uri_path(&mut self, path: &str);

    fn summary(&self) -> Summary<'_>;
}

impl PacketExt for Packet {
    fn message_type(&self) -> MessageType {
        self.header.get_type()
    }

    fn is_empty_message(&self) -> bool {
        self.header.code == MessageClass::Empty
    }

    fn method(&self) -> Option<RequestType> {
        match self.header.code {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    fn observe(&self) -> Result<u32, OptionError> {
        let raw = self
            .get_option(CoapOption::Observe)
            .and_then(|values| values.front())
            .ok_or(OptionError::NotFound(CoapOption::Observe))?;
        if raw.len() > 3 {
            return Err(OptionError::InvalidValue {
                option: CoapOption::Observe,
                reason: "longer than 3 bytes",
            });
        }
        decode_uint(raw)
    }

    fn uri_path(&self) -> Option<String> {
        let segments: Vec<String> = self
            .get_option(CoapOption::UriPath)?
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        if segments.is_empty() {
            None
        } else {
            Some(format!("/{}", segments.join("/")))
        }
    }

    fn set_uri_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
    }

    fn summary(&self) -> Summary<'_> {
        Summary(self)
    }
}

/// Log line for a packet: type, code, message ID, token, path and payload size.
pub struct Summary<'a>(&'a Packet);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let packet = self.0;
        write!(
            f,
            "{:?} {:?} mid={} token=",
            packet.message_type(),
            packet.header.code,
            packet.header.message_id
        )?;
        for byte in packet.get_token() {
            write!(f, "{byte:02x}")?;
        }
        if let Some(path) = packet.uri_path() {
            write!(f, " path={path}")?;
        }
        write!(f, " payload={}B", packet.payload.len())
    }
}
