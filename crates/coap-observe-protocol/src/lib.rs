//! # coap-observe-protocol
//!
//! CoAP (RFC 7252) message handling on top of `coap-lite`, plus the option
//! encoder used to build Observe (RFC 7641) notifications.

pub mod options;
pub mod packet;

pub use coap_lite::error::MessageError;
pub use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
pub use options::{
    decode_uint, encode_response_options, encode_uint, encode_with_growth, OptionEncoder,
    OptionError, ResponseOptions,
};
pub use packet::{new_packet, PacketExt};
