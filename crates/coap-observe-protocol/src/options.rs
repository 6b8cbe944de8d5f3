//! CoAP options and the option encoder.
//!
//! Option values are encoded into a caller-owned scratch buffer. The encoder
//! never allocates on its own: when the buffer is too short it fails with
//! [`OptionError::BufferTooSmall`] carrying the exact size the value needs, and
//! [`encode_with_growth`] grows the buffer by that amount and retries once.
//!
//! A response is encoded in two phases over the same buffer: Content-Format
//! first, then (for notifications only) Observe. The cursor advances past the
//! bytes consumed by each phase.

use std::ops::Range;

use coap_lite::{CoapOption, ContentFormat, Packet};
use thiserror::Error;

/// Largest value the Observe option can carry (three bytes).
pub const MAX_OBSERVE: u32 = 0x00FF_FFFF;

/// Errors raised while encoding or reading options.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptionError {
    /// The buffer cannot hold the value; `needed` is the full encoded size.
    #[error("buffer too small: {needed} bytes needed")]
    BufferTooSmall { needed: usize },

    /// The buffer was grown once and the value still did not fit.
    #[error("option still does not fit after growing buffer ({needed} bytes needed)")]
    GrowthExhausted { needed: usize },

    /// The option is not present.
    #[error("option {0:?} not present")]
    NotFound(CoapOption),

    /// The option is present but its value is malformed.
    #[error("invalid value for option {option:?}: {reason}")]
    InvalidValue {
        option: CoapOption,
        reason: &'static str,
    },
}

/// Size of `value` as a CoAP uint (minimal big-endian, zero is empty).
fn uint_len(value: u32) -> usize {
    4 - (value.leading_zeros() / 8) as usize
}

/// Write `value` as a CoAP uint into the front of `buf`.
///
/// Returns the number of bytes written.
pub fn encode_uint(buf: &mut [u8], value: u32) -> Result<usize, OptionError> {
    let len = uint_len(value);
    if buf.len() < len {
        return Err(OptionError::BufferTooSmall { needed: len });
    }
    let bytes = value.to_be_bytes();
    buf[..len].copy_from_slice(&bytes[4 - len..]);
    Ok(len)
}

/// Read a CoAP uint of up to four bytes.
pub fn decode_uint(bytes: &[u8]) -> Result<u32, OptionError> {
    if bytes.len() > 4 {
        return Err(OptionError::InvalidValue {
            option: CoapOption::Unknown(0),
            reason: "uint longer than 4 bytes",
        });
    }
    Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Run `attempt` on `buf[cursor..]`, growing `buf` once if it reports a shortfall.
///
/// On [`OptionError::BufferTooSmall`] the buffer grows by exactly the reported
/// size and `attempt` runs a second time. A second shortfall becomes
/// [`OptionError::GrowthExhausted`]. Other errors pass through untouched.
pub fn encode_with_growth<F>(buf: &mut Vec<u8>, cursor: usize, mut attempt: F) -> Result<usize, OptionError>
where
    F: FnMut(&mut [u8]) -> Result<usize, OptionError>,
{
    if cursor > buf.len() {
        buf.resize(cursor, 0);
    }

    match attempt(&mut buf[cursor..]) {
        Err(OptionError::BufferTooSmall { needed }) => {
            buf.resize(buf.len() + needed, 0);
            match attempt(&mut buf[cursor..]) {
                Err(OptionError::BufferTooSmall { needed }) => {
                    Err(OptionError::GrowthExhausted { needed })
                }
                other => other,
            }
        }
        other => other,
    }
}

/// Option values produced by an [`OptionEncoder`], in encoding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseOptions {
    entries: Vec<(CoapOption, Vec<u8>)>,
}

impl ResponseOptions {
    /// Value of `option`, if it was encoded.
    pub fn get(&self, option: CoapOption) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(o, _)| *o == option)
            .map(|(_, v)| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move the values onto `packet`.
    pub fn apply_to(self, packet: &mut Packet) {
        for (option, value) in self.entries {
            packet.add_option(option, value);
        }
    }
}

/// Encodes response options into one scratch buffer.
pub struct OptionEncoder<'b> {
    buf: &'b mut Vec<u8>,
    cursor: usize,
    entries: Vec<(CoapOption, Range<usize>)>,
}

impl<'b> OptionEncoder<'b> {
    /// Start encoding at the front of `buf`.
    pub fn new(buf: &'b mut Vec<u8>) -> Self {
        Self {
            buf,
            cursor: 0,
            entries: Vec::new(),
        }
    }

    /// Encode the Content-Format option.
    pub fn set_content_format(&mut self, format: ContentFormat) -> Result<usize, OptionError> {
        let number = u32::try_from(usize::from(format)).map_err(|_| OptionError::InvalidValue {
            option: CoapOption::ContentFormat,
            reason: "format number exceeds 32 bits",
        })?;
        self.set_uint(CoapOption::ContentFormat, number)
    }

    /// Encode the Observe option.
    pub fn set_observe(&mut self, sequence: u32) -> Result<usize, OptionError> {
        if sequence > MAX_OBSERVE {
            return Err(OptionError::InvalidValue {
                option: CoapOption::Observe,
                reason: "sequence exceeds 24 bits",
            });
        }
        self.set_uint(CoapOption::Observe, sequence)
    }

    fn set_uint(&mut self, option: CoapOption, value: u32) -> Result<usize, OptionError> {
        let start = self.cursor;
        let written = encode_with_growth(self.buf, start, |window| encode_uint(window, value))?;
        self.cursor += written;
        self.entries.push((option, start..self.cursor));
        Ok(written)
    }

    /// Bytes of the buffer used so far.
    pub fn bytes_consumed(&self) -> usize {
        self.cursor
    }

    /// Resolve the encoded ranges into owned option values.
    pub fn finish(self) -> (ResponseOptions, usize) {
        let entries = self
            .entries
            .into_iter()
            .map(|(option, range)| (option, self.buf[range].to_vec()))
            .collect();
        (ResponseOptions { entries }, self.cursor)
    }
}

/// Encode the options of a response.
///
/// Content-Format is always set; Observe only when `observe` is given.
/// Returns the option values and the number of buffer bytes consumed.
pub fn encode_response_options(
    buf: &mut Vec<u8>,
    content_format: ContentFormat,
    observe: Option<u32>,
) -> Result<(ResponseOptions, usize), OptionError> {
    let mut encoder = OptionEncoder::new(buf);
    encoder.set_content_format(content_format)?;
    if let Some(sequence) = observe {
        encoder.set_observe(sequence)?;
    }
    Ok(encoder.finish())
}
