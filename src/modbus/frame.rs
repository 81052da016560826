use nom_derive::{Nom, Parse};

use super::crc::{crc16, crc_from_wire};
use crate::error::FrameError;

/// Bytes in a read request without its CRC.
pub const REQUEST_HEADER_LEN: usize = 6;
/// Request header plus CRC.
pub const REQUEST_LEN: usize = REQUEST_HEADER_LEN + 2;
/// Largest RTU frame.
pub const MAX_ADU_LEN: usize = 256;

/// The master's read request as it appears on the wire, big endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Nom)]
#[nom(BigEndian)]
pub struct RequestHeader {
    pub slave_address: u8,
    pub function_code: u8,
    pub register_address: u16,
    pub register_count: u16,
}

impl RequestHeader {
    /// Parse and CRC-check a request occupying the first [`REQUEST_LEN`] bytes of `data`.
    pub fn from_request(data: &[u8]) -> Result<Self, FrameError> {
        let short = FrameError::ShortRequest {
            needed: REQUEST_LEN,
            available: data.len(),
        };
        if data.len() < REQUEST_LEN {
            return Err(short);
        }

        let received = crc_from_wire(data[REQUEST_HEADER_LEN], data[REQUEST_HEADER_LEN + 1]);
        let calculated = crc16(&data[..REQUEST_HEADER_LEN]);
        if received != calculated {
            return Err(FrameError::RequestCrc { received, calculated });
        }

        match Self::parse(&data[..REQUEST_HEADER_LEN]) {
            Ok((_, header)) => Ok(header),
            Err(_) => Err(short),
        }
    }

    /// Payload bytes a matching reply carries.
    pub fn expected_byte_count(&self) -> usize {
        usize::from(self.register_count) * 2
    }
}
